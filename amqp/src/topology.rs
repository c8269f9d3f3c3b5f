//! Queue, exchange and binding declarations.
//!
//! Declarations are idempotent on the broker: declaring an entity that
//! already exists with the same parameters is a no-op, while different
//! parameters close the channel with `PRECONDITION_FAILED`, which surfaces as
//! [`BrokerError::TopologyConflict`].

use crate::error::map_error;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use purchase_status_core::{BrokerError, ExchangeKind, QueueSpec, Topology};

/// Queue argument naming the exchange that receives dropped deliveries.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Declare `topology` on `channel`; returns the queue name, which the broker
/// assigns when the spec leaves it empty.
pub(crate) async fn declare(channel: &Channel, topology: &Topology) -> Result<String, BrokerError> {
    let queue = channel
        .queue_declare(
            &topology.queue.name,
            QueueDeclareOptions {
                durable: topology.queue.durable,
                auto_delete: topology.queue.auto_delete,
                ..QueueDeclareOptions::default()
            },
            queue_arguments(&topology.queue),
        )
        .await
        .map_err(|e| map_error(&e))?;
    let queue_name = queue.name().as_str().to_string();

    channel
        .exchange_declare(
            &topology.exchange.name,
            exchange_kind(topology.exchange.kind),
            ExchangeDeclareOptions {
                durable: topology.exchange.durable,
                auto_delete: topology.exchange.auto_delete,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| map_error(&e))?;

    channel
        .queue_bind(
            &queue_name,
            &topology.exchange.name,
            &topology.binding.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| map_error(&e))?;

    tracing::info!(
        queue = %queue_name,
        exchange = %topology.exchange.name,
        kind = %topology.exchange.kind,
        routing_key = %topology.binding.routing_key,
        dead_letter_exchange = topology.queue.dead_letter_exchange.as_deref(),
        "Topology declared"
    );
    Ok(queue_name)
}

pub(crate) fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = queue.dead_letter_exchange.as_deref() {
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(exchange.into()),
        );
    }
    arguments
}

pub(crate) fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}
