//! Broker client abstraction: topology, consumers, and the event loop.
//!
//! The worker never speaks the broker protocol itself. It drives a
//! [`BrokerClient`], which owns a (re)connecting session, re-applies every
//! declared [`Topology`] and [`ConsumerSpec`] whenever a session is
//! established, and multiplexes deliveries and errors into a single stream of
//! [`BrokerEvent`]s.
//!
//! # Driving the client
//!
//! ```text
//! declare(topology) ─┐
//! consume(spec) ─────┤
//!                    ▼
//!        ┌──► next_event() ──► Some(Delivery)        → dispatch
//!        │                 ──► Some(ConsumerError)   → report
//!        │                 ──► Some(ConnectionError) → report (client backs off)
//!        └──────────────── ──► None                  → closed, stop
//! ```
//!
//! `next_event` must be polled continuously by a single task: it is also what
//! advances reconnection.
//!
//! # Implementations
//!
//! - `AmqpClient` (in `purchase-status-amqp`): production, backed by `lapin`
//! - `ScriptedBroker` (in `purchase-status-testing`): deterministic tests

use crate::delivery::{AckMode, Delivery};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;

/// Errors reported by a broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Invalid client configuration (malformed URL, bad option).
    #[error("Broker configuration error: {0}")]
    Configuration(String),

    /// Network or transport failure; the client reconnects with backoff.
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// The broker refused the credentials.
    #[error("Broker authentication failed: {0}")]
    Authentication(String),

    /// A declaration conflicts with an existing entity of the same name.
    #[error("Topology conflict: {0}")]
    TopologyConflict(String),

    /// The broker closed the channel or connection with a protocol error.
    #[error("Broker protocol error: {0}")]
    Protocol(String),

    /// The consumer stream reported an error.
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// The broker cancelled the consumer (queue deleted, channel closed).
    #[error("Consumer '{0}' was cancelled by the broker")]
    ConsumerCancelled(String),

    /// An ack/nack frame could not be sent.
    #[error("Acknowledgment failed: {0}")]
    Acknowledgment(String),

    /// The client was closed by its owner.
    #[error("Broker client is closed")]
    Closed,
}

impl BrokerError {
    /// Whether this error cannot be fixed by reconnecting.
    ///
    /// Fatal errors stop the consumer loop; everything else is reported and
    /// left to the client's backoff.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::TopologyConflict(_))
    }

    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::Authentication(_) => "authentication",
            Self::TopologyConflict(_) => "topology_conflict",
            Self::Protocol(_) => "protocol",
            Self::Consumer(_) => "consumer",
            Self::ConsumerCancelled(_) => "consumer_cancelled",
            Self::Acknowledgment(_) => "acknowledgment",
            Self::Closed => "closed",
        }
    }
}

/// Exchange routing behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// Every bound queue receives every message, routing key ignored.
    #[default]
    Fanout,
    /// Exact routing-key match.
    Direct,
    /// Pattern routing-key match.
    Topic,
    /// Header match.
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Headers => "headers",
        })
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fanout" => Ok(Self::Fanout),
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            other => Err(format!(
                "unknown exchange kind '{other}' (expected 'fanout', 'direct', 'topic' or 'headers')"
            )),
        }
    }
}

/// Queue declaration parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name; empty asks the broker to assign one.
    pub name: String,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
    /// Survive broker restarts.
    pub durable: bool,
    /// Exchange that receives messages dropped with `requeue = false`.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// An auto-delete queue whose name the broker assigns.
    #[must_use]
    pub const fn server_named() -> Self {
        Self {
            name: String::new(),
            auto_delete: true,
            durable: false,
            dead_letter_exchange: None,
        }
    }

    /// Whether the broker chooses the queue name.
    #[must_use]
    pub fn is_server_named(&self) -> bool {
        self.name.is_empty()
    }
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self::server_named()
    }
}

/// Exchange declaration parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Routing behaviour.
    pub kind: ExchangeKind,
    /// Delete the exchange once no queue is bound to it.
    pub auto_delete: bool,
    /// Survive broker restarts.
    pub durable: bool,
}

impl ExchangeSpec {
    /// An auto-delete fanout exchange.
    #[must_use]
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            auto_delete: true,
            durable: false,
        }
    }
}

/// Binding between the topology's queue and exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    /// Routing key; ignored by fanout exchanges but required by the declaration.
    pub routing_key: String,
}

/// One queue, one exchange, and the binding between them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// The queue to consume from.
    pub queue: QueueSpec,
    /// The exchange purchase events are published to.
    pub exchange: ExchangeSpec,
    /// The binding connecting them.
    pub binding: BindingSpec,
}

impl Topology {
    /// Exchange purchase-created events are published to.
    pub const PURCHASE_CREATED_EXCHANGE: &'static str = "purchase.created";

    /// Routing key the purchase-created binding is declared with.
    pub const PURCHASE_CREATED_ROUTING_KEY: &'static str = "pubSub";

    /// The purchase-created topology: server-named auto-delete queue bound to
    /// the auto-delete `purchase.created` fanout exchange with key `pubSub`.
    #[must_use]
    pub fn purchase_created() -> Self {
        Self {
            queue: QueueSpec::server_named(),
            exchange: ExchangeSpec::fanout(Self::PURCHASE_CREATED_EXCHANGE),
            binding: BindingSpec {
                routing_key: Self::PURCHASE_CREATED_ROUTING_KEY.to_string(),
            },
        }
    }
}

/// Consumer registration parameters.
///
/// A consumer reads from the queue of the topology registered under the same
/// `queue` spec; when that queue is server-named the client substitutes the
/// name the broker assigned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSpec {
    /// Consumer tag.
    pub tag: String,
    /// Queue to consume from.
    pub queue: QueueSpec,
    /// Who acknowledges deliveries.
    pub ack_mode: AckMode,
    /// Maximum unacknowledged deliveries the broker pushes (manual mode).
    pub prefetch: u16,
}

/// One item produced by [`BrokerClient::next_event`].
#[derive(Debug)]
pub enum BrokerEvent {
    /// A message to process.
    Delivery(Delivery),
    /// The consumer stream failed; the client re-registers it.
    ConsumerError(BrokerError),
    /// The connection failed or could not be (re)established.
    ConnectionError(BrokerError),
}

/// A reconnecting broker session.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so implementations can be
/// boxed and so every returned future is `Send`.
pub trait BrokerClient: Send {
    /// Register a topology and apply it now if a session is live.
    ///
    /// The topology is re-declared on every later (re)connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TopologyConflict`] if the broker already has an
    /// entity with the same name and different parameters.
    fn declare(
        &mut self,
        topology: Topology,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Register a consumer and start it now if a session is live.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the consumer.
    fn consume(
        &mut self,
        spec: ConsumerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Advance the session and return its next event.
    ///
    /// Returns `None` once the client has been closed. Must be cancel-safe:
    /// dropping the future loses no delivery.
    fn next_event(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerEvent>> + Send + '_>>;

    /// Close the session. Later calls to `next_event` return `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails; the client is closed anyway.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purchase_created_topology_matches_contract() {
        let topology = Topology::purchase_created();
        assert!(topology.queue.is_server_named());
        assert!(topology.queue.auto_delete);
        assert_eq!(topology.exchange.name, "purchase.created");
        assert_eq!(topology.exchange.kind, ExchangeKind::Fanout);
        assert!(topology.exchange.auto_delete);
        assert_eq!(topology.binding.routing_key, "pubSub");
    }

    #[test]
    fn only_configuration_and_conflicts_are_fatal() {
        assert!(BrokerError::Configuration("bad url".into()).is_fatal());
        assert!(BrokerError::TopologyConflict("exchange".into()).is_fatal());
        assert!(!BrokerError::Connection("reset".into()).is_fatal());
        assert!(!BrokerError::Authentication("refused".into()).is_fatal());
        assert!(!BrokerError::ConsumerCancelled("tag".into()).is_fatal());
    }

    #[test]
    fn exchange_kind_renders_protocol_names() {
        assert_eq!(ExchangeKind::Fanout.to_string(), "fanout");
        assert_eq!(ExchangeKind::Topic.to_string(), "topic");
    }

    #[test]
    fn exchange_kind_parses_its_own_names() {
        for kind in [
            ExchangeKind::Fanout,
            ExchangeKind::Direct,
            ExchangeKind::Topic,
            ExchangeKind::Headers,
        ] {
            assert_eq!(kind.to_string().parse(), Ok(kind));
        }
        assert_eq!(" Topic ".parse(), Ok(ExchangeKind::Topic));
        assert!("x-delayed".parse::<ExchangeKind>().is_err());
    }
}
