//! Broker deliveries and their acknowledgment obligation.
//!
//! A [`Delivery`] is owned by exactly one party at a time. Resolving it with
//! [`Delivery::resolve`] consumes it, so the type system guarantees a delivery
//! is acknowledged at most once; the processor guarantees it is acknowledged
//! at least once by resolving on every path.

use crate::broker::BrokerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

/// Final decision for a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Processing succeeded; the broker may forget the message.
    Acked,
    /// Processing failed in a way worth retrying; the broker requeues the message.
    NackedRequeue,
    /// Processing failed permanently; the broker drops (or dead-letters) the message.
    NackedDrop,
}

impl Outcome {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::NackedRequeue => "nacked_requeue",
            Self::NackedDrop => "nacked_drop",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who acknowledges deliveries.
///
/// `Manual` is the default: the broker only forgets a message once the status
/// update is persisted. `Auto` lets the broker consider every message accepted
/// as soon as it is delivered, which loses the message if processing then fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckMode {
    /// The processor acks or nacks each delivery after persistence.
    #[default]
    Manual,
    /// The broker treats deliveries as acknowledged on receipt.
    Auto,
}

impl AckMode {
    /// Whether the broker should be told not to expect acknowledgments.
    #[must_use]
    pub const fn is_auto(self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown ack mode '{other}' (expected 'manual' or 'auto')")),
        }
    }
}

/// Sends acknowledgment frames for one delivery back to the broker.
///
/// Implementations exist for the AMQP client and for tests. The trait uses
/// explicit boxed futures so it can be stored as `Box<dyn Acknowledger>`.
pub trait Acknowledger: Send + Sync {
    /// Accept the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgment`] if the frame could not be sent.
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Refuse the delivery, asking the broker to requeue it or not.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgment`] if the frame could not be sent.
    fn nack(
        &self,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

/// Acknowledger for deliveries consumed in [`AckMode::Auto`].
///
/// The broker already considers these messages accepted, so there is nothing
/// to send.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoAcknowledged;

impl Acknowledger for AutoAcknowledged {
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn nack(
        &self,
        _requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// One message handed from the broker to this worker.
pub struct Delivery {
    body: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    auto_acked: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery that must be resolved through `acker`.
    #[must_use]
    pub fn new(
        body: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            delivery_tag,
            redelivered,
            exchange: String::new(),
            routing_key: String::new(),
            auto_acked: false,
            acker,
        }
    }

    /// Create a delivery the broker has already accepted ([`AckMode::Auto`]).
    #[must_use]
    pub fn auto_acked(body: Vec<u8>, delivery_tag: u64, redelivered: bool) -> Self {
        Self {
            auto_acked: true,
            ..Self::new(body, delivery_tag, redelivered, Box::new(AutoAcknowledged))
        }
    }

    /// Record the exchange and routing key the message arrived through.
    #[must_use]
    pub fn with_route(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    /// Raw message body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Broker-assigned identity of this delivery on its channel.
    #[must_use]
    pub const fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker has delivered this message before.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Exchange the message was published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key the message was published with.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the broker acknowledged this delivery on receipt.
    #[must_use]
    pub const fn is_auto_acked(&self) -> bool {
        self.auto_acked
    }

    /// Send the acknowledgment frame matching `outcome`, consuming the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledgment`] if the frame could not be sent.
    /// The broker redelivers unacknowledged messages when the channel closes.
    pub async fn resolve(self, outcome: Outcome) -> Result<(), BrokerError> {
        match outcome {
            Outcome::Acked => self.acker.ack().await,
            Outcome::NackedRequeue => self.acker.nack(true).await,
            Outcome::NackedDrop => self.acker.nack(false).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("auto_acked", &self.auto_acked)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}
