//! Per-delivery processing: decode, persist, acknowledge.
//!
//! ```text
//! Delivery ──decode──► PurchasePayload ──update_status──► StatusUpdate
//!    │  (malformed)             │ (store error)                │
//!    ▼                          ▼                              ▼
//! MalformedPolicy         NackedRequeue          Acked / MissingPurchasePolicy
//! ```
//!
//! Whatever the path, [`MessageProcessor::process`] sends exactly one
//! acknowledgment frame per delivery.

use crate::metrics::{
    ACK_FAILURES_TOTAL, DELIVERIES_TOTAL, MALFORMED_PAYLOADS_TOTAL, PROCESSING_DURATION,
    STORE_UPDATES_TOTAL,
};
use purchase_status_core::{
    Delivery, Outcome, PayloadError, PurchasePayload, PurchaseStatus, PurchaseStore, StatusUpdate,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// What to do with a delivery whose body cannot be decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Always requeue. A permanently malformed message loops until purged.
    #[default]
    Requeue,
    /// Requeue a fresh delivery; drop one the broker already redelivered.
    ///
    /// Only safe with a dead-letter exchange on the queue, otherwise the
    /// dropped message is lost.
    RequeueOnce,
    /// Drop immediately.
    Drop,
}

impl MalformedPolicy {
    /// Outcome for a malformed delivery.
    #[must_use]
    pub const fn outcome(self, redelivered: bool) -> Outcome {
        match self {
            Self::Requeue => Outcome::NackedRequeue,
            Self::RequeueOnce if redelivered => Outcome::NackedDrop,
            Self::RequeueOnce => Outcome::NackedRequeue,
            Self::Drop => Outcome::NackedDrop,
        }
    }
}

impl FromStr for MalformedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(Self::Requeue),
            "requeue-once" | "requeue_once" => Ok(Self::RequeueOnce),
            "drop" => Ok(Self::Drop),
            other => Err(format!(
                "unknown malformed policy '{other}' (expected 'requeue', 'requeue-once' or 'drop')"
            )),
        }
    }
}

/// What to do when no purchase record matches the transaction id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingPurchasePolicy {
    /// Acknowledge and report the anomaly.
    #[default]
    Acknowledge,
    /// Requeue, waiting for the upstream writer to create the record.
    Requeue,
    /// Drop (dead-letter when the queue has a dead-letter exchange).
    Drop,
}

impl MissingPurchasePolicy {
    /// Outcome for a delivery whose purchase does not exist.
    #[must_use]
    pub const fn outcome(self) -> Outcome {
        match self {
            Self::Acknowledge => Outcome::Acked,
            Self::Requeue => Outcome::NackedRequeue,
            Self::Drop => Outcome::NackedDrop,
        }
    }
}

impl FromStr for MissingPurchasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ack" | "acknowledge" => Ok(Self::Acknowledge),
            "requeue" => Ok(Self::Requeue),
            "drop" => Ok(Self::Drop),
            other => Err(format!(
                "unknown missing purchase policy '{other}' (expected 'ack', 'requeue' or 'drop')"
            )),
        }
    }
}

/// Decisions the processor applies to each delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessorPolicy {
    /// Status written when the payload carries none.
    pub default_status: PurchaseStatus,
    /// Handling of undecodable payloads.
    pub malformed: MalformedPolicy,
    /// Handling of unknown transaction ids.
    pub missing_purchase: MissingPurchasePolicy,
}

/// Turns one delivery into one persisted status transition and one acknowledgment.
///
/// Cheap to share: wrap it in an `Arc` and call [`process`](Self::process)
/// from as many tasks as needed. Each call borrows nothing but the store.
pub struct MessageProcessor {
    store: Arc<dyn PurchaseStore>,
    policy: ProcessorPolicy,
}

impl MessageProcessor {
    /// Create a processor writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PurchaseStore>, policy: ProcessorPolicy) -> Self {
        Self { store, policy }
    }

    /// Decode, persist, and decide the outcome without acknowledging.
    pub async fn decide(&self, delivery: &Delivery) -> Outcome {
        let payload = match PurchasePayload::decode(delivery.body(), &self.policy.default_status) {
            Ok(payload) => payload,
            Err(err) => return self.reject_payload(delivery, &err),
        };

        match self
            .store
            .update_status(&payload.transaction_id, &payload.status)
            .await
        {
            Ok(StatusUpdate::NotFound) => {
                metrics::counter!(STORE_UPDATES_TOTAL, "result" => StatusUpdate::NotFound.as_str())
                    .increment(1);
                let outcome = self.policy.missing_purchase.outcome();
                tracing::warn!(
                    transaction_id = %payload.transaction_id,
                    status = %payload.status,
                    outcome = %outcome,
                    "No purchase matches transaction id"
                );
                outcome
            }
            Ok(update) => {
                metrics::counter!(STORE_UPDATES_TOTAL, "result" => update.as_str()).increment(1);
                tracing::debug!(
                    transaction_id = %payload.transaction_id,
                    status = %payload.status,
                    result = update.as_str(),
                    "Purchase status updated"
                );
                Outcome::Acked
            }
            Err(err) => {
                metrics::counter!(STORE_UPDATES_TOTAL, "result" => "error").increment(1);
                tracing::error!(
                    transaction_id = %payload.transaction_id,
                    status = %payload.status,
                    error = %err,
                    "Failed to update purchase status"
                );
                Outcome::NackedRequeue
            }
        }
    }

    /// Process a delivery and resolve it with the decided outcome.
    ///
    /// Returns the outcome even if the acknowledgment frame could not be sent;
    /// the broker redelivers unacknowledged messages once the channel closes.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let started = Instant::now();
        let outcome = self.decide(&delivery).await;

        let delivery_tag = delivery.delivery_tag();
        if delivery.is_auto_acked() && outcome != Outcome::Acked {
            tracing::warn!(
                delivery_tag,
                outcome = %outcome,
                "Processing failed for an auto-acknowledged delivery; the message will not be redelivered"
            );
        }

        if let Err(err) = delivery.resolve(outcome).await {
            metrics::counter!(ACK_FAILURES_TOTAL).increment(1);
            tracing::error!(
                delivery_tag,
                outcome = %outcome,
                error = %err,
                "Failed to acknowledge delivery"
            );
        }

        metrics::histogram!(PROCESSING_DURATION).record(started.elapsed().as_secs_f64());
        metrics::counter!(DELIVERIES_TOTAL, "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    fn reject_payload(&self, delivery: &Delivery, err: &PayloadError) -> Outcome {
        let reason = match err {
            PayloadError::Malformed(_) => "malformed",
            PayloadError::MissingTransactionId => "missing_transaction_id",
        };
        metrics::counter!(MALFORMED_PAYLOADS_TOTAL, "reason" => reason).increment(1);

        let outcome = self.policy.malformed.outcome(delivery.redelivered());
        let body = delivery.body();
        tracing::warn!(
            delivery_tag = delivery.delivery_tag(),
            redelivered = delivery.redelivered(),
            body_len = body.len(),
            body = %String::from_utf8_lossy(logged_prefix(body)),
            error = %err,
            outcome = %outcome,
            "Rejecting undecodable purchase payload"
        );
        outcome
    }
}

/// Longest body prefix written to logs.
const LOGGED_BODY_LIMIT: usize = 256;

fn logged_prefix(body: &[u8]) -> &[u8] {
    &body[..body.len().min(LOGGED_BODY_LIMIT)]
}
