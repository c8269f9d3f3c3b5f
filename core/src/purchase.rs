//! Purchase event payload and the strong types it is keyed by.
//!
//! A purchase-created message is untrusted input. Decoding applies the status
//! default *before* looking at the body, so a payload that omits `status`
//! (or sends `null`) still yields a well-defined target state, and refuses any
//! payload without a usable transaction identifier.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while decoding a delivery body into a [`PurchasePayload`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// The body is not a JSON object of the expected shape.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The body decoded but carries no usable transaction identifier.
    #[error("Payload has no transaction identifier")]
    MissingTransactionId,
}

/// Identifier of a purchase transaction, the key of a persisted purchase record.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty (or whitespace-only) input
/// - `new()` and `From`: no validation (trusted input only)
///
/// # Examples
///
/// ```
/// use purchase_status_core::purchase::TransactionId;
///
/// let id: TransactionId = "abc123".parse().unwrap();
/// assert_eq!(id.as_str(), "abc123");
/// assert!("".parse::<TransactionId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a transaction id without validation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the id, returning the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TransactionId {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(PayloadError::MissingTransactionId);
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Target status of a purchase.
///
/// Statuses are an open, string-valued set owned by the upstream purchase
/// service; this worker only needs to carry them through. [`PurchaseStatus::FINISHED`]
/// is the state a purchase enters once this worker has processed it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PurchaseStatus(String);

impl PurchaseStatus {
    /// Status string written when a purchase completes processing.
    pub const FINISHED: &'static str = "FINISHED";

    /// Create a status from any string.
    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    /// The `FINISHED` status.
    #[must_use]
    pub fn finished() -> Self {
        Self(Self::FINISHED.to_string())
    }

    /// Borrow the status as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PurchaseStatus {
    fn default() -> Self {
        Self::finished()
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PurchaseStatus {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Wire shape of a purchase-created body before validation.
#[derive(Deserialize)]
struct RawPurchase {
    #[serde(rename = "transactionId", default)]
    transaction_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// A decoded purchase-created event.
///
/// Fields other than `transactionId` and `status` are kept in [`extra`](Self::extra)
/// so newer producers can add data without breaking this consumer.
#[derive(Clone, Debug, PartialEq)]
pub struct PurchasePayload {
    /// Key of the purchase record to update.
    pub transaction_id: TransactionId,
    /// Status to write.
    pub status: PurchaseStatus,
    /// Every other field of the message body.
    pub extra: Map<String, Value>,
}

impl PurchasePayload {
    /// Decode a delivery body, applying `default_status` when the body has none.
    ///
    /// # Errors
    ///
    /// - [`PayloadError::Malformed`] if the body is not a JSON object with
    ///   string-typed `transactionId`/`status` fields
    /// - [`PayloadError::MissingTransactionId`] if the id is absent or empty
    ///
    /// # Examples
    ///
    /// ```
    /// use purchase_status_core::purchase::{PurchasePayload, PurchaseStatus};
    ///
    /// let payload = PurchasePayload::decode(
    ///     br#"{"transactionId":"abc123"}"#,
    ///     &PurchaseStatus::finished(),
    /// ).unwrap();
    /// assert_eq!(payload.status.as_str(), "FINISHED");
    /// ```
    pub fn decode(body: &[u8], default_status: &PurchaseStatus) -> Result<Self, PayloadError> {
        // Safe default first; the body may override it.
        let mut status = default_status.clone();

        let raw: RawPurchase =
            serde_json::from_slice(body).map_err(|e| PayloadError::Malformed(e.to_string()))?;

        if let Some(s) = raw.status {
            status = PurchaseStatus(s);
        }

        let transaction_id = raw
            .transaction_id
            .ok_or(PayloadError::MissingTransactionId)?
            .parse::<TransactionId>()?;

        Ok(Self {
            transaction_id,
            status,
            extra: raw.extra,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn finished() -> PurchaseStatus {
        PurchaseStatus::finished()
    }

    #[test]
    fn decodes_id_and_status() {
        let payload =
            PurchasePayload::decode(br#"{"transactionId":"abc123","status":"FINISHED"}"#, &finished())
                .unwrap();
        assert_eq!(payload.transaction_id, TransactionId::new("abc123"));
        assert_eq!(payload.status.as_str(), "FINISHED");
        assert!(payload.extra.is_empty());
    }

    #[test]
    fn missing_status_uses_default() {
        let payload = PurchasePayload::decode(
            br#"{"transactionId":"t-1"}"#,
            &PurchaseStatus::new("DONE"),
        )
        .unwrap();
        assert_eq!(payload.status.as_str(), "DONE");
    }

    #[test]
    fn null_status_uses_default() {
        let payload =
            PurchasePayload::decode(br#"{"transactionId":"t-1","status":null}"#, &finished()).unwrap();
        assert_eq!(payload.status, finished());
    }

    #[test]
    fn explicit_status_overrides_default() {
        let payload = PurchasePayload::decode(
            br#"{"transactionId":"t-1","status":"CANCELLED"}"#,
            &finished(),
        )
        .unwrap();
        assert_eq!(payload.status.as_str(), "CANCELLED");
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let payload = PurchasePayload::decode(
            br#"{"transactionId":"t-1","amount":12.5,"items":[{"sku":"A"}]}"#,
            &finished(),
        )
        .unwrap();
        assert_eq!(payload.extra.get("amount"), Some(&serde_json::json!(12.5)));
        assert!(payload.extra.contains_key("items"));
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = PurchasePayload::decode(b"{not valid json", &finished()).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn non_object_is_malformed() {
        let err = PurchasePayload::decode(b"[1,2,3]", &finished()).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn wrongly_typed_id_is_malformed() {
        let err = PurchasePayload::decode(br#"{"transactionId":42}"#, &finished()).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn missing_or_empty_id_is_rejected() {
        for body in [
            &br#"{"status":"FINISHED"}"#[..],
            br#"{"transactionId":""}"#,
            br#"{"transactionId":"   "}"#,
            br#"{"transactionId":null}"#,
        ] {
            assert_eq!(
                PurchasePayload::decode(body, &finished()),
                Err(PayloadError::MissingTransactionId)
            );
        }
    }

    proptest! {
        #[test]
        fn decoding_arbitrary_bytes_never_panics(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = PurchasePayload::decode(&body, &finished());
        }

        #[test]
        fn decoded_id_matches_body(id in "[A-Za-z0-9-]{1,32}", status in "[A-Z_]{1,16}") {
            let body = serde_json::json!({ "transactionId": id, "status": status }).to_string();
            let payload = PurchasePayload::decode(body.as_bytes(), &finished()).unwrap();
            prop_assert_eq!(payload.transaction_id.as_str(), id.as_str());
            prop_assert_eq!(payload.status.as_str(), status.as_str());
        }
    }
}
