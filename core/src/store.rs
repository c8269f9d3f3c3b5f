//! Purchase record persistence.
//!
//! The only write this worker performs is "set the status of purchase `id`".
//! The operation is idempotent: applying the same `(id, status)` pair any
//! number of times leaves the record in the same state, which is what makes
//! requeue-and-retry safe.
//!
//! # Implementations
//!
//! - `MongoPurchaseStore` (in `purchase-status-mongodb`): production
//! - `InMemoryPurchaseStore` (in `purchase-status-testing`): tests

use crate::purchase::{PurchaseStatus, TransactionId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (network, server selection, timeout).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed the operation.
    #[error("Database error: {0}")]
    Database(String),

    /// The store client is misconfigured.
    #[error("Store configuration error: {0}")]
    Configuration(String),
}

/// Effect of a status update on the persisted record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusUpdate {
    /// The record existed and its status changed.
    Applied,
    /// The record existed and already had this status.
    AlreadyCurrent,
    /// No record has this transaction id.
    NotFound,
}

impl StatusUpdate {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadyCurrent => "already_current",
            Self::NotFound => "not_found",
        }
    }
}

/// Persistence gateway for purchase records.
///
/// Implementations must be safe to call concurrently: each call acquires its
/// own session from a shared pool and releases it on every exit path.
pub trait PurchaseStore: Send + Sync {
    /// Set the status of the purchase keyed by `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update could not be performed. A missing
    /// record is not an error; it is reported as [`StatusUpdate::NotFound`].
    fn update_status<'a>(
        &'a self,
        id: &'a TransactionId,
        status: &'a PurchaseStatus,
    ) -> Pin<Box<dyn Future<Output = Result<StatusUpdate, StoreError>> + Send + 'a>>;

    /// Check that the store is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if it is not.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
