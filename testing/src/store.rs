//! In-memory purchase store.

use purchase_status_core::{PurchaseStatus, PurchaseStore, StatusUpdate, StoreError, TransactionId};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Status given to purchases seeded with [`InMemoryPurchaseStore::with_purchases`].
pub const SEEDED_STATUS: &str = "CREATED";

#[derive(Debug, Default)]
struct Inner {
    records: RwLock<BTreeMap<String, PurchaseStatus>>,
    update_calls: AtomicUsize,
    failures_left: AtomicUsize,
    unavailable: AtomicBool,
    latency: RwLock<Duration>,
}

/// A [`PurchaseStore`] backed by a map, shared between clones.
///
/// Behaves like the document store for the single operation the worker uses:
/// it never creates records, and reports whether an update changed anything.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPurchaseStore {
    inner: Arc<Inner>,
}

impl InMemoryPurchaseStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given purchases, each with status `CREATED`.
    #[must_use]
    pub fn with_purchases<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let store = Self::new();
        for id in ids {
            store.insert(id, PurchaseStatus::new(SEEDED_STATUS));
        }
        store
    }

    /// Insert or overwrite a purchase record.
    pub fn insert(&self, id: impl Into<String>, status: PurchaseStatus) {
        self.write().insert(id.into(), status);
    }

    /// Current status of a purchase, if it exists.
    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<PurchaseStatus> {
        self.read().get(id).cloned()
    }

    /// Copy of every record.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, PurchaseStatus> {
        self.read().clone()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of `update_status` calls received, failed ones included.
    #[must_use]
    pub fn update_calls(&self) -> usize {
        self.inner.update_calls.load(Ordering::SeqCst)
    }

    /// Make the next `count` updates fail with [`StoreError::Unavailable`].
    pub fn fail_next_updates(&self, count: usize) {
        self.inner.failures_left.store(count, Ordering::SeqCst);
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every update by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self
            .inner
            .latency
            .write()
            .unwrap_or_else(PoisonError::into_inner) = latency;
    }

    fn latency(&self) -> Duration {
        *self
            .inner
            .latency
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> bool {
        self.inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, PurchaseStatus>> {
        self.inner
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, PurchaseStatus>> {
        self.inner
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PurchaseStore for InMemoryPurchaseStore {
    fn update_status<'a>(
        &'a self,
        id: &'a TransactionId,
        status: &'a PurchaseStatus,
    ) -> Pin<Box<dyn Future<Output = Result<StatusUpdate, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.inner.update_calls.fetch_add(1, Ordering::SeqCst);

            let latency = self.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            if self.inner.unavailable.load(Ordering::SeqCst) || self.take_failure() {
                return Err(StoreError::Unavailable(
                    "injected store failure".to_string(),
                ));
            }

            let mut records = self.write();
            match records.get_mut(id.as_str()) {
                None => Ok(StatusUpdate::NotFound),
                Some(current) if current == status => Ok(StatusUpdate::AlreadyCurrent),
                Some(current) => {
                    *current = status.clone();
                    Ok(StatusUpdate::Applied)
                }
            }
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            if self.inner.unavailable.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("injected store outage".to_string()))
            } else {
                Ok(())
            }
        })
    }
}
