//! `MongoDB` implementation of [`PurchaseStore`].

use crate::config::MongoConfig;
use mongodb::bson::{Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind, RETRYABLE_WRITE_ERROR};
use mongodb::{Client, Collection};
use purchase_status_core::{PurchaseStatus, PurchaseStore, StatusUpdate, StoreError, TransactionId};
use std::future::Future;
use std::pin::Pin;

/// Purchase store backed by a `MongoDB` collection.
///
/// Records are keyed by transaction id in `_id`. Each update runs in its own
/// causally consistent session taken from the driver's pool; the session is
/// released when the call returns, whatever the result.
#[derive(Clone, Debug)]
pub struct MongoPurchaseStore {
    client: Client,
    purchases: Collection<Document>,
}

impl MongoPurchaseStore {
    /// Connect to the store and verify it answers a ping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the options are invalid and
    /// [`StoreError::Unavailable`] if no server answers.
    pub async fn dial(config: &MongoConfig) -> Result<Self, StoreError> {
        let options = config.client_options().await?;
        let client = Client::with_options(options).map_err(|e| map_error(&e))?;
        let store = Self::from_client(client, config.database(), config.collection());
        store.ping().await?;

        tracing::info!(
            hosts = ?config.hosts(),
            database = config.database(),
            collection = config.collection(),
            "Connected to purchase store"
        );
        Ok(store)
    }

    /// Wrap an existing driver client.
    #[must_use]
    pub fn from_client(client: Client, database: &str, collection: &str) -> Self {
        let purchases = client.database(database).collection::<Document>(collection);
        Self { client, purchases }
    }

    async fn apply(&self, id: &TransactionId, status: &PurchaseStatus) -> Result<StatusUpdate, StoreError> {
        let mut session = self
            .client
            .start_session()
            .causal_consistency(true)
            .await
            .map_err(|e| map_error(&e))?;

        let result = self
            .purchases
            .update_one(status_filter(id), status_update(status))
            .session(&mut session)
            .await
            .map_err(|e| map_error(&e))?;

        Ok(classify(result.matched_count, result.modified_count))
    }
}

impl PurchaseStore for MongoPurchaseStore {
    fn update_status<'a>(
        &'a self,
        id: &'a TransactionId,
        status: &'a PurchaseStatus,
    ) -> Pin<Box<dyn Future<Output = Result<StatusUpdate, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let update = self.apply(id, status).await;
            match &update {
                Ok(result) => tracing::debug!(
                    transaction_id = %id,
                    status = %status,
                    result = result.as_str(),
                    "Status update finished"
                ),
                Err(e) => tracing::warn!(
                    transaction_id = %id,
                    status = %status,
                    error = %e,
                    "Status update failed"
                ),
            }
            update
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.client
                .database("admin")
                .run_command(doc! { "ping": 1 })
                .await
                .map(|_| ())
                .map_err(|e| map_error(&e))
        })
    }
}

fn status_filter(id: &TransactionId) -> Document {
    doc! { "_id": id.as_str() }
}

fn status_update(status: &PurchaseStatus) -> Document {
    doc! { "$set": { "status": status.as_str() } }
}

const fn classify(matched: u64, modified: u64) -> StatusUpdate {
    if matched == 0 {
        StatusUpdate::NotFound
    } else if modified == 0 {
        StatusUpdate::AlreadyCurrent
    } else {
        StatusUpdate::Applied
    }
}

/// Map a driver error to [`StoreError`].
///
/// Network and server selection failures, and anything the server labels as
/// a retryable write, are [`StoreError::Unavailable`] so the delivery is requeued.
fn map_error(err: &MongoError) -> StoreError {
    if err.contains_label(RETRYABLE_WRITE_ERROR) {
        return StoreError::Unavailable(err.to_string());
    }
    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => StoreError::Unavailable(err.to_string()),
        ErrorKind::Authentication { .. } | ErrorKind::InvalidArgument { .. } => {
            StoreError::Configuration(err.to_string())
        }
        _ => StoreError::Database(err.to_string()),
    }
}
