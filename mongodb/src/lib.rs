//! `MongoDB` persistence gateway for purchase records.
//!
//! [`MongoPurchaseStore`] implements
//! [`PurchaseStore`](purchase_status_core::PurchaseStore): it sets the
//! `status` field of the document whose `_id` is the transaction id, and
//! reports whether the record was missing, already current, or changed.
//!
//! # Example
//!
//! ```no_run
//! use purchase_status_core::{PurchaseStatus, PurchaseStore, TransactionId};
//! use purchase_status_mongodb::{MongoConfig, MongoPurchaseStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MongoConfig::builder()
//!     .hosts(["db-0:27017"])
//!     .credentials("pos", "s3cret".to_string())
//!     .build()?;
//! let store = MongoPurchaseStore::dial(&config).await?;
//!
//! let result = store
//!     .update_status(&TransactionId::new("abc123"), &PurchaseStatus::finished())
//!     .await?;
//! println!("{}", result.as_str());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod store;

pub use config::{DEFAULT_COLLECTION, DEFAULT_DATABASE, MongoConfig, MongoConfigBuilder};
pub use store::MongoPurchaseStore;
