//! # Purchase Status Testing
//!
//! Test doubles for the purchase status worker.
//!
//! This crate provides:
//! - [`InMemoryPurchaseStore`]: a [`PurchaseStore`](purchase_status_core::PurchaseStore)
//!   with failure and latency injection
//! - [`AckLog`]: records every ack/nack a delivery sends
//! - [`ScriptedBroker`]: a [`BrokerClient`](purchase_status_core::BrokerClient)
//!   driven by a test through its [`ScriptedBrokerHandle`]
//!
//! ## Example
//!
//! ```
//! use purchase_status_core::{Outcome, PurchaseStatus, PurchaseStore, TransactionId};
//! use purchase_status_testing::{AckCall, AckLog, InMemoryPurchaseStore, test_delivery};
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryPurchaseStore::with_purchases(["abc123"]);
//! store
//!     .update_status(&TransactionId::new("abc123"), &PurchaseStatus::finished())
//!     .await
//!     .unwrap();
//! assert_eq!(store.status_of("abc123").unwrap().as_str(), "FINISHED");
//!
//! let log = AckLog::new();
//! test_delivery(&log, b"{}").resolve(Outcome::Acked).await.unwrap();
//! assert_eq!(log.calls(), vec![AckCall::Ack]);
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod store;

pub use broker::{AckCall, AckLog, ScriptedBroker, ScriptedBrokerHandle, test_delivery};
pub use store::InMemoryPurchaseStore;
