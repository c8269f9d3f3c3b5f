//! # Purchase Status Core
//!
//! Core traits and types for the purchase status worker.
//!
//! The worker consumes purchase-created events from a message broker and moves
//! the matching persisted purchase to its target status. This crate holds the
//! vocabulary every other crate shares:
//!
//! - [`purchase`]: the decoded event ([`PurchasePayload`]) and its key types
//! - [`delivery`]: broker deliveries, their [`Outcome`] and acknowledgment
//! - [`broker`]: the [`BrokerClient`] abstraction and topology specs
//! - [`store`]: the [`PurchaseStore`] persistence gateway
//!
//! ## Flow
//!
//! ```text
//! BrokerClient ──Delivery──► MessageProcessor ──update_status──► PurchaseStore
//!      ▲                            │
//!      └──────── ack / nack ────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod delivery;
pub mod purchase;
pub mod store;

pub use broker::{
    BindingSpec, BrokerClient, BrokerError, BrokerEvent, ConsumerSpec, ExchangeKind, ExchangeSpec,
    QueueSpec, Topology,
};
pub use delivery::{AckMode, Acknowledger, AutoAcknowledged, Delivery, Outcome};
pub use purchase::{PayloadError, PurchasePayload, PurchaseStatus, TransactionId};
pub use store::{PurchaseStore, StatusUpdate, StoreError};
