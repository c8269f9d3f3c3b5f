//! # Purchase Status Runtime
//!
//! Runtime for the purchase status worker.
//!
//! ## Core Components
//!
//! - **[`MessageProcessor`]**: decodes one delivery, persists the status
//!   transition and resolves the delivery with exactly one ack or nack
//! - **[`ConsumerLoop`]**: drives a [`BrokerClient`](purchase_status_core::BrokerClient),
//!   dispatching deliveries to supervised tasks under a concurrency bound
//! - **[`retry`]**: exponential backoff with jitter, shared by startup dialing
//!   and broker reconnects
//! - **[`metrics`]**: Prometheus metric names and exporter
//!
//! ## Example
//!
//! ```ignore
//! use purchase_status_runtime::{ConsumerLoop, ConsumerLoopConfig, MessageProcessor, ProcessorPolicy};
//! use std::sync::Arc;
//!
//! let processor = Arc::new(MessageProcessor::new(store, ProcessorPolicy::default()));
//! let report = ConsumerLoop::new(client, processor, ConsumerLoopConfig::default())
//!     .run(Topology::purchase_created(), consumer_spec, shutdown_signal())
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod metrics;
pub mod processor;
pub mod retry;

pub use consumer::{ConsumerError, ConsumerLoop, ConsumerLoopConfig, ConsumerReport};
pub use processor::{MalformedPolicy, MessageProcessor, MissingPurchasePolicy, ProcessorPolicy};
pub use retry::{RetryPolicy, retry_with_predicate};
