//! AMQP broker client for the purchase status worker.
//!
//! This crate provides [`AmqpClient`], a `lapin`-backed implementation of the
//! [`BrokerClient`](purchase_status_core::BrokerClient) trait from
//! `purchase-status-core`.
//!
//! # Architecture
//!
//! ```text
//!             ┌──────────────────────────┐
//!  connect ──►│        AmqpClient        │◄── declare(Topology)
//!             │  topologies + consumers  │◄── consume(ConsumerSpec)
//!             └────────────┬─────────────┘
//!                          │ (re)establish with backoff
//!                          ▼
//!             ┌──────────────────────────┐
//!             │ Session: connection,     │
//!             │ channel, consumer streams│
//!             └────────────┬─────────────┘
//!                          │ next_event()
//!                          ▼
//!        Delivery │ ConsumerError │ ConnectionError
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once** in manual acknowledgment mode:
//! - A delivery is only forgotten by the broker once it is acked
//! - Unacked deliveries are redelivered (flagged `redelivered`) when the
//!   channel closes, including after a reconnect
//! - `prefetch` bounds how many unacked deliveries the broker pushes
//!
//! In auto mode the broker forgets each message as soon as it is sent.
//!
//! # Topology
//!
//! Every registered [`Topology`](purchase_status_core::Topology) is declared
//! again on each new session: queue (with an optional
//! `x-dead-letter-exchange` argument), exchange, then binding.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod topology;

pub use client::AmqpClient;
pub use config::{AmqpConfig, AmqpConfigBuilder};
pub use topology::DEAD_LETTER_EXCHANGE_ARG;
