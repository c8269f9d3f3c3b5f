//! Prometheus metrics for the purchase status worker.
//!
//! Recording goes through the `metrics` facade and is a no-op until an
//! exporter is installed, so library code and tests can record freely.
//!
//! # Example
//!
//! ```rust,no_run
//! use purchase_status_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve /metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Deliveries processed, labelled by `outcome`.
pub const DELIVERIES_TOTAL: &str = "purchase_status_deliveries_total";
/// Time from dispatch to acknowledgment.
pub const PROCESSING_DURATION: &str = "purchase_status_processing_duration_seconds";
/// Store updates, labelled by `result`.
pub const STORE_UPDATES_TOTAL: &str = "purchase_status_store_updates_total";
/// Payloads that failed to decode, labelled by `reason`.
pub const MALFORMED_PAYLOADS_TOTAL: &str = "purchase_status_malformed_payloads_total";
/// Acknowledgment frames that could not be sent.
pub const ACK_FAILURES_TOTAL: &str = "purchase_status_ack_failures_total";
/// Broker errors observed by the consumer loop, labelled by `source` and `kind`.
pub const BROKER_ERRORS_TOTAL: &str = "purchase_status_broker_errors_total";
/// Deliveries currently being processed.
pub const IN_FLIGHT: &str = "purchase_status_in_flight";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Address the scrape endpoint listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether [`start`](Self::start) installed the exporter.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Register metric descriptions and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed
    /// (for example when another recorder is already installed).
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        self.started = true;
        tracing::info!(addr = %self.addr, "Metrics exporter listening on http://{}/metrics", self.addr);
        Ok(())
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(DELIVERIES_TOTAL, "Deliveries processed, by outcome");
    describe_histogram!(
        PROCESSING_DURATION,
        "Time from dispatch until the delivery was acknowledged"
    );
    describe_counter!(STORE_UPDATES_TOTAL, "Purchase status updates, by result");
    describe_counter!(
        MALFORMED_PAYLOADS_TOTAL,
        "Delivery bodies that could not be decoded into a purchase"
    );
    describe_counter!(ACK_FAILURES_TOTAL, "Acknowledgment frames that could not be sent");
    describe_counter!(
        BROKER_ERRORS_TOTAL,
        "Consumer and connection errors reported by the broker client"
    );
    describe_gauge!(IN_FLIGHT, "Deliveries currently being processed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_is_not_started_until_requested() {
        let server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        assert!(!server.is_started());
        assert_eq!(server.addr().ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn registering_descriptions_without_recorder_is_harmless() {
        register_metrics();
        register_metrics();
    }
}
