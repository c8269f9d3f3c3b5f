//! Purchase status worker.
//!
//! Listens for purchase-created events on the `purchase.created` fanout
//! exchange and marks the referenced purchase as finished in `MongoDB`.
//!
//! # Running
//!
//! ```bash
//! export CLOUD_AMQP_USER=tenant CLOUD_AMQP_PASSWORD=...
//! export MONGO_USR=pos MONGO_PWD=... MONGO_HOSTS=db-0:27017,db-1:27017
//! cargo run -p purchase-status-worker
//! ```
//!
//! Configuration is read from the environment (and a `.env` file when
//! present); see [`config::WorkerConfig`]. `SIGINT` or `SIGTERM` stops intake
//! and waits for in-flight deliveries before exiting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;

use anyhow::{Context, Result};
use config::WorkerConfig;
use purchase_status_amqp::AmqpClient;
use purchase_status_core::StoreError;
use purchase_status_mongodb::MongoPurchaseStore;
use purchase_status_runtime::metrics::MetricsServer;
use purchase_status_runtime::{ConsumerLoop, MessageProcessor, RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is normal in deployed environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = WorkerConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        broker = config.amqp.redacted_url(),
        exchange = %config.topology.exchange.name,
        queue = %config.topology.queue.name,
        ack_mode = ?config.consumer.ack_mode,
        max_in_flight = config.consumer_loop.max_in_flight,
        "Starting purchase status worker"
    );

    let _metrics = match config.metrics_addr {
        Some(addr) => {
            let mut server = MetricsServer::new(addr);
            server.start().context("Failed to start metrics exporter")?;
            Some(server)
        }
        None => None,
    };

    let store = dial_store(&config).await?;
    let processor = Arc::new(MessageProcessor::new(Arc::new(store), config.processor));

    let client = AmqpClient::connect(config.amqp, config.reconnect)
        .await
        .context("Failed to create broker client")?;

    let report = ConsumerLoop::new(client, processor, config.consumer_loop)
        .run(config.topology, config.consumer, shutdown_signal())
        .await
        .context("Consumer stopped")?;

    tracing::info!(
        dispatched = report.dispatched,
        acked = report.acked,
        nacked_requeue = report.nacked_requeue,
        nacked_drop = report.nacked_drop,
        panicked = report.panicked,
        "Purchase status worker stopped"
    );
    Ok(())
}

/// Install the global subscriber: `RUST_LOG` filter, text or JSON output.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("purchase_status=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

/// Dial the store, retrying while it is unreachable.
async fn dial_store(config: &WorkerConfig) -> Result<MongoPurchaseStore> {
    let policy = RetryPolicy::builder()
        .max_retries(5)
        .initial_delay(Duration::from_secs(1))
        .max_delay(Duration::from_secs(15))
        .build();

    retry_with_predicate(
        policy,
        || MongoPurchaseStore::dial(&config.mongo),
        |e| matches!(e, StoreError::Unavailable(_)),
    )
    .await
    .context("Failed to connect to purchase store")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    }
}
