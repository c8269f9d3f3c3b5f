//! The consumer loop: broker events in, supervised processing tasks out.
//!
//! [`ConsumerLoop::run`] declares the topology, registers the consumer and
//! then multiplexes three sources until told to stop:
//!
//! 1. the shutdown future (highest priority)
//! 2. finished processing tasks, which are reaped into the [`ConsumerReport`]
//! 3. broker events: deliveries are dispatched, errors are logged
//!
//! A delivery is only pulled from the broker once a slot under
//! `max_in_flight` is free, so back-pressure reaches the broker's prefetch
//! window instead of piling up in memory.

use crate::metrics::{BROKER_ERRORS_TOTAL, IN_FLIGHT};
use crate::processor::MessageProcessor;
use purchase_status_core::{BrokerClient, BrokerError, BrokerEvent, ConsumerSpec, Outcome, Topology};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};

/// Errors that end a consumer loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The broker reported an error that reconnecting cannot fix.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Processing tasks were still running when the shutdown timeout expired.
    #[error("Shutdown timed out with {0} deliveries still in flight")]
    ShutdownTimeout(usize),
}

/// Consumer loop tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerLoopConfig {
    /// Maximum deliveries processed concurrently.
    pub max_in_flight: usize,
    /// How long shutdown waits for in-flight deliveries.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerLoopConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// What a consumer loop did before it stopped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Deliveries handed to a processing task.
    pub dispatched: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries returned to the queue.
    pub nacked_requeue: u64,
    /// Deliveries dropped or dead-lettered.
    pub nacked_drop: u64,
    /// Processing tasks that panicked.
    pub panicked: u64,
    /// Consumer-level errors reported by the broker client.
    pub consumer_errors: u64,
    /// Connection-level errors reported by the broker client.
    pub connection_errors: u64,
}

impl ConsumerReport {
    /// Deliveries whose processing finished, whatever the outcome.
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.acked + self.nacked_requeue + self.nacked_drop
    }

    const fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acked => self.acked += 1,
            Outcome::NackedRequeue => self.nacked_requeue += 1,
            Outcome::NackedDrop => self.nacked_drop += 1,
        }
    }

    fn reap(&mut self, joined: Result<Outcome, JoinError>) {
        match joined {
            Ok(outcome) => self.record(outcome),
            Err(err) if err.is_panic() => {
                self.panicked += 1;
                tracing::error!(error = %err, "Delivery processing task panicked");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Delivery processing task was cancelled");
            }
        }
    }
}

/// Drives a [`BrokerClient`] and dispatches its deliveries to a [`MessageProcessor`].
pub struct ConsumerLoop<B> {
    client: B,
    processor: Arc<MessageProcessor>,
    config: ConsumerLoopConfig,
}

impl<B: BrokerClient> ConsumerLoop<B> {
    /// Create a loop over `client`.
    #[must_use]
    pub const fn new(client: B, processor: Arc<MessageProcessor>, config: ConsumerLoopConfig) -> Self {
        Self {
            client,
            processor,
            config,
        }
    }

    /// Declare `topology`, consume with `spec`, and process deliveries until
    /// `shutdown` completes, the broker stream ends, or a fatal error occurs.
    ///
    /// The client is closed before returning.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Broker`] if declaration or registration fails, or the
    ///   broker reports a fatal error while running
    /// - [`ConsumerError::ShutdownTimeout`] if in-flight deliveries outlive
    ///   `shutdown_timeout`; those tasks are detached, not aborted
    pub async fn run<S>(
        self,
        topology: Topology,
        spec: ConsumerSpec,
        shutdown: S,
    ) -> Result<ConsumerReport, ConsumerError>
    where
        S: Future<Output = ()>,
    {
        let Self {
            mut client,
            processor,
            config,
        } = self;

        if let Err(err) = Self::start(&mut client, topology, spec).await {
            close_client(&mut client).await;
            return Err(err.into());
        }

        let semaphore = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let mut report = ConsumerReport::default();
        let mut permit: Option<OwnedSemaphorePermit> = None;
        let mut fatal: Option<BrokerError> = None;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    tracing::info!("Shutdown requested, no longer accepting deliveries");
                    break;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    report.reap(joined);
                    set_in_flight(tasks.len());
                }

                acquired = Arc::clone(&semaphore).acquire_owned(), if permit.is_none() => {
                    match acquired {
                        Ok(acquired) => permit = Some(acquired),
                        Err(_) => break,
                    }
                }

                event = client.next_event(), if permit.is_some() => match event {
                    None => {
                        tracing::info!("Broker event stream ended");
                        break;
                    }
                    Some(BrokerEvent::Delivery(delivery)) => {
                        let Some(slot) = permit.take() else { continue };
                        let processor = Arc::clone(&processor);
                        tasks.spawn(async move {
                            let _slot = slot;
                            processor.process(delivery).await
                        });
                        report.dispatched += 1;
                        set_in_flight(tasks.len());
                    }
                    Some(BrokerEvent::ConsumerError(err)) => {
                        report.consumer_errors += 1;
                        if observe_error("consumer", &err) {
                            fatal = Some(err);
                            break;
                        }
                    }
                    Some(BrokerEvent::ConnectionError(err)) => {
                        report.connection_errors += 1;
                        if observe_error("connection", &err) {
                            fatal = Some(err);
                            break;
                        }
                    }
                },
            }
        }
        drop(permit);

        let pending = drain(&mut tasks, &mut report, config.shutdown_timeout).await;
        close_client(&mut client).await;

        tracing::info!(
            dispatched = report.dispatched,
            acked = report.acked,
            nacked_requeue = report.nacked_requeue,
            nacked_drop = report.nacked_drop,
            panicked = report.panicked,
            consumer_errors = report.consumer_errors,
            connection_errors = report.connection_errors,
            pending,
            "Consumer loop stopped"
        );

        if let Some(err) = fatal {
            return Err(ConsumerError::Broker(err));
        }
        if pending > 0 {
            return Err(ConsumerError::ShutdownTimeout(pending));
        }
        Ok(report)
    }

    async fn start(client: &mut B, topology: Topology, spec: ConsumerSpec) -> Result<(), BrokerError> {
        tracing::info!(
            exchange = %topology.exchange.name,
            kind = %topology.exchange.kind,
            routing_key = %topology.binding.routing_key,
            "Declaring topology"
        );
        client.declare(topology).await?;

        tracing::info!(
            consumer_tag = %spec.tag,
            ack_mode = ?spec.ack_mode,
            prefetch = spec.prefetch,
            "Registering consumer"
        );
        client.consume(spec).await
    }
}

/// Log and count a broker error; returns whether it is fatal.
fn observe_error(source: &'static str, err: &BrokerError) -> bool {
    metrics::counter!(BROKER_ERRORS_TOTAL, "source" => source, "kind" => err.kind()).increment(1);
    if err.is_fatal() {
        tracing::error!(source, error = %err, "Fatal broker error, stopping consumer");
        true
    } else {
        tracing::warn!(source, error = %err, "Broker error");
        false
    }
}

/// Wait for in-flight tasks; returns how many were detached on timeout.
async fn drain(tasks: &mut JoinSet<Outcome>, report: &mut ConsumerReport, timeout: Duration) -> usize {
    if tasks.is_empty() {
        return 0;
    }
    tracing::info!(in_flight = tasks.len(), "Waiting for in-flight deliveries");

    let drained = tokio::time::timeout(timeout, async {
        while let Some(joined) = tasks.join_next().await {
            report.reap(joined);
        }
    })
    .await;

    let pending = tasks.len();
    if drained.is_err() {
        tracing::warn!(
            pending,
            timeout_secs = timeout.as_secs_f64(),
            "Shutdown timeout expired, detaching in-flight deliveries"
        );
        tasks.detach_all();
    }
    set_in_flight(0);
    pending
}

async fn close_client<B: BrokerClient>(client: &mut B) {
    if let Err(err) = client.close().await {
        tracing::warn!(error = %err, "Failed to close broker client");
    }
}

#[allow(clippy::cast_precision_loss)]
fn set_in_flight(count: usize) {
    metrics::gauge!(IN_FLIGHT).set(count as f64);
}
