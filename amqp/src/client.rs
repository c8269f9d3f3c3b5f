//! Reconnecting lapin session implementing [`BrokerClient`].

use crate::config::AmqpConfig;
use crate::error::{map_connect_error, map_error};
use crate::topology;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use purchase_status_core::{
    Acknowledger, BrokerClient, BrokerError, BrokerEvent, ConsumerSpec, Delivery, QueueSpec,
    Topology,
};
use purchase_status_runtime::RetryPolicy;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::time::Instant;

type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;
type Establishing = Pin<Box<dyn Future<Output = Result<Session, BrokerError>> + Send>>;

/// Reply code sent with a normal connection close.
const REPLY_SUCCESS: u16 = 200;

/// One live connection with its channel and consumer streams.
struct Session {
    connection: Connection,
    channel: Channel,
    /// Declared queues, by requested spec, with the name the broker gave them.
    queues: Vec<(QueueSpec, String)>,
    deliveries: SelectAll<DeliveryStream>,
}

/// AMQP 0-9-1 broker client with automatic reconnection.
///
/// The client remembers every topology and consumer registered through it.
/// Whenever a session is (re)established, topologies are declared again and
/// consumers registered again, so server-named auto-delete queues come back
/// after the broker dropped them.
///
/// [`next_event`](BrokerClient::next_event) must be polled continuously: it
/// is what notices connection loss and drives reconnection, reporting every
/// failed attempt as a [`BrokerEvent::ConnectionError`].
///
/// # Example
///
/// ```no_run
/// use purchase_status_amqp::{AmqpClient, AmqpConfig};
/// use purchase_status_core::{BrokerClient, BrokerEvent, Topology};
/// use purchase_status_runtime::RetryPolicy;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AmqpConfig::builder()
///     .credentials("guest", "guest".to_string())
///     .vhost("/")
///     .build()?;
/// let mut client = AmqpClient::connect(config, RetryPolicy::default()).await?;
/// client.declare(Topology::purchase_created()).await?;
///
/// while let Some(event) = client.next_event().await {
///     if let BrokerEvent::Delivery(delivery) = event {
///         println!("{} bytes", delivery.body().len());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct AmqpClient {
    config: AmqpConfig,
    backoff: RetryPolicy,
    topologies: Vec<Topology>,
    consumers: Vec<ConsumerSpec>,
    session: Option<Session>,
    establishing: Option<Establishing>,
    generation: u64,
    errors_tx: mpsc::UnboundedSender<(u64, BrokerError)>,
    errors_rx: mpsc::UnboundedReceiver<(u64, BrokerError)>,
    pending: VecDeque<BrokerEvent>,
    attempt: usize,
    retry_at: Option<Instant>,
    closed: bool,
}

impl AmqpClient {
    /// Create a client and try to open the first session.
    ///
    /// A broker that cannot be reached yet is not an error: the failure is
    /// queued as the first [`BrokerEvent::ConnectionError`] and the client
    /// keeps retrying from [`next_event`](BrokerClient::next_event).
    ///
    /// # Errors
    ///
    /// Returns a fatal [`BrokerError`] (see [`BrokerError::is_fatal`]).
    pub async fn connect(config: AmqpConfig, backoff: RetryPolicy) -> Result<Self, BrokerError> {
        let mut client = Self::new(config, backoff);
        client.start_establish();

        if let Some(Err(err)) = client.finish_establish().await {
            if err.is_fatal() {
                return Err(err);
            }
            tracing::warn!(
                url = %client.config.redacted_url(),
                error = %err,
                "Broker not reachable yet, retrying in the background"
            );
            client.schedule_reconnect();
            client.pending.push_back(BrokerEvent::ConnectionError(err));
        }
        Ok(client)
    }

    fn new(config: AmqpConfig, backoff: RetryPolicy) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            config,
            backoff,
            topologies: Vec::new(),
            consumers: Vec::new(),
            session: None,
            establishing: None,
            generation: 0,
            errors_tx,
            errors_rx,
            pending: VecDeque::new(),
            attempt: 0,
            retry_at: None,
            closed: false,
        }
    }

    /// Whether a session is currently open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Start a connection attempt with the current registrations.
    ///
    /// The attempt is owned by the client, so dropping a `next_event` future
    /// mid-handshake leaves it running for the next poll instead of
    /// abandoning a half-open connection.
    fn start_establish(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let url = SecretString::from(self.config.url().expose_secret().to_string());
        let redacted = self.config.redacted_url().to_string();
        let errors = self.errors_tx.clone();
        let topologies = self.topologies.clone();
        let consumers = self.consumers.clone();

        self.establishing = Some(Box::pin(async move {
            let connection = Connection::connect(url.expose_secret(), ConnectionProperties::default())
                .await
                .map_err(|e| map_connect_error(&e))?;

            connection.on_error(move |err| {
                // The receiver lives as long as the client.
                let _ = errors.send((generation, map_error(&err)));
            });

            match open_session(&connection, &topologies, &consumers).await {
                Ok((channel, queues, deliveries)) => {
                    tracing::info!(
                        url = %redacted,
                        generation,
                        topologies = topologies.len(),
                        consumers = consumers.len(),
                        "Broker session established"
                    );
                    Ok(Session {
                        connection,
                        channel,
                        queues,
                        deliveries,
                    })
                }
                Err(err) => {
                    if let Err(close_err) = connection.close(REPLY_SUCCESS, "session setup failed").await {
                        tracing::debug!(error = %close_err, "Failed to close half-open connection");
                    }
                    Err(err)
                }
            }
        }));
    }

    /// Drive the pending connection attempt, if any, to completion.
    ///
    /// Cancel-safe: an interrupted attempt stays in `establishing`.
    async fn finish_establish(&mut self) -> Option<Result<(), BrokerError>> {
        let attempt = self.establishing.as_mut()?;
        let result = attempt.await;
        self.establishing = None;

        Some(result.map(|session| {
            self.session = Some(session);
            self.attempt = 0;
            self.retry_at = None;
        }))
    }

    /// Let a pending connection attempt finish before registering on it.
    async fn settle_establish(&mut self) -> Result<(), BrokerError> {
        match self.finish_establish().await {
            Some(Err(err)) if err.is_fatal() => Err(err),
            Some(Err(err)) => {
                self.schedule_reconnect();
                self.pending.push_back(BrokerEvent::ConnectionError(err));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.jittered_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.retry_at = Some(Instant::now() + delay);
        tracing::info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis(),
            "Broker reconnect scheduled"
        );
    }

    /// Drop the current session and schedule a reconnect.
    fn lose_session(&mut self) {
        if let Some(session) = self.session.take() {
            // Bump so late errors from the old connection are ignored.
            self.generation += 1;
            tokio::spawn(close_session(session, "session reset"));
        }
        self.schedule_reconnect();
    }

    /// Handle a registration that failed on the live session.
    fn registration_failed(&mut self, err: BrokerError) -> Result<(), BrokerError> {
        if err.is_fatal() {
            return Err(err);
        }
        tracing::warn!(error = %err, "Registration failed, it will be applied on reconnect");
        self.lose_session();
        self.pending.push_back(BrokerEvent::ConnectionError(err));
        Ok(())
    }

    async fn poll_event(&mut self) -> Option<BrokerEvent> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            if self.session.is_none() {
                if self.establishing.is_none() {
                    if let Some(at) = self.retry_at {
                        tokio::time::sleep_until(at).await;
                    }
                    self.start_establish();
                }
                if let Some(Err(err)) = self.finish_establish().await {
                    self.schedule_reconnect();
                    return Some(BrokerEvent::ConnectionError(err));
                }
                continue;
            }

            let generation = self.generation;
            let Some(session) = self.session.as_mut() else {
                continue;
            };
            let consuming = !session.deliveries.is_empty();

            tokio::select! {
                biased;

                Some((source, err)) = self.errors_rx.recv() => {
                    if source != generation {
                        continue;
                    }
                    tracing::warn!(error = %err, "Broker connection failed");
                    self.lose_session();
                    return Some(BrokerEvent::ConnectionError(err));
                }
                Some(item) = session.deliveries.next(), if consuming => match item {
                    Ok(delivery) => return Some(BrokerEvent::Delivery(delivery)),
                    Err(err) => {
                        tracing::warn!(error = %err, "Consumer stream failed");
                        // A dead connection fails its consumers too; report the cause.
                        let event = match self.errors_rx.try_recv() {
                            Ok((source, cause)) if source == generation => {
                                BrokerEvent::ConnectionError(cause)
                            }
                            _ => BrokerEvent::ConsumerError(err),
                        };
                        self.lose_session();
                        return Some(event);
                    }
                },
                else => {
                    self.lose_session();
                }
            }
        }
    }
}

async fn close_session(session: Session, reason: &'static str) {
    if let Err(err) = session.connection.close(REPLY_SUCCESS, reason).await {
        tracing::debug!(error = %err, reason, "Failed to close connection");
    }
}

/// Open a channel, declare every topology and start every consumer.
async fn open_session(
    connection: &Connection,
    topologies: &[Topology],
    consumers: &[ConsumerSpec],
) -> Result<(Channel, Vec<(QueueSpec, String)>, SelectAll<DeliveryStream>), BrokerError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| map_error(&e))?;

    let mut queues = Vec::with_capacity(topologies.len());
    for topology in topologies {
        let name = topology::declare(&channel, topology).await?;
        queues.push((topology.queue.clone(), name));
    }

    let mut deliveries = SelectAll::new();
    for spec in consumers {
        deliveries.push(start_consumer(&channel, &queues, spec).await?);
    }
    Ok((channel, queues, deliveries))
}

fn resolve_queue(queues: &[(QueueSpec, String)], spec: &ConsumerSpec) -> Result<String, BrokerError> {
    if let Some((_, name)) = queues.iter().find(|(queue, _)| *queue == spec.queue) {
        return Ok(name.clone());
    }
    if spec.queue.is_server_named() {
        return Err(BrokerError::Configuration(format!(
            "Consumer '{}' reads from a server-named queue that no declared topology provides",
            spec.tag
        )));
    }
    Ok(spec.queue.name.clone())
}

async fn start_consumer(
    channel: &Channel,
    queues: &[(QueueSpec, String)],
    spec: &ConsumerSpec,
) -> Result<DeliveryStream, BrokerError> {
    let queue = resolve_queue(queues, spec)?;
    let auto = spec.ack_mode.is_auto();

    if !auto {
        channel
            .basic_qos(spec.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| map_error(&e))?;
    }

    let consumer = channel
        .basic_consume(
            &queue,
            &spec.tag,
            BasicConsumeOptions {
                no_ack: auto,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| map_error(&e))?;

    tracing::info!(
        queue = %queue,
        consumer_tag = %spec.tag,
        ack_mode = ?spec.ack_mode,
        prefetch = spec.prefetch,
        "Consumer registered"
    );

    let tag = spec.tag.clone();
    Ok(consumer
        .map(move |item| {
            item.map(|delivery| adapt(delivery, auto))
                .map_err(|e| BrokerError::Consumer(e.to_string()))
        })
        .chain(stream::once(async move {
            Err(BrokerError::ConsumerCancelled(tag))
        }))
        .boxed())
}

fn adapt(delivery: lapin::message::Delivery, auto: bool) -> Delivery {
    let exchange = delivery.exchange.as_str().to_string();
    let routing_key = delivery.routing_key.as_str().to_string();
    let adapted = if auto {
        Delivery::auto_acked(delivery.data, delivery.delivery_tag, delivery.redelivered)
    } else {
        Delivery::new(
            delivery.data,
            delivery.delivery_tag,
            delivery.redelivered,
            Box::new(LapinAcknowledger {
                acker: delivery.acker,
            }),
        )
    };
    adapted.with_route(exchange, routing_key)
}

/// Sends `basic.ack` / `basic.nack` for one lapin delivery.
struct LapinAcknowledger {
    acker: Acker,
}

impl Acknowledger for LapinAcknowledger {
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.acker
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())
                .map_err(|e| BrokerError::Acknowledgment(e.to_string()))
        })
    }

    fn nack(
        &self,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue,
                })
                .await
                .map(|_| ())
                .map_err(|e| BrokerError::Acknowledgment(e.to_string()))
        })
    }
}

impl BrokerClient for AmqpClient {
    fn declare(
        &mut self,
        topology: Topology,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(BrokerError::Closed);
            }
            self.settle_establish().await?;

            let applied = match self.session.as_mut() {
                Some(session) => match topology::declare(&session.channel, &topology).await {
                    Ok(name) => {
                        session.queues.push((topology.queue.clone(), name));
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                None => Ok(()),
            };
            self.topologies.push(topology);

            match applied {
                Ok(()) => Ok(()),
                Err(err) => self.registration_failed(err),
            }
        })
    }

    fn consume(
        &mut self,
        spec: ConsumerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(BrokerError::Closed);
            }
            self.settle_establish().await?;

            let applied = match self.session.as_mut() {
                Some(session) => match start_consumer(&session.channel, &session.queues, &spec).await {
                    Ok(stream) => {
                        session.deliveries.push(stream);
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                None => Ok(()),
            };
            self.consumers.push(spec);

            match applied {
                Ok(()) => Ok(()),
                Err(err) => self.registration_failed(err),
            }
        })
    }

    fn next_event(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerEvent>> + Send + '_>> {
        Box::pin(self.poll_event())
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.closed = true;
            self.retry_at = None;
            self.pending.clear();

            if let Some(attempt) = self.establishing.take() {
                tokio::spawn(async move {
                    if let Ok(session) = attempt.await {
                        close_session(session, "worker shutting down").await;
                    }
                });
            }

            if let Some(session) = self.session.take() {
                session
                    .connection
                    .close(REPLY_SUCCESS, "worker shutting down")
                    .await
                    .map_err(|e| map_error(&e))?;
            }
            tracing::info!(url = %self.config.redacted_url(), "Broker client closed");
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use purchase_status_core::AckMode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn spec(queue: QueueSpec) -> ConsumerSpec {
        ConsumerSpec {
            tag: "worker".to_string(),
            queue,
            ack_mode: AckMode::Manual,
            prefetch: 32,
        }
    }

    #[test]
    fn server_named_queue_resolves_to_assigned_name() {
        let queues = vec![(QueueSpec::server_named(), "amq.gen-abc".to_string())];
        let resolved = resolve_queue(&queues, &spec(QueueSpec::server_named()));
        assert_eq!(resolved, Ok("amq.gen-abc".to_string()));
    }

    #[test]
    fn named_queue_without_topology_is_used_as_is() {
        let queue = QueueSpec {
            name: "purchases".to_string(),
            ..QueueSpec::default()
        };
        assert_eq!(resolve_queue(&[], &spec(queue)), Ok("purchases".to_string()));
    }

    #[test]
    fn undeclared_server_named_queue_is_a_configuration_error() {
        let resolved = resolve_queue(&[], &spec(QueueSpec::server_named()));
        assert!(matches!(resolved, Err(BrokerError::Configuration(_))));
    }

    #[test]
    fn client_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<AmqpClient>();
    }

    #[tokio::test]
    async fn interrupted_connect_is_resumed_not_restarted() {
        // Accepts TCP connections but never answers the AMQP handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut silent = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                silent.push(socket);
            }
        });

        let config = AmqpConfig::builder()
            .host(addr.to_string())
            .vhost("/")
            .credentials("guest", "guest".to_string())
            .build()
            .unwrap();
        let mut client = AmqpClient::new(config, RetryPolicy::default());

        for _ in 0..3 {
            let polled = tokio::time::timeout(Duration::from_millis(100), client.next_event()).await;
            assert!(polled.is_err(), "handshake cannot complete");
        }

        assert!(!client.is_connected());
        assert!(client.establishing.is_some());
        assert_eq!(client.generation, 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        client.close().await.unwrap();
        assert!(client.establishing.is_none());
        assert!(client.next_event().await.is_none());
    }
}
