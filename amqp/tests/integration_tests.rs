//! Integration tests for [`AmqpClient`] against a real RabbitMQ broker.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require
//! Docker to be running (for testcontainers) and take several seconds to
//! start the broker.
//!
//! ```bash
//! cargo test -p purchase-status-amqp --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use purchase_status_amqp::{AmqpClient, AmqpConfig};
use purchase_status_core::{
    AckMode, BrokerClient, BrokerError, BrokerEvent, ConsumerSpec, Delivery, Outcome, QueueSpec,
    Topology,
};
use purchase_status_runtime::RetryPolicy;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use testcontainers::core::ExecCommand;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::rabbitmq::RabbitMq;

const AMQP_PORT: u16 = 5672;

async fn start_broker() -> (ContainerAsync<RabbitMq>, AmqpConfig) {
    let container = RabbitMq::default()
        .with_tag("3.13-management")
        .start()
        .await
        .expect("Failed to start RabbitMQ container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(AMQP_PORT)
        .await
        .expect("Failed to get port");

    let config = AmqpConfig::builder()
        .host(format!("{host}:{port}"))
        .vhost("/")
        .credentials("guest", "guest".to_string())
        .build()
        .expect("Failed to build config");

    (container, config)
}

fn fast_backoff() -> RetryPolicy {
    RetryPolicy::builder()
        .initial_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(1))
        .build()
}

fn consumer_spec() -> ConsumerSpec {
    ConsumerSpec {
        tag: "integration-test".to_string(),
        queue: QueueSpec::server_named(),
        ack_mode: AckMode::Manual,
        prefetch: 8,
    }
}

async fn publish(config: &AmqpConfig, body: &[u8]) {
    let connection = Connection::connect(config.url().expose_secret(), ConnectionProperties::default())
        .await
        .expect("Failed to connect publisher");
    let channel = connection
        .create_channel()
        .await
        .expect("Failed to open publisher channel");
    channel
        .basic_publish(
            Topology::PURCHASE_CREATED_EXCHANGE,
            Topology::PURCHASE_CREATED_ROUTING_KEY,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default(),
        )
        .await
        .expect("Failed to publish")
        .await
        .expect("Publish was not confirmed");
    connection
        .close(200, "done")
        .await
        .expect("Failed to close publisher");
}

async fn next_delivery(client: &mut AmqpClient) -> Delivery {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match client.next_event().await {
                Some(BrokerEvent::Delivery(delivery)) => return delivery,
                Some(other) => eprintln!("Skipping event: {other:?}"),
                None => panic!("Client closed unexpectedly"),
            }
        }
    })
    .await
    .expect("No delivery within 10 seconds")
}

#[tokio::test]
#[ignore]
async fn fanout_delivery_round_trip() {
    let (_container, config) = start_broker().await;
    let publisher_config = AmqpConfig::from_url(config.url()).expect("Failed to copy config");

    let mut client = AmqpClient::connect(config, fast_backoff())
        .await
        .expect("Failed to connect");
    assert!(client.is_connected());
    client
        .declare(Topology::purchase_created())
        .await
        .expect("Failed to declare topology");
    client
        .consume(consumer_spec())
        .await
        .expect("Failed to register consumer");

    let body = br#"{"transactionId":"abc123","status":"FINISHED"}"#;
    publish(&publisher_config, body).await;

    let delivery = next_delivery(&mut client).await;
    assert_eq!(delivery.body(), body);
    assert_eq!(delivery.exchange(), "purchase.created");
    assert_eq!(delivery.routing_key(), "pubSub");
    assert!(!delivery.redelivered());
    assert!(!delivery.is_auto_acked());

    delivery
        .resolve(Outcome::Acked)
        .await
        .expect("Failed to ack");
    client.close().await.expect("Failed to close");
    assert!(client.next_event().await.is_none());
}

#[tokio::test]
#[ignore]
async fn requeued_delivery_comes_back_redelivered() {
    let (_container, config) = start_broker().await;
    let publisher_config = AmqpConfig::from_url(config.url()).expect("Failed to copy config");

    let mut client = AmqpClient::connect(config, fast_backoff())
        .await
        .expect("Failed to connect");
    client
        .declare(Topology::purchase_created())
        .await
        .expect("Failed to declare topology");
    client
        .consume(consumer_spec())
        .await
        .expect("Failed to register consumer");

    publish(&publisher_config, b"{not valid json").await;

    let first = next_delivery(&mut client).await;
    assert!(!first.redelivered());
    first
        .resolve(Outcome::NackedRequeue)
        .await
        .expect("Failed to nack");

    let second = next_delivery(&mut client).await;
    assert!(second.redelivered());
    assert_eq!(second.body(), b"{not valid json");
    second
        .resolve(Outcome::NackedDrop)
        .await
        .expect("Failed to nack");

    client.close().await.expect("Failed to close");
}

#[tokio::test]
#[ignore]
async fn dropped_connection_is_reestablished_with_a_fresh_queue() {
    let (container, config) = start_broker().await;
    let publisher_config = AmqpConfig::from_url(config.url()).expect("Failed to copy config");

    let mut client = AmqpClient::connect(config, fast_backoff())
        .await
        .expect("Failed to connect");
    client
        .declare(Topology::purchase_created())
        .await
        .expect("Failed to declare topology");
    client
        .consume(consumer_spec())
        .await
        .expect("Failed to register consumer");

    let mut closed = container
        .exec(ExecCommand::new([
            "rabbitmqctl",
            "close_all_connections",
            "forced by test",
        ]))
        .await
        .expect("Failed to run rabbitmqctl");
    closed.stdout_to_vec().await.expect("rabbitmqctl did not finish");

    let event = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match client.next_event().await {
                Some(BrokerEvent::ConnectionError(e)) => return e,
                Some(other) => eprintln!("Skipping event: {other:?}"),
                None => panic!("Client closed unexpectedly"),
            }
        }
    })
    .await
    .expect("No connection error within 10 seconds");
    assert!(!event.is_fatal(), "unexpected fatal error: {event:?}");

    // Keep driving the client until the new session has bound its queue.
    tokio::time::timeout(Duration::from_secs(10), async {
        while !client.is_connected() {
            let _ = tokio::time::timeout(Duration::from_millis(200), client.next_event()).await;
        }
    })
    .await
    .expect("Not reconnected within 10 seconds");

    let body = br#"{"transactionId":"after-reconnect","status":"FINISHED"}"#;
    publish(&publisher_config, body).await;

    let delivery = next_delivery(&mut client).await;
    assert_eq!(delivery.body(), body);
    assert!(!delivery.redelivered());
    delivery
        .resolve(Outcome::Acked)
        .await
        .expect("Failed to ack");

    client.close().await.expect("Failed to close");
}

#[tokio::test]
#[ignore]
async fn conflicting_exchange_is_a_topology_conflict() {
    let (_container, config) = start_broker().await;

    // Someone else already owns the exchange name with another type.
    let connection = Connection::connect(config.url().expose_secret(), ConnectionProperties::default())
        .await
        .expect("Failed to connect");
    let channel = connection
        .create_channel()
        .await
        .expect("Failed to open channel");
    channel
        .exchange_declare(
            Topology::PURCHASE_CREATED_EXCHANGE,
            lapin::ExchangeKind::Direct,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .expect("Failed to declare direct exchange");

    let mut client = AmqpClient::connect(config, fast_backoff())
        .await
        .expect("Failed to connect");
    let result = client.declare(Topology::purchase_created()).await;

    assert!(
        matches!(result, Err(BrokerError::TopologyConflict(_))),
        "unexpected result: {result:?}"
    );
}

#[tokio::test]
#[ignore]
async fn wrong_password_is_reported_not_fatal() {
    let (_container, config) = start_broker().await;
    let bad_url = SecretString::from(config.url().expose_secret().replace("guest@", "wrong@"));
    let bad = AmqpConfig::from_url(&bad_url).expect("Failed to build config");

    let mut client = AmqpClient::connect(bad, fast_backoff())
        .await
        .expect("Unreachable or refused brokers are retried, not fatal");
    assert!(!client.is_connected());

    let event = tokio::time::timeout(Duration::from_secs(10), client.next_event())
        .await
        .expect("No event within 10 seconds");
    assert!(matches!(event, Some(BrokerEvent::ConnectionError(_))));

    client.close().await.expect("Failed to close");
}
