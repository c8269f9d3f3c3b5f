//! End-to-end tests of the consumer pipeline over the in-memory broker and store.
//!
//! Each test scripts the broker's deliveries up front, runs the loop until
//! the script ends, then checks the acknowledgment frames and the store.

#![allow(clippy::unwrap_used)]

use purchase_status_core::{AckMode, ConsumerSpec, QueueSpec, Topology};
use purchase_status_runtime::{
    ConsumerLoop, ConsumerLoopConfig, ConsumerReport, MalformedPolicy, MessageProcessor,
    MissingPurchasePolicy, ProcessorPolicy,
};
use purchase_status_testing::{AckCall, InMemoryPurchaseStore, ScriptedBroker, ScriptedBrokerHandle};
use std::sync::Arc;

fn consumer_spec() -> ConsumerSpec {
    ConsumerSpec {
        tag: "pipeline".to_string(),
        queue: QueueSpec::server_named(),
        ack_mode: AckMode::Manual,
        prefetch: 8,
    }
}

fn created(id: &str) -> Vec<u8> {
    format!(r#"{{"transactionId":"{id}","status":"FINISHED","total":1250}}"#).into_bytes()
}

async fn run_script(
    client: ScriptedBroker,
    store: &InMemoryPurchaseStore,
    policy: ProcessorPolicy,
) -> ConsumerReport {
    let processor = Arc::new(MessageProcessor::new(Arc::new(store.clone()), policy));
    let config = ConsumerLoopConfig {
        max_in_flight: 1,
        ..ConsumerLoopConfig::default()
    };
    ConsumerLoop::new(client, processor, config)
        .run(Topology::purchase_created(), consumer_spec(), std::future::pending())
        .await
        .unwrap()
}

fn frames(handle: &ScriptedBrokerHandle) -> Vec<AckCall> {
    let mut calls = handle.acks().tagged_calls();
    calls.sort_by_key(|(tag, _)| *tag);
    calls.into_iter().map(|(_, call)| call).collect()
}

#[tokio::test]
async fn transient_store_failure_is_retried_on_redelivery() {
    let (client, handle) = ScriptedBroker::new();
    let store = InMemoryPurchaseStore::with_purchases(["abc123"]);
    store.fail_next_updates(1);

    handle.deliver(created("abc123"), false);
    handle.deliver(created("abc123"), true);
    handle.close();

    let report = run_script(client, &store, ProcessorPolicy::default()).await;

    assert_eq!(report.nacked_requeue, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(
        frames(&handle),
        vec![AckCall::Nack { requeue: true }, AckCall::Ack]
    );
    assert_eq!(store.status_of("abc123").unwrap().as_str(), "FINISHED");
}

#[tokio::test]
async fn malformed_message_is_never_dropped_by_default() {
    let (client, handle) = ScriptedBroker::new();
    let store = InMemoryPurchaseStore::new();

    handle.deliver(b"{not valid json".to_vec(), false);
    handle.deliver(b"{not valid json".to_vec(), true);
    handle.close();

    let report = run_script(client, &store, ProcessorPolicy::default()).await;

    assert_eq!(report.nacked_requeue, 2);
    assert_eq!(report.nacked_drop, 0);
    assert_eq!(
        frames(&handle),
        vec![AckCall::Nack { requeue: true }, AckCall::Nack { requeue: true }]
    );
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn malformed_message_is_requeued_once_then_dropped() {
    let (client, handle) = ScriptedBroker::new();
    let store = InMemoryPurchaseStore::new();

    handle.deliver(b"{not valid json".to_vec(), false);
    handle.deliver(b"{not valid json".to_vec(), true);
    handle.close();

    let policy = ProcessorPolicy {
        malformed: MalformedPolicy::RequeueOnce,
        ..ProcessorPolicy::default()
    };
    let report = run_script(client, &store, policy).await;

    assert_eq!(report.nacked_requeue, 1);
    assert_eq!(report.nacked_drop, 1);
    assert_eq!(
        frames(&handle),
        vec![AckCall::Nack { requeue: true }, AckCall::Nack { requeue: false }]
    );
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn duplicate_delivery_leaves_the_same_state() {
    let (client, handle) = ScriptedBroker::new();
    let store = InMemoryPurchaseStore::with_purchases(["abc123", "other"]);

    handle.deliver(created("abc123"), false);
    handle.deliver(created("abc123"), true);
    handle.close();

    let report = run_script(client, &store, ProcessorPolicy::default()).await;

    assert_eq!(report.acked, 2);
    assert_eq!(store.status_of("abc123").unwrap().as_str(), "FINISHED");
    assert_eq!(store.status_of("other").unwrap().as_str(), "CREATED");
}

#[tokio::test]
async fn unknown_purchase_follows_the_configured_policy() {
    for (policy, expected) in [
        (MissingPurchasePolicy::Acknowledge, AckCall::Ack),
        (MissingPurchasePolicy::Requeue, AckCall::Nack { requeue: true }),
        (MissingPurchasePolicy::Drop, AckCall::Nack { requeue: false }),
    ] {
        let (client, handle) = ScriptedBroker::new();
        let store = InMemoryPurchaseStore::new();
        handle.deliver(created("nobody"), false);
        handle.close();

        let policy = ProcessorPolicy {
            missing_purchase: policy,
            ..ProcessorPolicy::default()
        };
        run_script(client, &store, policy).await;

        assert_eq!(frames(&handle), vec![expected]);
        assert!(store.is_empty());
    }
}
