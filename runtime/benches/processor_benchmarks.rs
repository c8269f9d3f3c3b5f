//! Processing benchmarks
//!
//! Measures the per-delivery overhead of the worker itself, with the store
//! and broker replaced by in-memory doubles:
//! - payload decoding
//! - `MessageProcessor::process` for each outcome path
//! - the consumer loop dispatching a burst of deliveries
//!
//! Run with: `cargo bench -p purchase-status-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use purchase_status_core::{AckMode, ConsumerSpec, PurchasePayload, PurchaseStatus, QueueSpec, Topology};
use purchase_status_runtime::{ConsumerLoop, ConsumerLoopConfig, MessageProcessor, ProcessorPolicy};
use purchase_status_testing::{AckLog, InMemoryPurchaseStore, ScriptedBroker, test_delivery};
use std::sync::Arc;

const VALID: &[u8] = br#"{"transactionId":"abc123","status":"FINISHED","amount":1250,"currency":"EUR"}"#;
const MALFORMED: &[u8] = b"{\"transactionId\": \"abc123\", \"status\":";

fn benchmark_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));
    let default_status = PurchaseStatus::finished();

    group.bench_function("valid_payload", |b| {
        b.iter(|| PurchasePayload::decode(black_box(VALID), &default_status));
    });

    group.bench_function("malformed_payload", |b| {
        b.iter(|| PurchasePayload::decode(black_box(MALFORMED), &default_status));
    });

    group.finish();
}

fn benchmark_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("process");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let store = InMemoryPurchaseStore::with_purchases(["abc123"]);
    let processor = MessageProcessor::new(Arc::new(store), ProcessorPolicy::default());
    let log = AckLog::new();

    group.bench_function("acked", |b| {
        b.to_async(&runtime).iter(|| async {
            processor.process(test_delivery(&log, black_box(VALID))).await
        });
    });

    group.bench_function("malformed", |b| {
        b.to_async(&runtime).iter(|| async {
            processor.process(test_delivery(&log, black_box(MALFORMED))).await
        });
    });

    group.bench_function("not_found", |b| {
        b.to_async(&runtime).iter(|| async {
            processor
                .process(test_delivery(&log, br#"{"transactionId":"ghost"}"#))
                .await
        });
    });

    group.finish();
}

fn benchmark_consumer_loop(c: &mut Criterion) {
    const BURST: u64 = 100;

    let mut group = c.benchmark_group("consumer_loop");
    group.throughput(Throughput::Elements(BURST));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let store = InMemoryPurchaseStore::with_purchases(["abc123"]);
    let processor = Arc::new(MessageProcessor::new(
        Arc::new(store),
        ProcessorPolicy::default(),
    ));

    group.bench_function("burst_of_100", |b| {
        b.to_async(&runtime).iter(|| {
            let processor = Arc::clone(&processor);
            async move {
                let (client, handle) = ScriptedBroker::new();
                for _ in 0..BURST {
                    handle.deliver(VALID.to_vec(), false);
                }
                handle.close();

                let spec = ConsumerSpec {
                    tag: "bench".to_string(),
                    queue: QueueSpec::server_named(),
                    ack_mode: AckMode::Manual,
                    prefetch: 32,
                };
                ConsumerLoop::new(client, processor, ConsumerLoopConfig::default())
                    .run(Topology::purchase_created(), spec, std::future::pending())
                    .await
                    .expect("consumer loop failed")
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_decode,
    benchmark_process,
    benchmark_consumer_loop,
);
criterion_main!(benches);
