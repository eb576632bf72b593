//! Performance benchmarks for replybus hot paths.
//!
//! Benchmarks cover:
//!   - Header chain extraction (native, standard and HTTP-style hits)
//!   - Reply chunking and group unpacking
//!   - Full in-memory request/reply round trip
//!
//! Run: `cargo bench`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use replybus::chunker::{self, Chunking};
use replybus::headers::{self, ReplyInfo};
use replybus::{Envelope, InMemoryBroker, Payload, RequestReplyCoordinator};

fn bench_header_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_chain");

    let native = Envelope::new("x")
        .with_header("kafka_correlationId", "c-native")
        .with_header(headers::TOTAL_REPLIES, 3_i64)
        .with_header(headers::REPLY_INDEX, "1");
    let standard = Envelope::new("x").with_header(headers::CORRELATION_ID, "c-standard");
    let http = Envelope::new("x")
        .with_header("x-correlation-id", "c-http")
        .with_header("x-total-replies", "unknown")
        .with_header("x-error-message", "boom");

    for (name, envelope) in [("native", &native), ("standard", &standard), ("http", &http)] {
        group.bench_function(name, |b| {
            b.iter(|| ReplyInfo::from_envelope(black_box(envelope)));
        });
    }
    group.finish();
}

fn bench_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunker");

    for count in [16_usize, 256, 4096] {
        let replies: Vec<Payload> = (0..count)
            .map(|i| Payload::Bytes(vec![(i % 251) as u8; 64]))
            .collect();
        group.bench_with_input(BenchmarkId::new("chunk", count), &replies, |b, replies| {
            b.iter(|| chunker::chunk(black_box(replies.clone()), 4096));
        });

        let Chunking::Grouped(groups) = chunker::chunk(replies, 4096) else {
            continue;
        };
        let Some(first) = groups.into_iter().next() else {
            continue;
        };
        let envelope = first
            .into_envelope(
                Envelope::new(Payload::empty()).with_header(headers::CORRELATION_ID, "c1"),
            )
            .expect("encode group");
        group.bench_with_input(BenchmarkId::new("unpack", count), &envelope, |b, envelope| {
            b.iter(|| chunker::unpack(black_box(envelope)).expect("unpack"));
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");

    let broker = InMemoryBroker::new();
    let coordinator = rt.block_on(async {
        RequestReplyCoordinator::builder(Arc::new(broker.clone()))
            .build()
            .expect("coordinator")
    });
    broker
        .subscribe("replies", coordinator.reply_listener())
        .expect("subscribe replies");
    let responder_broker = broker.clone();
    broker
        .subscribe("echo", move |request| {
            let reply = Envelope::new(request.payload().clone()).with_header(
                headers::CORRELATION_ID,
                headers::correlation_id(&request).unwrap_or_default(),
            );
            let _ = responder_broker.publish("replies", reply);
        })
        .expect("subscribe echo");

    c.bench_function("round_trip_single_reply", |b| {
        b.to_async(&rt).iter(|| async {
            coordinator
                .send_and_await(Envelope::new("ping"), "echo", Some(Duration::from_secs(1)))
                .await
                .expect("reply")
        });
    });
}

criterion_group!(benches, bench_header_chain, bench_chunking, bench_round_trip);
criterion_main!(benches);
