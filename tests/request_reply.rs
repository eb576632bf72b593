//! End-to-end request/reply tests over the in-memory broker.
//!
//! Each test wires a coordinator to the broker's reply topic and plays the
//! responder side by hand, so reply order, duplication and timing are fully
//! controlled.

use replybus::correlation::{DeliveryOutcome, ReplyDisposition, RequestReplyCoordinator, Responder};
use replybus::headers;
use replybus::transport::{
    DestinationResolver, InMemoryBroker, Interceptor, ReplyKind, StaticDestinationResolver,
};
use replybus::{Envelope, Payload, ReplyError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    broker: InMemoryBroker,
    coordinator: RequestReplyCoordinator,
    responder: Responder,
    requests: mpsc::UnboundedReceiver<Envelope>,
}

impl Harness {
    fn new() -> Self {
        let broker = InMemoryBroker::new();
        let coordinator = RequestReplyCoordinator::builder(Arc::new(broker.clone()))
            .build()
            .expect("coordinator");
        broker
            .subscribe("replies", coordinator.reply_listener())
            .expect("subscribe replies");

        let (tx, requests) = mpsc::unbounded_channel();
        broker
            .subscribe("service", move |request| {
                let _ = tx.send(request);
            })
            .expect("subscribe service");

        let responder = Responder::new(Arc::new(broker.clone()));
        Self {
            broker,
            coordinator,
            responder,
            requests,
        }
    }

    async fn next_request(&mut self) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), self.requests.recv())
            .await
            .expect("request arrives in time")
            .expect("request channel open")
    }

    fn reply(&self, correlation_id: &str, payload: &str) -> Envelope {
        Envelope::new(payload).with_header(headers::CORRELATION_ID, correlation_id)
    }

    fn publish(&self, envelope: Envelope) {
        self.broker.publish("replies", envelope).expect("publish reply");
    }
}

fn texts(payloads: &[Payload]) -> Vec<String> {
    payloads
        .iter()
        .map(|p| p.as_str().expect("utf8 payload").to_string())
        .collect()
}

fn correlation_of(request: &Envelope) -> String {
    headers::correlation_id(request).expect("request carries correlation id")
}

// ─────────────────────────────────────────────────────────────────────────────
// Single reply
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_reply_round_trip_with_caller_supplied_id() {
    let mut harness = Harness::new();
    let request = Envelope::new("ping").with_header(headers::CORRELATION_ID, "c1");
    let pending = harness
        .coordinator
        .dispatch(request, "service", Some(Duration::from_secs(2)))
        .expect("dispatch");
    assert_eq!(pending.correlation_id(), "c1");

    let inbound = harness.next_request().await;
    assert_eq!(headers::reply_to(&inbound).as_deref(), Some("replies"));
    assert_eq!(headers::destination(&inbound).as_deref(), Some("service"));
    harness
        .responder
        .reply(&inbound, "pong")
        .await
        .expect("reply");

    assert_eq!(pending.await.expect("reply"), Some(Payload::text("pong")));
    assert!(!harness.coordinator.registry().contains("c1"));
}

#[tokio::test]
async fn empty_terminal_marker_resolves_to_none() {
    let mut harness = Harness::new();
    let pending = harness
        .coordinator
        .dispatch(Envelope::new("ping"), "service", Some(Duration::from_secs(2)))
        .expect("dispatch");
    let inbound = harness.next_request().await;
    harness.responder.reply_empty(&inbound).await.expect("reply");
    assert_eq!(pending.await.expect("completes"), None);
}

#[tokio::test]
async fn remote_error_surfaces_without_payload() {
    let mut harness = Harness::new();
    let pending = harness
        .coordinator
        .dispatch_collect(Envelope::new("ping"), "service", Some(Duration::from_secs(2)))
        .expect("dispatch");
    let inbound = harness.next_request().await;
    harness
        .responder
        .reply_error(&inbound, "boom")
        .await
        .expect("reply");

    assert_eq!(pending.await, Err(ReplyError::remote("boom")));
    assert_eq!(harness.coordinator.stats().remote_errors, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts and unknown replies
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn timeout_fires_near_deadline_and_removes_entry() {
    let harness = Harness::new();
    let request = Envelope::new("ping").with_header(headers::CORRELATION_ID, "slow");
    let started = Instant::now();
    let error = harness
        .coordinator
        .send_and_await(request, "service", Some(Duration::from_millis(100)))
        .await
        .expect_err("no reply must time out");
    let elapsed = started.elapsed();

    assert!(matches!(error, ReplyError::Timeout { ref correlation_id, .. } if correlation_id == "slow"));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(1000), "took {elapsed:?}");
    assert!(!harness.coordinator.registry().contains("slow"));

    let late = harness.reply("slow", "too late");
    assert_eq!(
        harness.coordinator.on_reply(late).expect("no error"),
        ReplyDisposition::UnknownCorrelationId
    );
}

#[tokio::test]
async fn unknown_reply_leaves_pending_request_untouched() {
    let mut harness = Harness::new();
    let pending = harness
        .coordinator
        .dispatch(Envelope::new("ping"), "service", Some(Duration::from_secs(2)))
        .expect("dispatch");
    let inbound = harness.next_request().await;
    let id = correlation_of(&inbound);

    harness.publish(harness.reply("someone-else", "stray"));
    harness.publish(Envelope::new("no id at all"));
    let handler = harness.coordinator.registry().lookup(&id).expect("still pending");
    assert_eq!(handler.received(), 0);
    assert!(!handler.is_completed());

    harness.publish(harness.reply(&id, "real"));
    assert_eq!(pending.await.expect("reply"), Some(Payload::text("real")));
    let stats = harness.coordinator.stats();
    assert_eq!(stats.unknown_replies, 1);
    assert_eq!(stats.malformed_replies, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Multi-reply
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn known_total_in_any_order_with_duplicates() {
    let mut harness = Harness::new();
    let pending = harness
        .coordinator
        .dispatch_collect(Envelope::new("ping"), "service", Some(Duration::from_secs(2)))
        .expect("dispatch");
    let id = correlation_of(&harness.next_request().await);

    for index in [2_u64, 0, 2, 1] {
        let reply = harness
            .reply(&id, &format!("r{index}"))
            .with_header(headers::TOTAL_REPLIES, 3_i64)
            .with_header(headers::REPLY_INDEX, index.to_string());
        harness.publish(reply);
    }

    let replies = pending.await.expect("all replies");
    assert_eq!(texts(&replies), vec!["r2", "r0", "r1"]);
    assert_eq!(harness.coordinator.stats().duplicate_replies, 1);
    assert!(harness.coordinator.registry().is_empty());
}

#[tokio::test]
async fn grouped_replies_are_unpacked_and_deduplicated() {
    let mut harness = Harness::new();
    let responder = Responder::new(Arc::new(harness.broker.clone())).with_group_max_bytes(110);
    let pending = harness
        .coordinator
        .dispatch_collect(Envelope::new("ping"), "service", Some(Duration::from_secs(2)))
        .expect("dispatch");
    let inbound = harness.next_request().await;

    let payloads: Vec<Payload> = (0..7).map(|i| Payload::text(format!("p{i}"))).collect();
    responder.reply_all(&inbound, payloads).await.expect("reply_all");

    let replies = pending.await.expect("all replies");
    assert_eq!(
        texts(&replies),
        vec!["p0", "p1", "p2", "p3", "p4", "p5", "p6"]
    );
}

#[tokio::test]
async fn redelivered_group_is_dropped_as_duplicate() {
    let mut harness = Harness::new();
    let pending = harness
        .coordinator
        .dispatch_collect(Envelope::new("ping"), "service", Some(Duration::from_secs(2)))
        .expect("dispatch");
    let id = correlation_of(&harness.next_request().await);

    let group = replybus::chunker::ReplyGroup {
        start: 0,
        entries: vec![b"a".to_vec(), b"b".to_vec()],
    }
    .into_envelope(
        Envelope::new(Payload::empty())
            .with_header(headers::CORRELATION_ID, id.as_str())
            .with_header(headers::TOTAL_REPLIES, 3_i64),
    )
    .expect("group");

    assert_eq!(
        harness.coordinator.on_reply(group.clone()).expect("delivered"),
        ReplyDisposition::Delivered(DeliveryOutcome::Accepted)
    );
    assert_eq!(
        harness.coordinator.on_reply(group).expect("delivered"),
        ReplyDisposition::Delivered(DeliveryOutcome::Duplicate)
    );
    harness.publish(
        harness
            .reply(&id, "c")
            .with_header(headers::TOTAL_REPLIES, 3_i64)
            .with_header(headers::REPLY_INDEX, "2"),
    );
    assert_eq!(texts(&pending.await.expect("replies")), vec!["a", "b", "c"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unbounded_stream_ends_after_count_marker() {
    let mut harness = Harness::new();
    let mut stream = harness
        .coordinator
        .send_and_stream(Envelope::new("ping"), "service", Some(Duration::from_secs(2)))
        .expect("stream");
    let inbound = harness.next_request().await;

    for index in 0..5_u64 {
        harness
            .responder
            .reply_stream_item(&inbound, index, format!("s{index}").as_str())
            .await
            .expect("item");
    }
    harness
        .responder
        .finish_stream(&inbound, 5)
        .await
        .expect("finish");

    let mut values = Vec::new();
    while let Some(item) = stream.next().await {
        values.push(item.expect("no error item"));
    }
    assert_eq!(texts(&values), vec!["s0", "s1", "s2", "s3", "s4"]);
    assert!(stream.is_finished());
}

#[tokio::test]
async fn stream_count_marker_may_arrive_before_items() {
    let mut harness = Harness::new();
    let mut stream = harness
        .coordinator
        .send_and_stream(Envelope::new("ping"), "service", Some(Duration::from_secs(2)))
        .expect("stream");
    let inbound = harness.next_request().await;

    harness
        .responder
        .finish_stream(&inbound, 2)
        .await
        .expect("finish");
    for index in 0..2_u64 {
        harness
            .responder
            .reply_stream_item(&inbound, index, format!("s{index}").as_str())
            .await
            .expect("item");
    }

    let mut values = Vec::new();
    while let Some(item) = stream.next().await {
        values.push(item.expect("no error item"));
    }
    assert_eq!(texts(&values), vec!["s0", "s1"]);
}

#[tokio::test]
async fn stream_yields_timeout_as_last_item() {
    let mut harness = Harness::new();
    let mut stream = harness
        .coordinator
        .send_and_stream(Envelope::new("ping"), "service", Some(Duration::from_millis(80)))
        .expect("stream");
    let inbound = harness.next_request().await;
    harness
        .responder
        .reply_stream_item(&inbound, 0, "first")
        .await
        .expect("item");

    assert_eq!(
        stream.next().await.expect("first item"),
        Ok(Payload::text("first"))
    );
    let last = stream.next().await.expect("error item");
    assert!(matches!(last, Err(ReplyError::Timeout { .. })));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn dropping_stream_deregisters_request() {
    let mut harness = Harness::new();
    let stream = harness
        .coordinator
        .send_and_stream(Envelope::new("ping"), "service", Some(Duration::from_secs(5)))
        .expect("stream");
    let id = stream.correlation_id().to_string();
    let inbound = harness.next_request().await;
    assert!(harness.coordinator.registry().contains(&id));

    drop(stream);
    assert!(!harness.coordinator.registry().contains(&id));

    harness
        .responder
        .reply_stream_item(&inbound, 0, "after drop")
        .await
        .expect("publish still succeeds");
    assert_eq!(harness.coordinator.stats().unknown_replies, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Blocking shapes, typed helpers, routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_call_from_blocking_thread() {
    let harness = Harness::new();
    let responder_broker = harness.broker.clone();
    harness
        .broker
        .subscribe("echo", move |request| {
            let reply = Envelope::new(request.payload().clone())
                .with_header(headers::CORRELATION_ID, correlation_of(&request))
                .with_header(headers::TOTAL_REPLIES, 2_i64)
                .with_header(headers::REPLY_INDEX, "0");
            responder_broker.publish("replies", reply.clone()).expect("reply 0");
            responder_broker
                .publish("replies", reply.with_header(headers::REPLY_INDEX, "1"))
                .expect("reply 1");
        })
        .expect("subscribe echo");

    let coordinator = harness.coordinator.clone();
    let (single, collected) = tokio::task::spawn_blocking(move || {
        let single = coordinator.send_and_await_blocking(
            Envelope::new("one"),
            "echo",
            Some(Duration::from_secs(2)),
        );
        let collected = coordinator.send_and_collect_blocking(
            Envelope::new("two"),
            "echo",
            Some(Duration::from_secs(2)),
        );
        (single, collected)
    })
    .await
    .expect("blocking task");

    assert_eq!(single.expect("single"), Some(Payload::text("one")));
    assert_eq!(texts(&collected.expect("collected")), vec!["two", "two"]);
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Quote {
    symbol: String,
    price: u32,
}

#[tokio::test]
async fn typed_round_trip_uses_json_converter() {
    let mut harness = Harness::new();
    let coordinator = harness.coordinator.clone();
    let call = tokio::spawn(async move {
        coordinator
            .send_and_await_typed::<_, Quote>(&"ACME", "service", Some(Duration::from_secs(2)))
            .await
    });

    let inbound = harness.next_request().await;
    let symbol: String = inbound
        .payload()
        .decode(&replybus::transport::JsonConverter)
        .expect("typed request");
    harness
        .responder
        .reply_value(&inbound, &Quote { symbol, price: 42 })
        .await
        .expect("reply");

    let quote = call.await.expect("join").expect("typed reply");
    assert_eq!(
        quote,
        Some(Quote {
            symbol: "ACME".into(),
            price: 42
        })
    );
}

struct TaggingInterceptor {
    sent: AtomicUsize,
    wrapped: AtomicUsize,
}

impl Interceptor for TaggingInterceptor {
    fn pre_send(&self, envelope: Envelope) -> Envelope {
        self.sent.fetch_add(1, Ordering::SeqCst);
        envelope.with_header("x-trace", "t-1")
    }

    fn wrap_reply(&self, kind: ReplyKind, envelope: Envelope) -> Envelope {
        self.wrapped.fetch_add(1, Ordering::SeqCst);
        envelope.with_header("x-reply-kind", format!("{kind:?}"))
    }
}

#[tokio::test]
async fn bindings_and_interceptors_shape_both_directions() {
    let broker = InMemoryBroker::new();
    let resolver = Arc::new(
        StaticDestinationResolver::default()
            .with_binding("orders", "svc/orders/requests")
            .with_binding("replies", "svc/node-1/replies"),
    );
    let interceptor = Arc::new(TaggingInterceptor {
        sent: AtomicUsize::new(0),
        wrapped: AtomicUsize::new(0),
    });
    let coordinator = RequestReplyCoordinator::builder(Arc::new(broker.clone()))
        .resolver(resolver.clone())
        .interceptor(interceptor.clone())
        .build()
        .expect("coordinator");
    broker
        .subscribe("svc/+/replies", coordinator.reply_listener())
        .expect("subscribe replies");

    let (tx, mut requests) = mpsc::unbounded_channel();
    broker
        .subscribe("svc/orders/#", move |request| {
            let _ = tx.send(request);
        })
        .expect("subscribe orders");
    let responder = Responder::new(Arc::new(broker.clone())).with_interceptor(interceptor.clone());

    let pending = coordinator
        .dispatch(Envelope::new("order"), "orders", Some(Duration::from_secs(2)))
        .expect("dispatch");
    let inbound = requests.recv().await.expect("request");
    assert_eq!(inbound.header("x-trace").and_then(|v| v.as_text()).as_deref(), Some("t-1"));
    assert_eq!(
        resolver.binding_for(&headers::reply_to(&inbound).expect("reply-to")).as_deref(),
        Some("replies")
    );

    responder.reply(&inbound, "accepted").await.expect("reply");
    assert_eq!(pending.await.expect("reply"), Some(Payload::text("accepted")));
    assert_eq!(interceptor.sent.load(Ordering::SeqCst), 1);
    assert_eq!(interceptor.wrapped.load(Ordering::SeqCst), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_requests_each_get_their_own_reply() {
    let broker = InMemoryBroker::new();
    let coordinator = RequestReplyCoordinator::builder(Arc::new(broker.clone()))
        .build()
        .expect("coordinator");
    broker
        .subscribe("replies", coordinator.reply_listener())
        .expect("subscribe replies");
    let responder_broker = broker.clone();
    broker
        .subscribe("echo", move |request| {
            let reply = Envelope::new(request.payload().clone())
                .with_header(headers::CORRELATION_ID, correlation_of(&request));
            responder_broker.publish("replies", reply).expect("reply");
        })
        .expect("subscribe echo");

    let mut tasks = Vec::new();
    for index in 0..64 {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move {
            let body = format!("m{index}");
            let reply = coordinator
                .send_and_await(
                    Envelope::new(body.as_str()),
                    "echo",
                    Some(Duration::from_secs(5)),
                )
                .await
                .expect("reply");
            assert_eq!(reply, Some(Payload::text(body)));
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }
    assert!(coordinator.registry().is_empty());
    assert_eq!(coordinator.stats().completed, 64);
}

#[tokio::test]
async fn shutdown_cancels_everything_pending() {
    let harness = Harness::new();
    let first = harness
        .coordinator
        .dispatch(Envelope::new("a"), "service", Some(Duration::from_secs(5)))
        .expect("dispatch");
    let second = harness
        .coordinator
        .dispatch_collect(Envelope::new("b"), "service", Some(Duration::from_secs(5)))
        .expect("dispatch");

    assert_eq!(harness.coordinator.shutdown(), 2);
    assert!(matches!(first.await, Err(ReplyError::Cancelled { .. })));
    assert!(matches!(second.await, Err(ReplyError::Cancelled { .. })));
    assert!(harness.coordinator.registry().is_empty());
}
