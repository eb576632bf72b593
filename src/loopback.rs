//! Self-contained request/reply smoke run: coordinator and responder talk
//! through one in-memory broker.

use crate::config::{self, Config};
use crate::correlation::{RequestReplyCoordinator, Responder};
use crate::envelope::{Envelope, Payload};
use crate::transport::{DestinationResolver, InMemoryBroker};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Binding the built-in responder listens on.
pub const LOOPBACK_BINDING: &str = "loopback";

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub requests: usize,
    pub replies_per_request: usize,
    pub timeout: Option<Duration>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            requests: 100,
            replies_per_request: 1,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoopbackReport {
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub replies_received: usize,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub elapsed_ms: f64,
}

/// Run `options.requests` concurrent exchanges and summarize latencies.
pub async fn run(config: &Config, options: LoopbackOptions) -> Result<LoopbackReport> {
    let broker = InMemoryBroker::new();
    let resolver = Arc::new(config::resolver_from(config));
    let coordinator = RequestReplyCoordinator::builder(Arc::new(broker.clone()))
        .resolver(resolver.clone())
        .config(config.request_reply.clone())
        .build()
        .context("Failed to build request/reply coordinator")?;

    let reply_topic = resolver.resolve(&config.request_reply.reply_to);
    broker
        .subscribe(reply_topic.as_str(), coordinator.reply_listener())
        .context("Failed to subscribe to reply topic")?;

    let request_topic = resolver.resolve(LOOPBACK_BINDING);
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Envelope>();
    broker
        .subscribe(request_topic.as_str(), move |request| {
            let _ = request_tx.send(request);
        })
        .context("Failed to subscribe to request topic")?;

    let responder = Responder::new(Arc::new(broker.clone()))
        .with_group_max_bytes(config.request_reply.group_max_bytes);
    let replies_per_request = options.replies_per_request;
    let responder_task = tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            let result = if replies_per_request == 1 {
                responder.reply(&request, request.payload().clone()).await
            } else {
                let replies = (0..replies_per_request)
                    .map(|i| Payload::text(format!("reply-{i}")))
                    .collect();
                responder.reply_all(&request, replies).await
            };
            if let Err(error) = result {
                tracing::warn!(%error, "loopback responder failed to reply");
            }
        }
    });

    let started = Instant::now();
    let mut exchanges = Vec::with_capacity(options.requests);
    for index in 0..options.requests {
        let coordinator = coordinator.clone();
        let timeout = options.timeout;
        exchanges.push(tokio::spawn(async move {
            let request = Envelope::new(Payload::text(format!("request-{index}")));
            let sent = Instant::now();
            let result = coordinator
                .send_and_collect(request, LOOPBACK_BINDING, timeout)
                .await;
            (sent.elapsed(), result)
        }));
    }

    let mut latencies = Vec::with_capacity(options.requests);
    let mut failed = 0;
    let mut replies_received = 0;
    for exchange in exchanges {
        let (latency, result) = exchange.await.context("loopback exchange task panicked")?;
        match result {
            Ok(replies) => {
                replies_received += replies.len();
                latencies.push(latency);
            }
            Err(error) => {
                failed += 1;
                tracing::warn!(%error, "loopback exchange failed");
            }
        }
    }
    let elapsed = started.elapsed();

    coordinator.shutdown();
    responder_task.abort();

    latencies.sort_unstable();
    Ok(LoopbackReport {
        requests: options.requests,
        succeeded: latencies.len(),
        failed,
        replies_received,
        p50_ms: percentile_ms(&latencies, 50),
        p99_ms: percentile_ms(&latencies, 99),
        max_ms: latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
    })
}

fn percentile_ms(sorted: &[Duration], percentile: usize) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() * percentile).div_ceil(100).saturating_sub(1);
    sorted
        .get(rank.min(sorted.len() - 1))
        .map_or(0.0, |d| d.as_secs_f64() * 1000.0)
}
