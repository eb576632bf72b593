use super::handler::{DeliveryOutcome, ReplyMode, ResponseHandler};
use super::registry::CorrelationRegistry;
use super::sink::{self, ReplySink};
use super::stats::{CoordinatorStats, CoordinatorStatsSnapshot};
use super::stream::ReplyStream;
use crate::chunker;
use crate::config::RequestReplyConfig;
use crate::envelope::{Envelope, Payload};
use crate::error::ReplyError;
use crate::headers::{self, ReplyInfo};
use crate::transport::{
    DestinationResolver, Interceptor, JsonConverter, NoopInterceptor, PayloadConverter,
    StaticDestinationResolver, Transport,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

const BLOCKING_GRACE: Duration = Duration::from_millis(250);

/// What `on_reply` did with an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    Delivered(DeliveryOutcome),
    /// No correlation id in any known header; dropped.
    MissingCorrelationId,
    /// No pending request for the correlation id; dropped.
    UnknownCorrelationId,
}

/// Reply (or replies) of a dispatched request, resolved by the worker task.
///
/// The exchange is already running when this is returned; dropping it does
/// not cancel the request.
pub struct PendingReply<T> {
    correlation_id: String,
    handler: Arc<ResponseHandler>,
    task: JoinHandle<Result<T, ReplyError>>,
}

impl<T> PendingReply<T> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl<T> fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T, ReplyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.task).poll(cx).map(|joined| {
            joined.unwrap_or_else(|_| {
                Err(ReplyError::Cancelled {
                    correlation_id: this.correlation_id.clone(),
                })
            })
        })
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn DestinationResolver>,
    interceptor: Arc<dyn Interceptor>,
    converter: Arc<dyn PayloadConverter>,
    registry: Arc<CorrelationRegistry>,
    stats: CoordinatorStats,
    config: RequestReplyConfig,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

/// Outgoing request after correlation headers have been applied.
struct Prepared {
    correlation_id: String,
    destination: String,
    envelope: Envelope,
}

/// Request/reply over a fire-and-forget transport.
///
/// Cheap to clone; clones share the registry, stats and worker permits.
#[derive(Clone)]
pub struct RequestReplyCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestReplyCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestReplyCoordinator")
            .field("transport", &self.inner.transport.name())
            .field("pending", &self.inner.registry.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

pub struct CoordinatorBuilder {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn DestinationResolver>,
    interceptor: Arc<dyn Interceptor>,
    converter: Arc<dyn PayloadConverter>,
    registry: Arc<CorrelationRegistry>,
    config: RequestReplyConfig,
    runtime: Option<Handle>,
}

impl CoordinatorBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            resolver: Arc::new(StaticDestinationResolver::default()),
            interceptor: Arc::new(NoopInterceptor),
            converter: Arc::new(JsonConverter),
            registry: Arc::new(CorrelationRegistry::new()),
            config: RequestReplyConfig::default(),
            runtime: None,
        }
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    #[must_use]
    pub fn converter(mut self, converter: Arc<dyn PayloadConverter>) -> Self {
        self.converter = converter;
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Arc<CorrelationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn config(mut self, config: RequestReplyConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime the send+await work runs on. Defaults to the current one.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<RequestReplyCoordinator, ReplyError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ReplyError::NoRuntime)?,
        };
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        Ok(RequestReplyCoordinator {
            inner: Arc::new(Inner {
                transport: self.transport,
                resolver: self.resolver,
                interceptor: self.interceptor,
                converter: self.converter,
                registry: self.registry,
                stats: CoordinatorStats::default(),
                config: self.config,
                permits,
                runtime,
            }),
        })
    }
}

impl RequestReplyCoordinator {
    pub fn builder(transport: Arc<dyn Transport>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(transport)
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &RequestReplyConfig {
        &self.inner.config
    }

    pub fn converter(&self) -> &Arc<dyn PayloadConverter> {
        &self.inner.converter
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Send `request` and resolve to its single reply, or `None` when the
    /// responder answered with the empty terminal marker.
    pub fn dispatch(
        &self,
        request: Envelope,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<PendingReply<Option<Payload>>, ReplyError> {
        let (sink, reader) = sink::single_slot();
        self.spawn_exchange(
            request,
            destination,
            timeout,
            ReplyMode::Single,
            Box::new(sink),
            move || reader.take(),
        )
    }

    pub async fn send_and_await(
        &self,
        request: Envelope,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Payload>, ReplyError> {
        self.dispatch(request, destination, timeout)?.await
    }

    /// Blocking form of [`send_and_await`](Self::send_and_await).
    ///
    /// Meant for callers outside the coordinator's runtime, e.g. a plain
    /// thread or `spawn_blocking`. Called from a thread that the runtime
    /// itself needs, it gives up shortly after `timeout` with
    /// [`ReplyError::Timeout`].
    pub fn send_and_await_blocking(
        &self,
        request: Envelope,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Payload>, ReplyError> {
        let pending = self.dispatch(request, destination, timeout)?;
        self.block_on_pending(pending, self.inner.timeout_or_default(timeout))
    }

    /// Send `request` and gather every reply until the declared total or the
    /// terminal marker arrives.
    pub fn dispatch_collect(
        &self,
        request: Envelope,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<PendingReply<Vec<Payload>>, ReplyError> {
        let (sink, reader) = sink::collector();
        self.spawn_exchange(
            request,
            destination,
            timeout,
            ReplyMode::Multi,
            Box::new(sink),
            move || reader.take(),
        )
    }

    pub async fn send_and_collect(
        &self,
        request: Envelope,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Payload>, ReplyError> {
        self.dispatch_collect(request, destination, timeout)?.await
    }

    pub fn send_and_collect_blocking(
        &self,
        request: Envelope,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Payload>, ReplyError> {
        let pending = self.dispatch_collect(request, destination, timeout)?;
        self.block_on_pending(pending, self.inner.timeout_or_default(timeout))
    }

    /// Send `request` and yield replies as they arrive.
    ///
    /// Dropping the stream cancels the request; replies arriving afterwards
    /// are treated as unknown.
    pub fn send_and_stream(
        &self,
        request: Envelope,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<ReplyStream, ReplyError> {
        let (sink, receiver) = sink::stream_sink();
        let prepared = self.inner.prepare(request, destination);
        let handler = self
            .inner
            .register(&prepared.correlation_id, ReplyMode::Stream, Box::new(sink))?;
        let timeout = self.inner.timeout_or_default(timeout);

        let inner = Arc::clone(&self.inner);
        let task_handler = Arc::clone(&handler);
        self.inner.runtime.spawn(async move {
            let _ = inner.run(&task_handler, prepared, timeout).await;
        });
        Ok(ReplyStream::new(
            receiver,
            handler,
            Arc::clone(&self.inner.registry),
        ))
    }

    /// Serialize `request` through the payload converter and decode the reply.
    pub async fn send_and_await_typed<Req, Resp>(
        &self,
        request: &Req,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Resp>, ReplyError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let value =
            serde_json::to_value(request).map_err(|e| ReplyError::Conversion(e.to_string()))?;
        let bytes = Payload::Json(value).into_bytes(self.inner.converter.as_ref())?;
        let reply = self
            .send_and_await(Envelope::new(bytes), destination, timeout)
            .await?;
        reply
            .map(|payload| payload.decode(self.inner.converter.as_ref()))
            .transpose()
    }

    /// Inbound entry point for every message arriving on the reply channel.
    ///
    /// Only a grouped payload that cannot be unpacked is an error; all other
    /// anomalies are logged, counted and reported through the disposition.
    pub fn on_reply(&self, envelope: Envelope) -> Result<ReplyDisposition, ReplyError> {
        let info = ReplyInfo::from_envelope(&envelope);
        let Some(correlation_id) = info.correlation_id.as_deref() else {
            self.inner.stats.record_malformed_reply();
            let destination = headers::destination(&envelope).unwrap_or_default();
            tracing::warn!(destination = %destination, "dropping reply without correlation id");
            return Ok(ReplyDisposition::MissingCorrelationId);
        };
        let Some(handler) = self.inner.registry.lookup(correlation_id) else {
            self.inner.stats.record_unknown_reply();
            tracing::warn!(correlation_id, "dropping reply for unknown correlation id");
            return Ok(ReplyDisposition::UnknownCorrelationId);
        };

        let payloads = if headers::is_group(&envelope) {
            let entries = chunker::unpack(&envelope).map_err(|error| {
                self.inner.stats.record_unsupported_group();
                tracing::warn!(correlation_id, %error, "dropping undecodable reply group");
                error
            })?;
            entries
                .into_iter()
                .map(|entry| entry.into_parts().0)
                .collect()
        } else {
            vec![envelope.into_parts().0]
        };

        let outcome = handler.accept(&info, payloads);
        match outcome {
            DeliveryOutcome::Completed => {
                self.inner.registry.remove_handler(&handler);
            }
            DeliveryOutcome::Duplicate => self.inner.stats.record_duplicate_reply(),
            DeliveryOutcome::Late => {
                self.inner.stats.record_late_reply();
                tracing::debug!(correlation_id, "dropping late reply");
            }
            DeliveryOutcome::Accepted => {}
        }
        Ok(ReplyDisposition::Delivered(outcome))
    }

    /// Subscriber callback routing reply-channel messages into
    /// [`on_reply`](Self::on_reply).
    pub fn reply_listener(&self) -> impl Fn(Envelope) + Send + Sync + 'static {
        let coordinator = self.clone();
        move |envelope| {
            let _ = coordinator.on_reply(envelope);
        }
    }

    /// Cancel every pending request and refuse new exchanges.
    pub fn shutdown(&self) -> usize {
        self.inner.permits.close();
        let pending = self.inner.registry.drain();
        for handler in &pending {
            handler.cancel(ReplyError::Cancelled {
                correlation_id: handler.correlation_id().to_string(),
            });
        }
        tracing::info!(cancelled = pending.len(), "request/reply coordinator shut down");
        pending.len()
    }

    fn spawn_exchange<T, F>(
        &self,
        request: Envelope,
        destination: &str,
        timeout: Option<Duration>,
        mode: ReplyMode,
        sink: Box<dyn ReplySink>,
        finish: F,
    ) -> Result<PendingReply<T>, ReplyError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let prepared = self.inner.prepare(request, destination);
        let correlation_id = prepared.correlation_id.clone();
        let handler = self.inner.register(&correlation_id, mode, sink)?;
        let timeout = self.inner.timeout_or_default(timeout);

        let inner = Arc::clone(&self.inner);
        let task_handler = Arc::clone(&handler);
        let task = self.inner.runtime.spawn(async move {
            inner.run(&task_handler, prepared, timeout).await?;
            Ok(finish())
        });
        Ok(PendingReply {
            correlation_id,
            handler,
            task,
        })
    }

    /// Park the calling thread until `pending` resolves.
    ///
    /// The wait is bounded by `timeout` plus a short grace period; past it the
    /// exchange is aborted and the request fails with a timeout.
    fn block_on_pending<T: Send + 'static>(
        &self,
        pending: PendingReply<T>,
        timeout: Duration,
    ) -> Result<T, ReplyError> {
        let correlation_id = pending.correlation_id.clone();
        let handler = Arc::clone(&pending.handler);
        let exchange = pending.task.abort_handle();
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.inner.runtime.spawn(async move {
            let _ = tx.send(pending.await);
        });

        match rx.recv_timeout(timeout.saturating_add(BLOCKING_GRACE)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Disconnected) => Err(ReplyError::Cancelled { correlation_id }),
            Err(RecvTimeoutError::Timeout) => {
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                exchange.abort();
                let error = ReplyError::Timeout {
                    correlation_id: correlation_id.clone(),
                    timeout,
                };
                handler.cancel(error.clone());
                self.inner.registry.remove_handler(&handler);
                self.inner.stats.record_timeout();
                tracing::warn!(
                    correlation_id = %correlation_id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "blocking request made no progress; is the coordinator runtime blocked by the caller?"
                );
                Err(error)
            }
        }
    }
}

impl Inner {
    fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.config.default_timeout())
    }

    fn prepare(&self, request: Envelope, destination: &str) -> Prepared {
        let correlation_id =
            headers::correlation_id(&request).unwrap_or_else(|| Uuid::new_v4().to_string());
        let destination = self.resolver.resolve(destination);
        let reply_to = self.resolver.resolve(&self.config.reply_to);
        let envelope = request
            .with_header(headers::CORRELATION_ID, correlation_id.as_str())
            .with_header(headers::REPLY_TO, reply_to)
            .with_header(headers::DESTINATION, destination.as_str());
        Prepared {
            correlation_id,
            destination,
            envelope: self.interceptor.pre_send(envelope),
        }
    }

    fn register(
        &self,
        correlation_id: &str,
        mode: ReplyMode,
        sink: Box<dyn ReplySink>,
    ) -> Result<Arc<ResponseHandler>, ReplyError> {
        let handler = Arc::new(ResponseHandler::new(
            correlation_id,
            mode,
            sink,
            self.config.dedup_window,
        ));
        if !self.registry.register_if_absent(Arc::clone(&handler)) {
            self.stats.record_duplicate_request();
            tracing::warn!(correlation_id, "rejecting request: correlation id already in flight");
            return Err(ReplyError::DuplicateRequest {
                correlation_id: correlation_id.to_string(),
            });
        }
        self.stats.record_request();
        Ok(handler)
    }

    /// Acquire a worker permit, send, and wait for completion, all within
    /// `timeout`. The handler is out of the registry when this returns.
    async fn run(
        &self,
        handler: &Arc<ResponseHandler>,
        prepared: Prepared,
        timeout: Duration,
    ) -> Result<(), ReplyError> {
        let Prepared {
            correlation_id,
            destination,
            envelope,
        } = prepared;

        let exchange = async {
            let _permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| ReplyError::Cancelled {
                    correlation_id: correlation_id.clone(),
                })?;
            tracing::debug!(
                correlation_id = %correlation_id,
                destination = %destination,
                transport = self.transport.name(),
                "sending request"
            );
            self.transport
                .send(&destination, envelope)
                .await
                .map_err(|e| ReplyError::Send {
                    destination: destination.clone(),
                    reason: format!("{e:#}"),
                })?;
            handler.wait().await;
            Ok(())
        };

        let failure = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(_) => Some(ReplyError::Timeout {
                correlation_id: correlation_id.clone(),
                timeout,
            }),
        };
        if let Some(error) = failure {
            handler.cancel(error);
        }
        self.registry.remove_handler(handler);

        let result = handler.outcome().unwrap_or(Ok(()));
        self.record_outcome(&correlation_id, &destination, handler, &result);
        result
    }

    fn record_outcome(
        &self,
        correlation_id: &str,
        destination: &str,
        handler: &ResponseHandler,
        result: &Result<(), ReplyError>,
    ) {
        let elapsed_ms = u64::try_from(handler.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(()) => {
                self.stats.record_completed();
                tracing::debug!(correlation_id, destination, elapsed_ms, "request completed");
            }
            Err(ReplyError::Timeout { .. }) => {
                self.stats.record_timeout();
                tracing::warn!(correlation_id, destination, elapsed_ms, "request timed out");
            }
            Err(ReplyError::Remote { message }) => {
                self.stats.record_remote_error();
                tracing::debug!(correlation_id, destination, elapsed_ms, %message, "remote error");
            }
            Err(ReplyError::Send { reason, .. }) => {
                self.stats.record_send_failure();
                tracing::warn!(correlation_id, destination, %reason, "request send failed");
            }
            Err(error) => {
                self.stats.record_cancelled();
                tracing::debug!(correlation_id, destination, %error, "request cancelled");
            }
        }
    }
}
