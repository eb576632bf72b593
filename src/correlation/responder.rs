use crate::chunker::{self, Chunking};
use crate::envelope::{Envelope, Payload};
use crate::error::ReplyError;
use crate::headers::{self, TotalReplies};
use crate::transport::{
    Interceptor, JsonConverter, NoopInterceptor, PayloadConverter, ReplyKind, Transport,
};
use serde::Serialize;
use std::sync::Arc;

/// Reply side of the exchange: answers a request on its reply channel with
/// the headers the coordinator's handlers understand.
#[derive(Clone)]
pub struct Responder {
    transport: Arc<dyn Transport>,
    interceptor: Arc<dyn Interceptor>,
    converter: Arc<dyn PayloadConverter>,
    group_max_bytes: usize,
}

struct Route {
    reply_to: String,
    correlation_id: String,
}

impl Responder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptor: Arc::new(NoopInterceptor),
            converter: Arc::new(JsonConverter),
            group_max_bytes: 0,
        }
    }

    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn PayloadConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Pack multi-part replies into groups of at most `max_bytes`; `0` sends
    /// one message per reply.
    #[must_use]
    pub fn with_group_max_bytes(mut self, max_bytes: usize) -> Self {
        self.group_max_bytes = max_bytes;
        self
    }

    /// Single reply.
    pub async fn reply(
        &self,
        request: &Envelope,
        payload: impl Into<Payload>,
    ) -> Result<(), ReplyError> {
        let route = route(request)?;
        let envelope = base(&route).with_payload(payload);
        self.publish(&route, ReplyKind::Payload, envelope).await
    }

    /// Single reply serialized through the payload converter.
    pub async fn reply_value<T: Serialize + ?Sized>(
        &self,
        request: &Envelope,
        value: &T,
    ) -> Result<(), ReplyError> {
        let value =
            serde_json::to_value(value).map_err(|e| ReplyError::Conversion(e.to_string()))?;
        let bytes = Payload::Json(value).into_bytes(self.converter.as_ref())?;
        self.reply(request, bytes).await
    }

    /// Every reply of a known-size answer. An empty list sends the terminal
    /// marker instead.
    pub async fn reply_all(
        &self,
        request: &Envelope,
        payloads: Vec<Payload>,
    ) -> Result<(), ReplyError> {
        if payloads.is_empty() {
            return self.reply_empty(request).await;
        }
        let route = route(request)?;
        let shared = base(&route).with_header(
            headers::TOTAL_REPLIES,
            TotalReplies::Exactly(payloads.len()).to_header(),
        );

        match chunker::chunk(payloads, self.group_max_bytes) {
            Chunking::Grouped(groups) => {
                tracing::debug!(
                    correlation_id = %route.correlation_id,
                    groups = groups.len(),
                    "sending grouped replies"
                );
                for group in groups {
                    let envelope = group.into_envelope(shared.clone())?;
                    self.publish(&route, ReplyKind::Payload, envelope).await?;
                }
            }
            Chunking::Ungrouped(replies) => {
                for (index, payload) in replies.into_iter().enumerate() {
                    let envelope = shared
                        .clone()
                        .with_payload(payload)
                        .with_header(headers::REPLY_INDEX, index.to_string());
                    self.publish(&route, ReplyKind::Payload, envelope).await?;
                }
            }
        }
        Ok(())
    }

    /// One item of an answer whose size is not known yet.
    pub async fn reply_stream_item(
        &self,
        request: &Envelope,
        index: u64,
        payload: impl Into<Payload>,
    ) -> Result<(), ReplyError> {
        let route = route(request)?;
        let envelope = base(&route)
            .with_payload(payload)
            .with_header(headers::TOTAL_REPLIES, TotalReplies::Unbounded.to_header())
            .with_header(headers::REPLY_INDEX, index.to_string());
        self.publish(&route, ReplyKind::Payload, envelope).await
    }

    /// Close a streamed answer by announcing how many items were sent.
    pub async fn finish_stream(&self, request: &Envelope, total: usize) -> Result<(), ReplyError> {
        let route = route(request)?;
        let kind = if total == 0 {
            ReplyKind::Empty
        } else {
            ReplyKind::Payload
        };
        let envelope = base(&route).with_header(
            headers::TOTAL_REPLIES,
            TotalReplies::Exactly(total).to_header(),
        );
        self.publish(&route, kind, envelope).await
    }

    /// Successful answer with no data.
    pub async fn reply_empty(&self, request: &Envelope) -> Result<(), ReplyError> {
        let route = route(request)?;
        let envelope = base(&route).with_header(
            headers::TOTAL_REPLIES,
            TotalReplies::Exactly(0).to_header(),
        );
        self.publish(&route, ReplyKind::Empty, envelope).await
    }

    pub async fn reply_error(&self, request: &Envelope, message: &str) -> Result<(), ReplyError> {
        let route = route(request)?;
        let envelope = base(&route)
            .with_header(headers::ERROR_MESSAGE, message)
            .with_header(headers::TOTAL_REPLIES, TotalReplies::Exactly(0).to_header());
        self.publish(&route, ReplyKind::Error, envelope).await
    }

    async fn publish(
        &self,
        route: &Route,
        kind: ReplyKind,
        envelope: Envelope,
    ) -> Result<(), ReplyError> {
        let envelope = self.interceptor.wrap_reply(kind, envelope);
        self.transport
            .send(&route.reply_to, envelope)
            .await
            .map_err(|e| ReplyError::Send {
                destination: route.reply_to.clone(),
                reason: format!("{e:#}"),
            })
    }
}

fn route(request: &Envelope) -> Result<Route, ReplyError> {
    let reply_to = headers::reply_to(request);
    let correlation_id = headers::correlation_id(request);
    match (reply_to, correlation_id) {
        (Some(reply_to), Some(correlation_id)) => Ok(Route {
            reply_to,
            correlation_id,
        }),
        (reply_to, correlation_id) => Err(ReplyError::Send {
            destination: reply_to.unwrap_or_default(),
            reason: format!(
                "request lacks {}",
                if correlation_id.is_none() {
                    "a correlation id"
                } else {
                    "a reply-to destination"
                }
            ),
        }),
    }
}

fn base(route: &Route) -> Envelope {
    Envelope::new(Payload::empty())
        .with_header(headers::CORRELATION_ID, route.correlation_id.as_str())
}
