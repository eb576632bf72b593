use super::handler::ResponseHandler;
use super::registry::CorrelationRegistry;
use super::sink::StreamItem;
use crate::error::ReplyError;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Push-based view of a multi-reply request.
///
/// Yields every reply in delivery order and ends after the last expected one.
/// A remote error or timeout arrives as a final `Err` item. Dropping the
/// stream early cancels the request and deregisters it.
pub struct ReplyStream {
    receiver: mpsc::UnboundedReceiver<StreamItem>,
    handler: Arc<ResponseHandler>,
    registry: Arc<CorrelationRegistry>,
}

impl ReplyStream {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<StreamItem>,
        handler: Arc<ResponseHandler>,
        registry: Arc<CorrelationRegistry>,
    ) -> Self {
        Self {
            receiver,
            handler,
            registry,
        }
    }

    pub fn correlation_id(&self) -> &str {
        self.handler.correlation_id()
    }

    /// Whether the request reached a terminal state. Buffered items may still
    /// be waiting to be read.
    pub fn is_finished(&self) -> bool {
        self.handler.is_completed()
    }
}

impl fmt::Debug for ReplyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyStream")
            .field("correlation_id", &self.correlation_id())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl Stream for ReplyStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        let cancelled = self.handler.cancel(ReplyError::Cancelled {
            correlation_id: self.handler.correlation_id().to_string(),
        });
        self.registry.remove_handler(&self.handler);
        if cancelled {
            tracing::debug!(
                correlation_id = %self.handler.correlation_id(),
                "reply stream dropped before completion"
            );
        }
    }
}
