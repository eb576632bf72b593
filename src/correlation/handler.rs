use super::sink::ReplySink;
use crate::envelope::Payload;
use crate::error::ReplyError;
use crate::headers::{ReplyInfo, TotalReplies};
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Whether a request expects exactly one reply or a multi-part answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Single,
    /// Multi-part answer; one reply is expected until a count arrives.
    Multi,
    /// Multi-part answer of unknown size until a count arrives.
    Stream,
}

/// What happened to one inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted; the handler keeps waiting for more.
    Accepted,
    /// Accepted and the handler is now complete.
    Completed,
    /// Reply index already seen; dropped.
    Duplicate,
    /// Handler already completed; dropped.
    Late,
}

/// Bitmap of reply indices already accepted.
///
/// Indices at or beyond the capacity are not tracked and always pass.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    bits: Vec<u64>,
    cap: usize,
    untracked: u64,
}

impl DedupWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            bits: vec![0; cap.div_ceil(64)],
            cap,
            untracked: 0,
        }
    }

    /// Record `index`. Returns `false` if it was already present.
    pub fn insert(&mut self, index: u64) -> bool {
        let Some((word, mask)) = self.slot(index) else {
            self.untracked += 1;
            return true;
        };
        let Some(bits) = self.bits.get_mut(word) else {
            self.untracked += 1;
            return true;
        };
        if *bits & mask != 0 {
            return false;
        }
        *bits |= mask;
        true
    }

    pub fn contains(&self, index: u64) -> bool {
        self.slot(index)
            .and_then(|(word, mask)| self.bits.get(word).map(|bits| bits & mask != 0))
            .unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Number of indices that fell outside the window.
    pub fn untracked(&self) -> u64 {
        self.untracked
    }

    fn slot(&self, index: u64) -> Option<(usize, u64)> {
        let index = usize::try_from(index).ok().filter(|i| *i < self.cap)?;
        Some((index / 64, 1_u64 << (index % 64)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expected {
    Count(usize),
    Unbounded,
}

struct HandlerState {
    sink: Box<dyn ReplySink>,
    expected: Expected,
    expected_fixed: bool,
    received: usize,
    seen: DedupWindow,
    error: Option<ReplyError>,
    completed: bool,
}

/// Per-request reply accumulator.
///
/// Starts armed, accumulates replies, and ends in exactly one terminal state
/// (success, remote error, timeout, or cancellation). Every terminal transition
/// after the first is a no-op.
pub struct ResponseHandler {
    correlation_id: String,
    mode: ReplyMode,
    state: Mutex<HandlerState>,
    done: watch::Sender<bool>,
    created_at: Instant,
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResponseHandler")
            .field("correlation_id", &self.correlation_id)
            .field("mode", &self.mode)
            .field("expected", &state.expected)
            .field("received", &state.received)
            .field("completed", &state.completed)
            .finish_non_exhaustive()
    }
}

impl ResponseHandler {
    pub fn new(
        correlation_id: impl Into<String>,
        mode: ReplyMode,
        sink: Box<dyn ReplySink>,
        dedup_window: usize,
    ) -> Self {
        let (done, _) = watch::channel(false);
        let expected = match mode {
            ReplyMode::Stream => Expected::Unbounded,
            ReplyMode::Single | ReplyMode::Multi => Expected::Count(1),
        };
        Self {
            correlation_id: correlation_id.into(),
            mode,
            state: Mutex::new(HandlerState {
                sink,
                expected,
                expected_fixed: false,
                received: 0,
                seen: DedupWindow::new(dedup_window),
                error: None,
                completed: false,
            }),
            done,
            created_at: Instant::now(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn mode(&self) -> ReplyMode {
        self.mode
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn received(&self) -> usize {
        self.state.lock().received
    }

    /// `None` while the reply count is unbounded.
    pub fn expected(&self) -> Option<usize> {
        match self.state.lock().expected {
            Expected::Count(count) => Some(count),
            Expected::Unbounded => None,
        }
    }

    /// Fix the number of replies to wait for. Only honoured in multi-reply
    /// and stream modes, once, and before any reply has been accepted.
    pub fn set_expected_count(&self, total: TotalReplies) -> bool {
        let mut state = self.state.lock();
        if state.completed || state.received > 0 {
            return false;
        }
        self.set_expected_locked(&mut state, total)
    }

    /// Apply one inbound reply (a single payload, or every entry of an
    /// unpacked group) against the handler's state.
    ///
    /// A reply carrying `totalReplies=N` with no index and an empty body is a
    /// count marker only while the expected count is still unbounded. Once a
    /// count is known, the same message is an ordinary (empty) data reply.
    pub fn accept(&self, info: &ReplyInfo, payloads: Vec<Payload>) -> DeliveryOutcome {
        let mut state = self.state.lock();
        if state.completed {
            return DeliveryOutcome::Late;
        }
        if let Some(message) = &info.error_message {
            self.complete_locked(&mut state, Some(ReplyError::remote(message.as_str())));
            return DeliveryOutcome::Completed;
        }
        if info.total_replies.is_some_and(TotalReplies::is_terminal) {
            self.complete_locked(&mut state, None);
            return DeliveryOutcome::Completed;
        }
        if self.mode != ReplyMode::Single && state.expected == Expected::Unbounded {
            if let Some(TotalReplies::Exactly(total)) = info.total_replies {
                state.expected = Expected::Count(total);
                state.expected_fixed = true;
                if info.reply_index.is_none() && payloads.iter().all(Payload::is_empty) {
                    return self.complete_if_satisfied(&mut state);
                }
            }
        }
        self.deliver_locked(&mut state, info, payloads)
    }

    /// Data path only: dedup, record, hand to the sink, complete when the
    /// expected count is reached.
    pub fn deliver(&self, info: &ReplyInfo, payload: Payload) -> DeliveryOutcome {
        self.deliver_batch(info, vec![payload])
    }

    /// Like [`deliver`](Self::deliver) for an unpacked group; the whole batch
    /// shares the dedup key of its range start.
    pub fn deliver_batch(&self, info: &ReplyInfo, payloads: Vec<Payload>) -> DeliveryOutcome {
        let mut state = self.state.lock();
        if state.completed {
            return DeliveryOutcome::Late;
        }
        self.deliver_locked(&mut state, info, payloads)
    }

    /// Terminal success with no further data.
    pub fn deliver_empty(&self) -> bool {
        let mut state = self.state.lock();
        if state.completed {
            return false;
        }
        self.complete_locked(&mut state, None);
        true
    }

    pub fn deliver_error(&self, message: impl Into<String>) -> bool {
        self.cancel(ReplyError::remote(message))
    }

    /// Fail the handler with `error` unless it already completed.
    pub fn cancel(&self, error: ReplyError) -> bool {
        let mut state = self.state.lock();
        if state.completed {
            return false;
        }
        self.complete_locked(&mut state, Some(error));
        true
    }

    /// Wait for the completion signal.
    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|completed| *completed).await;
    }

    /// Wait for completion until `deadline`. Returns `false` on elapse.
    pub async fn wait_until(&self, deadline: tokio::time::Instant) -> bool {
        tokio::time::timeout_at(deadline, self.wait()).await.is_ok()
    }

    /// `None` while still pending; otherwise the terminal result.
    pub fn outcome(&self) -> Option<Result<(), ReplyError>> {
        let state = self.state.lock();
        state.completed.then(|| match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        })
    }

    fn set_expected_locked(&self, state: &mut HandlerState, total: TotalReplies) -> bool {
        if self.mode == ReplyMode::Single || state.expected_fixed {
            return false;
        }
        state.expected = match total {
            TotalReplies::Exactly(count) => Expected::Count(count),
            TotalReplies::Unbounded => Expected::Unbounded,
        };
        state.expected_fixed = true;
        true
    }

    fn deliver_locked(
        &self,
        state: &mut HandlerState,
        info: &ReplyInfo,
        payloads: Vec<Payload>,
    ) -> DeliveryOutcome {
        if let Some(index) = info.reply_index {
            if !state.seen.insert(index.start()) {
                tracing::debug!(
                    correlation_id = %self.correlation_id,
                    reply_index = %index,
                    "dropping duplicate reply"
                );
                return DeliveryOutcome::Duplicate;
            }
        }
        if state.received == 0 {
            // No count on the first reply means a single-reply responder.
            let total = info.total_replies.unwrap_or(TotalReplies::Exactly(1));
            self.set_expected_locked(state, total);
        }

        for payload in payloads {
            state.received += 1;
            if !state.sink.accept(payload) {
                self.complete_locked(
                    state,
                    Some(ReplyError::Cancelled {
                        correlation_id: self.correlation_id.clone(),
                    }),
                );
                return DeliveryOutcome::Completed;
            }
        }

        if self.mode == ReplyMode::Single {
            self.complete_locked(state, None);
            return DeliveryOutcome::Completed;
        }
        self.complete_if_satisfied(state)
    }

    fn complete_if_satisfied(&self, state: &mut HandlerState) -> DeliveryOutcome {
        match state.expected {
            Expected::Count(count) if state.received >= count => {
                self.complete_locked(state, None);
                DeliveryOutcome::Completed
            }
            _ => DeliveryOutcome::Accepted,
        }
    }

    fn complete_locked(&self, state: &mut HandlerState, error: Option<ReplyError>) {
        state.completed = true;
        state.sink.finish(error.as_ref());
        state.error = error;
        self.done.send_replace(true);
        tracing::debug!(
            correlation_id = %self.correlation_id,
            received = state.received,
            elapsed_ms = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
            failed = state.error.is_some(),
            "response handler completed"
        );
    }
}
