//! Destinations for accepted reply values.
//!
//! A handler owns the writing half; the caller keeps the reading half and
//! looks at it once the handler has completed.

use crate::envelope::Payload;
use crate::error::ReplyError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receives reply values in delivery order.
pub trait ReplySink: Send {
    /// Hand one value downstream. Returns `false` once the consumer is gone.
    fn accept(&mut self, payload: Payload) -> bool;

    /// Called exactly once when the handler reaches a terminal state.
    fn finish(&mut self, _error: Option<&ReplyError>) {}
}

/// Keeps the first accepted value; later ones are ignored.
#[derive(Debug)]
pub struct SingleSlot {
    slot: Arc<Mutex<Option<Payload>>>,
}

#[derive(Debug, Clone)]
pub struct SlotReader {
    slot: Arc<Mutex<Option<Payload>>>,
}

impl SlotReader {
    pub fn take(&self) -> Option<Payload> {
        self.slot.lock().take()
    }
}

pub fn single_slot() -> (SingleSlot, SlotReader) {
    let slot = Arc::new(Mutex::new(None));
    (
        SingleSlot {
            slot: Arc::clone(&slot),
        },
        SlotReader { slot },
    )
}

impl ReplySink for SingleSlot {
    fn accept(&mut self, payload: Payload) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
        true
    }
}

/// Ordered list of every accepted value.
#[derive(Debug)]
pub struct Collector {
    values: Arc<Mutex<Vec<Payload>>>,
}

#[derive(Debug, Clone)]
pub struct CollectorReader {
    values: Arc<Mutex<Vec<Payload>>>,
}

impl CollectorReader {
    pub fn take(&self) -> Vec<Payload> {
        std::mem::take(&mut *self.values.lock())
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

pub fn collector() -> (Collector, CollectorReader) {
    let values = Arc::new(Mutex::new(Vec::new()));
    (
        Collector {
            values: Arc::clone(&values),
        },
        CollectorReader { values },
    )
}

impl ReplySink for Collector {
    fn accept(&mut self, payload: Payload) -> bool {
        self.values.lock().push(payload);
        true
    }
}

pub type StreamItem = Result<Payload, ReplyError>;

/// Pushes values to a channel as they arrive. A terminal error becomes the
/// last item; the channel closes on finish either way.
#[derive(Debug)]
pub struct StreamSink {
    tx: Option<mpsc::UnboundedSender<StreamItem>>,
}

pub fn stream_sink() -> (StreamSink, mpsc::UnboundedReceiver<StreamItem>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamSink { tx: Some(tx) }, rx)
}

impl ReplySink for StreamSink {
    fn accept(&mut self, payload: Payload) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(payload)).is_ok())
    }

    fn finish(&mut self, error: Option<&ReplyError>) {
        if let (Some(tx), Some(error)) = (self.tx.take(), error) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}
