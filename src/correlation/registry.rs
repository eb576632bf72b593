use super::handler::ResponseHandler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// In-flight requests keyed by correlation id.
///
/// At most one handler per id. Every operation holds the lock only for the
/// map access itself.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<String, Arc<ResponseHandler>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handler` under its correlation id unless one is already present.
    pub fn register_if_absent(&self, handler: Arc<ResponseHandler>) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains_key(handler.correlation_id()) {
            return false;
        }
        pending.insert(handler.correlation_id().to_string(), handler);
        true
    }

    pub fn lookup(&self, correlation_id: &str) -> Option<Arc<ResponseHandler>> {
        self.pending.lock().get(correlation_id).cloned()
    }

    pub fn remove(&self, correlation_id: &str) -> Option<Arc<ResponseHandler>> {
        self.pending.lock().remove(correlation_id)
    }

    /// Remove the entry only if it is still `handler`, so a stale caller
    /// cannot evict a newer request that reused the id.
    pub fn remove_handler(&self, handler: &Arc<ResponseHandler>) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(handler.correlation_id()) {
            Some(current) if Arc::ptr_eq(current, handler) => {
                pending.remove(handler.correlation_id());
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    /// Take every pending handler out of the registry.
    pub fn drain(&self) -> Vec<Arc<ResponseHandler>> {
        self.pending.lock().drain().map(|(_, handler)| handler).collect()
    }
}
