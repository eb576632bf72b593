//! Collaborators the correlation engine consumes: the publish function, the
//! destination resolver, the payload converter, and interceptor hooks.

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryBrokerLimits, InMemoryBrokerStats};

use crate::envelope::Envelope;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Fire-and-forget publish side of a pub/sub binder.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name, used in logs.
    fn name(&self) -> &str;

    /// Publish `envelope` to the concrete destination (topic/queue) name.
    async fn send(&self, destination: &str, envelope: Envelope) -> anyhow::Result<()>;
}

/// Maps logical binding names to concrete transport destinations and back.
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, binding: &str) -> String;

    /// Binding whose destination (or destination pattern) matches `destination`.
    fn binding_for(&self, destination: &str) -> Option<String>;
}

/// Resolver backed by a fixed binding table, typically `[bindings]` from config.
///
/// Unknown bindings resolve to themselves so callers may pass concrete topic
/// names directly.
#[derive(Debug, Clone, Default)]
pub struct StaticDestinationResolver {
    bindings: BTreeMap<String, String>,
}

impl StaticDestinationResolver {
    pub fn new(bindings: BTreeMap<String, String>) -> Self {
        Self { bindings }
    }

    #[must_use]
    pub fn with_binding(
        mut self,
        binding: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        self.bindings.insert(binding.into(), destination.into());
        self
    }
}

impl DestinationResolver for StaticDestinationResolver {
    fn resolve(&self, binding: &str) -> String {
        self.bindings
            .get(binding)
            .cloned()
            .unwrap_or_else(|| binding.to_string())
    }

    fn binding_for(&self, destination: &str) -> Option<String> {
        self.bindings
            .iter()
            .find(|(_, target)| target.as_str() == destination)
            .or_else(|| {
                self.bindings
                    .iter()
                    .find(|(_, target)| topic_matches(target, destination))
            })
            .map(|(binding, _)| binding.clone())
    }
}

/// MQTT-style topic matching: `+` matches one level, a trailing `#` matches
/// the remaining levels (including none).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return pattern_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Bytes ⇄ typed value conversion for payloads.
pub trait PayloadConverter: Send + Sync {
    fn to_bytes(&self, value: &Value) -> anyhow::Result<Vec<u8>>;
    fn from_bytes(&self, bytes: &[u8]) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl PayloadConverter for JsonConverter {
    fn to_bytes(&self, value: &Value) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(value).context("serialize payload as JSON")
    }

    fn from_bytes(&self, bytes: &[u8]) -> anyhow::Result<Value> {
        serde_json::from_slice(bytes).context("payload is not valid JSON")
    }
}

/// Kind of reply a responder is about to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Payload,
    Empty,
    Error,
}

/// Pass-through extension points around send and reply.
pub trait Interceptor: Send + Sync {
    fn pre_send(&self, envelope: Envelope) -> Envelope {
        envelope
    }

    fn wrap_reply(&self, _kind: ReplyKind, envelope: Envelope) -> Envelope {
        envelope
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterceptor;

impl Interceptor for NoopInterceptor {}
