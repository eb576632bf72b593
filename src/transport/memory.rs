use super::{topic_matches, Transport};
use crate::envelope::Envelope;
use crate::headers;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Callback invoked for every envelope published to a matching topic.
pub type Subscriber = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Errors emitted by the in-memory broker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("invalid topic pattern `{pattern}`: `#` must be the last level")]
    InvalidPattern { pattern: String },
    #[error("subscription limit of {max} reached")]
    SubscriptionLimit { max: usize },
}

/// Publish result metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub sequence: u64,
    pub delivered_to: usize,
}

/// Publish that reached no subscriber, retained for debugging.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub topic: String,
    pub envelope: Envelope,
    pub reason: String,
}

/// Capacity limits used by `InMemoryBroker` retention policies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InMemoryBrokerLimits {
    pub max_subscriptions: usize,
    pub max_dead_letters: usize,
}

impl Default for InMemoryBrokerLimits {
    fn default() -> Self {
        Self {
            max_subscriptions: 1024,
            max_dead_letters: 256,
        }
    }
}

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InMemoryBrokerStats {
    /// Total publish calls with a non-empty topic.
    pub publish_attempts_total: u64,
    /// Total subscriber invocations (fan-out count).
    pub deliveries_total: u64,
    /// Total dead-letter entries ever recorded.
    pub dead_letters_total: u64,
    /// Number of dead-letter entries evicted due to dead-letter cap.
    pub dead_letter_evictions_total: u64,
}

struct Subscription {
    id: u64,
    pattern: String,
    subscriber: Subscriber,
}

struct BrokerState {
    next_sequence: u64,
    next_subscription_id: u64,
    subscriptions: Vec<Subscription>,
    dead_letters: VecDeque<DeadLetter>,
    limits: InMemoryBrokerLimits,
    stats: InMemoryBrokerStats,
}

impl BrokerState {
    fn with_limits(mut limits: InMemoryBrokerLimits) -> Self {
        if limits.max_subscriptions == 0 {
            limits.max_subscriptions = 1;
        }
        if limits.max_dead_letters == 0 {
            limits.max_dead_letters = 1;
        }

        Self {
            next_sequence: 0,
            next_subscription_id: 0,
            subscriptions: Vec::new(),
            dead_letters: VecDeque::new(),
            limits,
            stats: InMemoryBrokerStats::default(),
        }
    }
}

/// Process-local pub/sub broker with:
/// - MQTT-style wildcard subscriptions
/// - synchronous fan-out on the publishing task, outside the state lock
/// - bounded dead-letter retention for publishes nobody listens to
///
/// Subscribers run on the publisher's thread, so many publishers mean many
/// concurrent delivery threads, just like a real binder.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("InMemoryBroker")
            .field("subscriptions", &state.subscriptions.len())
            .field("stats", &state.stats)
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_limits(InMemoryBrokerLimits::default())
    }

    pub fn with_limits(limits: InMemoryBrokerLimits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerState::with_limits(limits))),
        }
    }

    /// Register `subscriber` for every topic matching `pattern`.
    pub fn subscribe<F>(
        &self,
        pattern: impl Into<String>,
        subscriber: F,
    ) -> Result<u64, BrokerError>
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        validate_pattern(&pattern)?;

        let mut state = self.inner.lock();
        if state.subscriptions.len() >= state.limits.max_subscriptions {
            return Err(BrokerError::SubscriptionLimit {
                max: state.limits.max_subscriptions,
            });
        }
        state.next_subscription_id += 1;
        let id = state.next_subscription_id;
        tracing::debug!(subscription = id, pattern = %pattern, "subscribed");
        state.subscriptions.push(Subscription {
            id,
            pattern,
            subscriber: Arc::new(subscriber),
        });
        Ok(id)
    }

    pub fn unsubscribe(&self, subscription: u64) -> bool {
        let mut state = self.inner.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|entry| entry.id != subscription);
        before != state.subscriptions.len()
    }

    /// Publish `envelope` to `topic`, invoking matching subscribers in
    /// subscription order.
    pub fn publish(&self, topic: &str, envelope: Envelope) -> Result<PublishReceipt, BrokerError> {
        if topic.trim().is_empty() {
            return Err(BrokerError::EmptyTopic);
        }

        let (sequence, targets) = {
            let mut state = self.inner.lock();
            state.stats.publish_attempts_total += 1;
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            let targets: Vec<Subscriber> = state
                .subscriptions
                .iter()
                .filter(|entry| topic_matches(&entry.pattern, topic))
                .map(|entry| Arc::clone(&entry.subscriber))
                .collect();

            if targets.is_empty() {
                push_dead_letter_locked(
                    &mut state,
                    DeadLetter {
                        topic: topic.to_string(),
                        envelope,
                        reason: format!("no subscriber for topic '{topic}'"),
                    },
                );
                return Ok(PublishReceipt {
                    sequence,
                    delivered_to: 0,
                });
            }
            state.stats.deliveries_total += targets.len() as u64;
            (sequence, targets)
        };

        let delivered_to = targets.len();
        for subscriber in targets {
            subscriber(envelope.clone());
        }

        Ok(PublishReceipt {
            sequence,
            delivered_to,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn limits(&self) -> InMemoryBrokerLimits {
        self.inner.lock().limits
    }

    pub fn stats(&self) -> InMemoryBrokerStats {
        self.inner.lock().stats
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead_letters.iter().cloned().collect()
    }

    /// Dead letters whose envelope carries `correlation_id`.
    pub fn dead_letters_for_correlation(&self, correlation_id: &str) -> Vec<DeadLetter> {
        self.inner.lock()
            .dead_letters
            .iter()
            .filter(|entry| {
                headers::correlation_id(&entry.envelope).as_deref() == Some(correlation_id)
            })
            .cloned()
            .collect()
    }

}

#[async_trait]
impl Transport for InMemoryBroker {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn send(&self, destination: &str, envelope: Envelope) -> anyhow::Result<()> {
        let receipt = self.publish(destination, envelope)?;
        if receipt.delivered_to == 0 {
            tracing::warn!(
                destination,
                sequence = receipt.sequence,
                "published to a topic with no subscribers"
            );
        }
        Ok(())
    }
}

fn validate_pattern(pattern: &str) -> Result<(), BrokerError> {
    if pattern.trim().is_empty() {
        return Err(BrokerError::EmptyTopic);
    }
    let levels: Vec<&str> = pattern.split('/').collect();
    if let Some(position) = levels.iter().position(|level| *level == "#") {
        if position + 1 != levels.len() {
            return Err(BrokerError::InvalidPattern {
                pattern: pattern.to_string(),
            });
        }
    }
    Ok(())
}

fn push_dead_letter_locked(state: &mut BrokerState, dead_letter: DeadLetter) {
    state.stats.dead_letters_total += 1;
    if state.dead_letters.len() >= state.limits.max_dead_letters {
        state.stats.dead_letter_evictions_total += 1;
        let _ = state.dead_letters.pop_front();
    }
    state.dead_letters.push_back(dead_letter);
}
