use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated on every request and inbound reply.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    requests: AtomicU64,
    completed: AtomicU64,
    timeouts: AtomicU64,
    remote_errors: AtomicU64,
    send_failures: AtomicU64,
    cancelled: AtomicU64,
    duplicate_requests: AtomicU64,
    duplicate_replies: AtomicU64,
    unknown_replies: AtomicU64,
    malformed_replies: AtomicU64,
    late_replies: AtomicU64,
    unsupported_groups: AtomicU64,
}

/// Point-in-time copy of [`CoordinatorStats`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CoordinatorStatsSnapshot {
    pub requests: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub remote_errors: u64,
    pub send_failures: u64,
    pub cancelled: u64,
    pub duplicate_requests: u64,
    pub duplicate_replies: u64,
    pub unknown_replies: u64,
    pub malformed_replies: u64,
    pub late_replies: u64,
    pub unsupported_groups: u64,
}

impl CoordinatorStatsSnapshot {
    /// Requests registered but not yet finished one way or another.
    pub fn in_flight(&self) -> u64 {
        self.requests.saturating_sub(
            self.completed
                + self.timeouts
                + self.remote_errors
                + self.send_failures
                + self.cancelled,
        )
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CoordinatorStats {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_completed(&self) {
        bump(&self.completed);
    }

    pub fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    pub fn record_remote_error(&self) {
        bump(&self.remote_errors);
    }

    pub fn record_send_failure(&self) {
        bump(&self.send_failures);
    }

    pub fn record_cancelled(&self) {
        bump(&self.cancelled);
    }

    pub fn record_duplicate_request(&self) {
        bump(&self.duplicate_requests);
    }

    pub fn record_duplicate_reply(&self) {
        bump(&self.duplicate_replies);
    }

    pub fn record_unknown_reply(&self) {
        bump(&self.unknown_replies);
    }

    pub fn record_malformed_reply(&self) {
        bump(&self.malformed_replies);
    }

    pub fn record_late_reply(&self) {
        bump(&self.late_replies);
    }

    pub fn record_unsupported_group(&self) {
        bump(&self.unsupported_groups);
    }

    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CoordinatorStatsSnapshot {
            requests: load(&self.requests),
            completed: load(&self.completed),
            timeouts: load(&self.timeouts),
            remote_errors: load(&self.remote_errors),
            send_failures: load(&self.send_failures),
            cancelled: load(&self.cancelled),
            duplicate_requests: load(&self.duplicate_requests),
            duplicate_replies: load(&self.duplicate_replies),
            unknown_replies: load(&self.unknown_replies),
            malformed_replies: load(&self.malformed_replies),
            late_replies: load(&self.late_replies),
            unsupported_groups: load(&self.unsupported_groups),
        }
    }
}
