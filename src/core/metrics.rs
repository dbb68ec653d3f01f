//! Per-run execution counters
//!
//! Every completion context owns one [`RunMetrics`]. Counters are updated
//! from concurrent completion handlers with relaxed atomics and read back as
//! a serializable [`MetricsSnapshot`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::coord::types::FailureKind;

/// Run execution metrics
#[derive(Debug, Default)]
pub struct RunMetrics {
    /// Operations whose future was produced by the factory
    pub launched: AtomicU64,
    /// Operations recorded as results
    pub succeeded: AtomicU64,
    /// Operations recorded as operation failures
    pub failed: AtomicU64,
    /// Operations recorded as cancellation failures
    pub cancelled: AtomicU64,
    /// Operations whose factory failed before producing a future
    pub launch_failures: AtomicU64,
    /// Final callbacks that failed
    pub finalization_failures: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    settled_at: Mutex<Option<DateTime<Utc>>>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        if let Ok(mut started) = self.started_at.lock() {
            started.get_or_insert_with(Utc::now);
        }
    }

    pub fn record_settled(&self) {
        if let Ok(mut settled) = self.settled_at.lock() {
            settled.get_or_insert_with(Utc::now);
        }
    }

    pub fn record_launched(&self) {
        self.launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump the counter matching a failure classification
    pub fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Operation => &self.failed,
            FailureKind::Cancelled => &self.cancelled,
            FailureKind::Launch => &self.launch_failures,
            FailureKind::Finalization => &self.finalization_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let started_at = self.started_at.lock().ok().and_then(|guard| *guard);
        let settled_at = self.settled_at.lock().ok().and_then(|guard| *guard);
        let elapsed_ms = match (started_at, settled_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        };

        MetricsSnapshot {
            launched: self.launched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            finalization_failures: self.finalization_failures.load(Ordering::Relaxed),
            barrier_signals: 0,
            started_at,
            settled_at,
            elapsed_ms,
        }
    }
}

/// Point-in-time copy of [`RunMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub launched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub launch_failures: u64,
    pub finalization_failures: u64,
    /// Permits released on the barrier; filled in by the completion context
    pub barrier_signals: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
}

impl MetricsSnapshot {
    /// Operations that have reached an outcome, of any kind
    pub fn settled_operations(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled + self.launch_failures
    }

    /// Serialize to JSON for logging/export
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
