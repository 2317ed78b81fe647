//! Lifetime Metrics
//!
//! Lightweight counters for array and scope lifecycle events.  A single
//! [`ScopeMetrics`] is shared by a whole scope subtree, so a snapshot taken
//! at the top shows what every nested scope did.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - No allocation on the hot path

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Atomic lifecycle counters.
#[derive(Default)]
pub struct ScopeMetrics {
    pub arrays_created: AtomicU64,
    pub arrays_released: AtomicU64,
    pub release_failures: AtomicU64,

    pub scopes_opened: AtomicU64,
    pub scopes_closed: AtomicU64,

    pub invocations: AtomicU64,
    pub invoke_time_ns: AtomicU64,
}

impl ScopeMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_array_created(&self) {
        self.arrays_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_array_released(&self) {
        self.arrays_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release_failure(&self) {
        self.release_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scope_opened(&self) {
        self.scopes_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scope_closed(&self) {
        self.scopes_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one call into the dispatch service.
    pub fn record_invocation(&self, duration: Duration) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.invoke_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let created = self.arrays_created.load(Ordering::Relaxed);
        let released = self.arrays_released.load(Ordering::Relaxed);
        MetricsSnapshot {
            arrays_created: created,
            arrays_released: released,
            arrays_outstanding: created.saturating_sub(released),
            release_failures: self.release_failures.load(Ordering::Relaxed),
            scopes_opened: self.scopes_opened.load(Ordering::Relaxed),
            scopes_closed: self.scopes_closed.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            avg_invoke_us: self.avg_invoke_us(),
        }
    }

    fn avg_invoke_us(&self) -> f64 {
        let count = self.invocations.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.invoke_time_ns.load(Ordering::Relaxed);
        (total as f64) / (count as f64) / 1_000.0
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.arrays_created,
            &self.arrays_released,
            &self.release_failures,
            &self.scopes_opened,
            &self.scopes_closed,
            &self.invocations,
            &self.invoke_time_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time copy of [`ScopeMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub arrays_created: u64,
    pub arrays_released: u64,
    /// Created but not yet released.
    pub arrays_outstanding: u64,
    pub release_failures: u64,
    pub scopes_opened: u64,
    pub scopes_closed: u64,
    pub invocations: u64,
    pub avg_invoke_us: f64,
}

impl MetricsSnapshot {
    /// Human-readable summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "arrays: {} created, {} released, {} outstanding, {} failed releases; \
             scopes: {} opened, {} closed; invocations: {} (avg {:.2}us)",
            self.arrays_created,
            self.arrays_released,
            self.arrays_outstanding,
            self.release_failures,
            self.scopes_opened,
            self.scopes_closed,
            self.invocations,
            self.avg_invoke_us,
        )
    }
}
