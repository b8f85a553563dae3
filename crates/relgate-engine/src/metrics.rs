//! # Engine Counters
//!
//! Lightweight in-process counters using atomics. Cloning shares the
//! underlying counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Shared counter state.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    passes: Arc<AtomicU64>,
    pass_errors: Arc<AtomicU64>,
    rules_processed: Arc<AtomicU64>,
    rules_reused: Arc<AtomicU64>,
    releases_finalized: Arc<AtomicU64>,
    lock_contended: Arc<AtomicU64>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub passes: u64,
    pub pass_errors: u64,
    pub rules_processed: u64,
    pub rules_reused: u64,
    pub releases_finalized: u64,
    pub lock_contended: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn pass_started(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pass_failed(&self) {
        self.pass_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rule_processed(&self) {
        self.rules_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rule_reused(&self) {
        self.rules_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release_finalized(&self) {
        self.releases_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lock_contended(&self) {
        self.lock_contended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            pass_errors: self.pass_errors.load(Ordering::Relaxed),
            rules_processed: self.rules_processed.load(Ordering::Relaxed),
            rules_reused: self.rules_reused.load(Ordering::Relaxed),
            releases_finalized: self.releases_finalized.load(Ordering::Relaxed),
            lock_contended: self.lock_contended.load(Ordering::Relaxed),
        }
    }
}
