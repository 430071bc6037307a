//! Poller telemetry hooks.
//!
//! Embedders implement [`PollerTelemetry`] to observe poll outcomes without
//! depending on the poller's internals. [`CountingTelemetry`] keeps relaxed
//! atomic counters that can be exported to any metrics backend.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hook invoked on significant poller events. Every method defaults to a no-op.
pub trait PollerTelemetry: Send + Sync {
    /// Called for every request sent to the endpoint.
    fn on_poll(&self) {}
    /// Called when the request could not be completed.
    fn on_transport_error(&self) {}
    /// Called when a response was rejected or produced procedural errors.
    fn on_procedural_error(&self, _message: &str) {}
    fn on_configs_applied(&self, _count: usize) {}
    fn on_configs_failed(&self, _count: usize) {}
    fn on_configs_removed(&self, _count: usize) {}
}

#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl PollerTelemetry for NoopTelemetry {}

#[derive(Debug, Default)]
pub struct TelemetryCounters {
    polls: AtomicU64,
    transport_errors: AtomicU64,
    procedural_errors: AtomicU64,
    configs_applied: AtomicU64,
    configs_failed: AtomicU64,
    configs_removed: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            procedural_errors: self.procedural_errors.load(Ordering::Relaxed),
            configs_applied: self.configs_applied.load(Ordering::Relaxed),
            configs_failed: self.configs_failed.load(Ordering::Relaxed),
            configs_removed: self.configs_removed.load(Ordering::Relaxed),
        }
    }
}

/// Plain data view of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub polls: u64,
    pub transport_errors: u64,
    pub procedural_errors: u64,
    pub configs_applied: u64,
    pub configs_failed: u64,
    pub configs_removed: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "polls={}, transport_errors={}, procedural_errors={}, configs_applied={}, configs_failed={}, configs_removed={}",
            self.polls,
            self.transport_errors,
            self.procedural_errors,
            self.configs_applied,
            self.configs_failed,
            self.configs_removed
        )
    }
}

/// Telemetry implementation backed by shared atomic counters.
#[derive(Debug, Clone, Default)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    pub fn counters(&self) -> Arc<TelemetryCounters> {
        Arc::clone(&self.counters)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.counters.snapshot()
    }
}

fn add(counter: &AtomicU64, count: usize) {
    counter.fetch_add(count as u64, Ordering::Relaxed);
}

impl PollerTelemetry for CountingTelemetry {
    fn on_poll(&self) {
        add(&self.counters.polls, 1);
    }

    fn on_transport_error(&self) {
        add(&self.counters.transport_errors, 1);
    }

    fn on_procedural_error(&self, _message: &str) {
        add(&self.counters.procedural_errors, 1);
    }

    fn on_configs_applied(&self, count: usize) {
        add(&self.counters.configs_applied, count);
    }

    fn on_configs_failed(&self, count: usize) {
        add(&self.counters.configs_failed, count);
    }

    fn on_configs_removed(&self, count: usize) {
        add(&self.counters.configs_removed, count);
    }
}
