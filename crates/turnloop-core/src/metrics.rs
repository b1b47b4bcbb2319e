//! Counters and gauges reported by the agent loop
//!
//! The loop only talks to a [`MetricsObserver`]; callers decide where the
//! numbers go. [`InMemoryMetrics`] keeps them in process for snapshots and tests.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitStats;

pub const MESSAGES_PROCESSED: &str = "messages_processed";
pub const API_CALLS: &str = "api_calls";
pub const API_ERRORS: &str = "api_errors";
pub const MAX_ITERATIONS_REACHED: &str = "max_iterations_reached";
pub const API_LATENCY_MS: &str = "api_latency_ms";

pub fn tool_executions(tool: &str) -> String {
    format!("tool_executions.{}", tool)
}

pub fn tool_errors(tool: &str) -> String {
    format!("tool_errors.{}", tool)
}

pub fn tool_latency(tool: &str) -> String {
    format!("tool_latency.{}", tool)
}

/// Sink for named counters and gauges
pub trait MetricsObserver: Send + Sync {
    /// Add one to a counter
    fn increment(&self, name: &str);

    /// Set a gauge to its latest value
    fn record(&self, name: &str, value: f64);

    /// Current counter values (empty for write-only sinks)
    fn counters(&self) -> BTreeMap<String, u64> {
        BTreeMap::new()
    }

    /// Current gauge values (empty for write-only sinks)
    fn gauges(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    /// Drop all recorded values
    fn reset(&self) {}
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsObserver for NoopMetrics {
    fn increment(&self, _name: &str) {}

    fn record(&self, _name: &str, _value: f64) {}
}

#[derive(Debug, Default)]
struct MetricValues {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
}

/// Thread-safe in-process metrics store
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    values: Mutex<MetricValues>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of one counter (0 if never incremented)
    pub fn counter(&self, name: &str) -> u64 {
        self.values.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Latest value of one gauge
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.values.lock().gauges.get(name).copied()
    }
}

impl MetricsObserver for InMemoryMetrics {
    fn increment(&self, name: &str) {
        let mut values = self.values.lock();
        *values.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    fn record(&self, name: &str, value: f64) {
        self.values.lock().gauges.insert(name.to_string(), value);
    }

    fn counters(&self) -> BTreeMap<String, u64> {
        self.values.lock().counters.clone()
    }

    fn gauges(&self) -> BTreeMap<String, f64> {
        self.values.lock().gauges.clone()
    }

    fn reset(&self) {
        let mut values = self.values.lock();
        values.counters.clear();
        values.gauges.clear();
    }
}

/// Aggregated view returned by `AgentLoop::metrics_snapshot`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub rate_limit: RateLimitStats,
    pub active_sessions: usize,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauges() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(API_CALLS);
        metrics.increment(API_CALLS);
        metrics.increment(&tool_executions("echo"));
        metrics.record(API_LATENCY_MS, 12.5);
        metrics.record(API_LATENCY_MS, 20.0);

        assert_eq!(metrics.counter(API_CALLS), 2);
        assert_eq!(metrics.counter("tool_executions.echo"), 1);
        assert_eq!(metrics.counter(API_ERRORS), 0);
        assert_eq!(metrics.gauge(API_LATENCY_MS), Some(20.0));
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(MESSAGES_PROCESSED);
        metrics.record(&tool_latency("echo"), 1.0);
        metrics.reset();

        assert!(metrics.counters().is_empty());
        assert!(metrics.gauges().is_empty());
    }

    #[test]
    fn test_noop_reports_nothing() {
        let metrics = NoopMetrics;
        metrics.increment(API_CALLS);
        assert!(metrics.counters().is_empty());
    }
}
