// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for query-cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for installing an exporter
//! (Prometheus, OTEL, etc.); without one every call here is a no-op.
//!
//! These are process-wide export counters. The per-instance counters that
//! back [`crate::CacheStats`] live on the cache itself so tests can inspect
//! isolated instances.
//!
//! # Metric Naming Convention
//! - `query_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: get, set, delete, invalidate_pattern, invalidate_tag
//! - `status`: hit, miss, success, error
//! - `outcome`: lock and memoization outcomes

use metrics::{counter, histogram};
use std::time::{Duration, Instant};

/// Record a cache operation
pub fn record_cache_op(operation: &str, status: &str) {
    counter!(
        "query_cache_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record entries removed by a delete or an invalidation
pub fn record_invalidated(operation: &str, count: u64) {
    counter!(
        "query_cache_invalidated_entries_total",
        "operation" => operation.to_string()
    )
    .increment(count);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "query_cache_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a lock operation outcome (acquired, timed_out, unavailable, released, not_owner, renewed)
pub fn record_lock(outcome: &str) {
    counter!(
        "query_cache_lock_operations_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how long an acquire waited before it resolved
pub fn record_lock_wait(duration: Duration) {
    histogram!("query_cache_lock_wait_seconds").record(duration.as_secs_f64());
}

/// Record a memoized call outcome (hit, computed, peer_filled, computed_uncached, timeout, error)
pub fn record_memo(identity: &str, outcome: &str) {
    counter!(
        "query_cache_memo_calls_total",
        "identity" => identity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the number of fused hits produced by one fusion call
pub fn record_fusion(strategies: usize, hits: usize) {
    histogram!("query_cache_fusion_strategies").record(strategies as f64);
    histogram!("query_cache_fusion_hits").record(hits as f64);
}

/// Record a search strategy that failed and was degraded to no results
pub fn record_strategy_failure(strategy: &str) {
    counter!(
        "query_cache_strategy_failures_total",
        "strategy" => strategy.to_string()
    )
    .increment(1);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "query_cache_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A timer that records latency when dropped
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_counters_reach_installed_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_cache_op("get", "hit");
            record_cache_op("get", "hit");
            record_lock("acquired");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let cache_hits = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "query_cache_operations_total")
            .map(|(_, _, _, value)| value.clone());
        assert_eq!(cache_hits, Some(&DebugValue::Counter(2)));

        let locks = snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "query_cache_lock_operations_total");
        assert!(locks);
    }

    #[test]
    fn test_latency_timer_records_on_drop() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let _timer = LatencyTimer::new("get");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert!(snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "query_cache_operation_seconds"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_cache_op("set", "success");
        record_invalidated("invalidate_tag", 3);
        record_memo("f", "hit");
        record_fusion(2, 10);
        record_strategy_failure("vector");
        record_circuit_call("store", "success");
    }
}
