//! Per-operation timing and a bounded slow-query log.

use configuration::PerformanceSettings;
use core_types::timestamp_now;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

impl OperationStats {
    fn record(&mut self, duration_ms: f64, success: bool) {
        self.count += 1;
        if !success {
            self.errors += 1;
        }
        self.total_ms += duration_ms;
        self.avg_ms = self.total_ms / self.count as f64;
        self.max_ms = self.max_ms.max(duration_ms);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Keyed by operation name, e.g. `find_many`.
    pub operations: BTreeMap<String, OperationStats>,
    pub totals: OperationStats,
    pub slow_query_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQuery {
    pub operation: String,
    pub collection: String,
    pub duration_ms: f64,
    pub success: bool,
    pub timestamp: String,
}

#[derive(Debug, Default)]
struct MonitorState {
    operations: BTreeMap<String, OperationStats>,
    totals: OperationStats,
    slow: VecDeque<SlowQuery>,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    threshold: Duration,
    capacity: usize,
    state: Mutex<MonitorState>,
}

impl PerformanceMonitor {
    pub fn new(threshold: Duration, capacity: usize) -> Self {
        Self {
            threshold,
            capacity: capacity.max(1),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn from_settings(settings: &PerformanceSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.slow_query_threshold_ms),
            settings.slow_query_log_size,
        )
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn record(&self, operation: &str, collection: &str, elapsed: Duration, success: bool) {
        let duration_ms = elapsed.as_secs_f64() * 1_000.0;
        let mut state = self.state.lock();
        state
            .operations
            .entry(operation.to_string())
            .or_default()
            .record(duration_ms, success);
        state.totals.record(duration_ms, success);

        if elapsed >= self.threshold {
            tracing::warn!(operation, collection, duration_ms, "Slow database operation");
            if state.slow.len() == self.capacity {
                state.slow.pop_front();
            }
            state.slow.push_back(SlowQuery {
                operation: operation.to_string(),
                collection: collection.to_string(),
                duration_ms,
                success,
                timestamp: timestamp_now(),
            });
        }
    }

    pub fn get_metrics(&self) -> PerformanceMetrics {
        let state = self.state.lock();
        PerformanceMetrics {
            operations: state.operations.clone(),
            totals: state.totals.clone(),
            slow_query_count: state.slow.len(),
        }
    }

    /// Most recent first.
    pub fn get_slow_queries(&self, limit: usize) -> Vec<SlowQuery> {
        self.state.lock().slow.iter().rev().take(limit).cloned().collect()
    }

    pub fn reset(&self) {
        *self.state.lock() = MonitorState::default();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::from_settings(&PerformanceSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_per_operation() {
        let monitor = PerformanceMonitor::new(Duration::from_millis(100), 10);
        monitor.record("find_many", "posts", Duration::from_millis(10), true);
        monitor.record("find_many", "posts", Duration::from_millis(30), false);
        monitor.record("insert", "posts", Duration::from_millis(5), true);

        let metrics = monitor.get_metrics();
        let find = &metrics.operations["find_many"];
        assert_eq!(find.count, 2);
        assert_eq!(find.errors, 1);
        assert!((find.avg_ms - 20.0).abs() < 1e-9);
        assert!((find.max_ms - 30.0).abs() < 1e-9);
        assert_eq!(metrics.totals.count, 3);
        assert_eq!(metrics.slow_query_count, 0);
    }

    #[test]
    fn slow_log_is_bounded_and_newest_first() {
        let monitor = PerformanceMonitor::new(Duration::from_millis(50), 2);
        for ms in [60, 70, 80] {
            monitor.record("count", "media", Duration::from_millis(ms), true);
        }
        monitor.record("count", "media", Duration::from_millis(1), true);

        let slow = monitor.get_slow_queries(10);
        assert_eq!(slow.len(), 2);
        assert!((slow[0].duration_ms - 80.0).abs() < 1e-9);
        assert!((slow[1].duration_ms - 70.0).abs() < 1e-9);
        assert_eq!(monitor.get_slow_queries(1).len(), 1);

        monitor.reset();
        assert!(monitor.get_slow_queries(10).is_empty());
        assert_eq!(monitor.get_metrics().totals.count, 0);
    }
}
