use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Maximum number of entries kept in the failure history.
pub const FAILURE_HISTORY_LIMIT: usize = 50;

/// Smoothing factor for the recovery-time moving average.
const RECOVERY_EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub error: String,
    pub attempts: u32,
}

/// Process-wide resilience counters. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceMetrics {
    /// Retries scheduled (one per failed attempt that was followed by another).
    pub total_retries: u64,
    /// Operations that succeeded after at least one retry.
    pub successful_retries: u64,
    /// Operations that exhausted their attempt budget.
    pub failed_retries: u64,
    /// Operations that succeeded on the first attempt.
    pub first_attempt_successes: u64,
    pub successful_reconnections: u64,
    pub failed_reconnections: u64,
    /// Exponential moving average of reconnection time, in milliseconds.
    pub average_recovery_time_ms: f64,
    pub failure_history: VecDeque<FailureRecord>,
}

impl ResilienceMetrics {
    pub fn last_failure(&self) -> Option<&FailureRecord> {
        self.failure_history.back()
    }

    pub(crate) fn record_failure(&mut self, operation: &str, error: String, attempts: u32) {
        if self.failure_history.len() >= FAILURE_HISTORY_LIMIT {
            self.failure_history.pop_front();
        }
        self.failure_history.push_back(FailureRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            error,
            attempts,
        });
    }

    pub(crate) fn record_recovery(&mut self, recovery_time: Duration) {
        let sample = recovery_time.as_secs_f64() * 1_000.0;
        self.average_recovery_time_ms = if self.successful_reconnections == 0 {
            sample
        } else {
            RECOVERY_EMA_ALPHA * sample + (1.0 - RECOVERY_EMA_ALPHA) * self.average_recovery_time_ms
        };
        self.successful_reconnections += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded_and_drops_oldest() {
        let mut metrics = ResilienceMetrics::default();
        for i in 0..(FAILURE_HISTORY_LIMIT + 10) {
            metrics.record_failure(&format!("op-{i}"), "boom".into(), 1);
        }
        assert_eq!(metrics.failure_history.len(), FAILURE_HISTORY_LIMIT);
        assert_eq!(metrics.failure_history.front().unwrap().operation, "op-10");
        assert_eq!(metrics.last_failure().unwrap().operation, "op-59");
    }

    #[test]
    fn recovery_time_is_smoothed() {
        let mut metrics = ResilienceMetrics::default();
        metrics.record_recovery(Duration::from_millis(100));
        assert_eq!(metrics.average_recovery_time_ms, 100.0);

        metrics.record_recovery(Duration::from_millis(200));
        assert!((metrics.average_recovery_time_ms - 130.0).abs() < 1e-9);
        assert_eq!(metrics.successful_reconnections, 2);
    }
}
