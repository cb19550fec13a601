use crate::config::RetryConfig;
use crate::health::HealthReport;
use crate::metrics::ResilienceMetrics;
use crate::notifier::AdminNotifier;
use crate::pool::{PoolDiagnostics, PoolHealth, PoolStats, diagnose_pool};
use crate::sleeper::{Sleeper, TokioSleeper};
use core_types::{DatabaseError, DatabaseResult, ErrorCode};
use parking_lot::Mutex;
use serde_json::json;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// The result of a reconnection attempt.
#[derive(Debug, Clone)]
pub enum ReconnectionOutcome {
    Recovered { recovery_time: Duration },
    /// Every reconnection attempt failed; administrators have been notified.
    Failed(DatabaseError),
    /// Another caller is already reconnecting; this attempt collapsed into it.
    AlreadyInProgress,
}

impl ReconnectionOutcome {
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered { .. })
    }
}

/// Clears the reconnection flag when the attempt finishes, even if the
/// future is dropped mid-flight.
struct ReconnectingGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ResilienceManager {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
    metrics: Mutex<ResilienceMetrics>,
    reconnecting: AtomicBool,
}

impl ResilienceManager {
    pub fn new(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            config,
            sleeper,
            metrics: Mutex::new(ResilienceMetrics::default()),
            reconnecting: AtomicBool::new(false),
        }
    }

    /// A manager that sleeps on the tokio timer.
    pub fn with_config(config: RetryConfig) -> Self {
        Self::new(config, Arc::new(TokioSleeper))
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// A snapshot of the current counters.
    pub fn metrics(&self) -> ResilienceMetrics {
        self.metrics.lock().clone()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock() = ResilienceMetrics::default();
        tracing::info!("Resilience metrics reset");
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    /// Runs `operation` up to `max_attempts` times, sleeping the backoff delay
    /// between attempts. `on_retry(attempt, error)` is called after each failed
    /// attempt that will be retried. The last error is returned once the
    /// budget is spent.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        name: &str,
        mut operation: F,
        on_retry: Option<&(dyn Fn(u32, &E) + Send + Sync)>,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    let mut metrics = self.metrics.lock();
                    if attempt > 1 {
                        metrics.successful_retries += 1;
                        tracing::info!(operation = name, attempt, "Operation succeeded after retry");
                    } else {
                        metrics.first_attempt_successes += 1;
                    }
                    return Ok(value);
                }
                Err(err) if attempt < max_attempts => {
                    let delay = self.config.delay_for_attempt(attempt, &mut rand::thread_rng());
                    tracing::warn!(
                        operation = name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Operation failed, retrying"
                    );
                    self.metrics.lock().total_retries += 1;
                    if let Some(callback) = on_retry {
                        callback(attempt, &err);
                    }
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(operation = name, attempts = attempt, error = %err, "Operation failed after all retries");
                    let mut metrics = self.metrics.lock();
                    metrics.failed_retries += 1;
                    metrics.record_failure(name, err.to_string(), attempt);
                    return Err(err);
                }
            }
        }
    }

    /// Re-establishes the connection with `reconnect`, itself retried under the
    /// same policy. Concurrent calls collapse into the one already running.
    /// When every attempt fails administrators are notified once; a failing
    /// notifier is logged and otherwise ignored.
    pub async fn attempt_reconnection<R, RFut>(
        &self,
        reconnect: R,
        notifier: &dyn AdminNotifier,
    ) -> ReconnectionOutcome
    where
        R: FnMut() -> RFut,
        RFut: Future<Output = DatabaseResult<()>>,
    {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Reconnection already in progress");
            return ReconnectionOutcome::AlreadyInProgress;
        }
        let _guard = ReconnectingGuard(&self.reconnecting);

        tracing::info!("Attempting database reconnection");
        let started = Instant::now();
        match self.execute_with_retry("reconnect", reconnect, None).await {
            Ok(()) => {
                let recovery_time = started.elapsed();
                self.metrics.lock().record_recovery(recovery_time);
                tracing::info!(
                    recovery_ms = recovery_time.as_millis() as u64,
                    "Database connection re-established"
                );
                ReconnectionOutcome::Recovered { recovery_time }
            }
            Err(cause) => {
                self.metrics.lock().failed_reconnections += 1;
                let error = DatabaseError::new(
                    ErrorCode::RECONNECTION_FAILED,
                    format!(
                        "Failed to reconnect after {} attempts: {}",
                        self.config.max_attempts.max(1),
                        cause.message
                    ),
                )
                .with_details(json!({ "cause": cause.code }));
                tracing::error!(error = %error, "Database reconnection failed");

                if let Err(notify_err) = notifier.notify_admins(&error).await {
                    tracing::warn!(error = %notify_err, "Failed to notify administrators");
                }
                ReconnectionOutcome::Failed(error)
            }
        }
    }

    /// Retries `operation`; once the budget is spent, runs the reconnection
    /// flow and, if it recovers, gives `operation` one more attempt. Otherwise
    /// the operation's last error is returned.
    pub async fn execute_with_recovery<T, F, Fut, R, RFut>(
        &self,
        name: &str,
        mut operation: F,
        reconnect: R,
        notifier: &dyn AdminNotifier,
    ) -> DatabaseResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DatabaseResult<T>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = DatabaseResult<()>>,
    {
        match self.execute_with_retry(name, &mut operation, None).await {
            Ok(value) => Ok(value),
            Err(err) => match self.attempt_reconnection(reconnect, notifier).await {
                ReconnectionOutcome::Recovered { .. } => operation().await,
                ReconnectionOutcome::Failed(_) | ReconnectionOutcome::AlreadyInProgress => Err(err),
            },
        }
    }

    pub fn get_pool_diagnostics(&self, stats: PoolStats) -> PoolDiagnostics {
        let diagnostics = diagnose_pool(stats);
        if diagnostics.health != PoolHealth::Healthy {
            tracing::warn!(
                health = ?diagnostics.health,
                utilization = diagnostics.utilization_percent,
                waiting = stats.waiting_requests,
                "Connection pool under pressure"
            );
        }
        diagnostics
    }

    /// Times a single `ping`. Healthy iff it succeeds within
    /// [`HEALTH_LATENCY_THRESHOLD`](crate::HEALTH_LATENCY_THRESHOLD).
    pub async fn health_check<F, Fut>(&self, ping: F) -> HealthReport
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DatabaseResult<()>>,
    {
        let started = Instant::now();
        let result = ping().await;
        let report = HealthReport::from_ping(started.elapsed(), result.err().map(|e| e.to_string()));
        if !report.healthy {
            tracing::warn!(latency_ms = report.latency_ms, error = ?report.error, "Health check failed");
        }
        report
    }
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::with_config(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotifyError;
    use crate::sleeper::RecordingSleeper;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn manager(max_attempts: u32) -> (ResilienceManager, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let config = RetryConfig::new(max_attempts)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000))
            .with_jitter(Duration::ZERO);
        (ResilienceManager::new(config, sleeper.clone()), sleeper)
    }

    fn connection_error() -> DatabaseError {
        DatabaseError::new(ErrorCode::CONNECTION_FAILED, "connection refused")
    }

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl AdminNotifier for CountingNotifier {
        async fn notify_admins(&self, error: &DatabaseError) -> Result<(), NotifyError> {
            assert_eq!(error.code, ErrorCode::RECONNECTION_FAILED);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("telegram unreachable".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn succeeds_after_two_failures() {
        let (manager, sleeper) = manager(3);
        let calls = AtomicU32::new(0);
        let retried = Mutex::new(Vec::new());
        let on_retry = |attempt: u32, _: &DatabaseError| retried.lock().push(attempt);

        let result = manager
            .execute_with_retry(
                "connect",
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(connection_error())
                    } else {
                        Ok(42)
                    }
                },
                Some(&on_retry),
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        let metrics = manager.metrics();
        assert_eq!(metrics.successful_retries, 1);
        assert_eq!(metrics.total_retries, 2);
        assert_eq!(metrics.first_attempt_successes, 0);
        assert_eq!(*retried.lock(), vec![1, 2]);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn first_attempt_success_is_not_a_retry() {
        let (manager, sleeper) = manager(3);
        let result: Result<&str, DatabaseError> =
            manager.execute_with_retry("ping", || async { Ok("pong") }, None).await;

        assert_eq!(result.unwrap(), "pong");
        let metrics = manager.metrics();
        assert_eq!(metrics.first_attempt_successes, 1);
        assert_eq!(metrics.successful_retries, 0);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_error() {
        let (manager, sleeper) = manager(3);
        let calls = AtomicU32::new(0);
        let result: Result<(), DatabaseError> = manager
            .execute_with_retry(
                "connect",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(DatabaseError::new(ErrorCode::CONNECTION_FAILED, format!("attempt {n}")))
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap_err().message, "attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays().len(), 2);

        let metrics = manager.metrics();
        assert_eq!(metrics.failed_retries, 1);
        assert_eq!(metrics.total_retries, 2);
        let failure = metrics.last_failure().unwrap();
        assert_eq!(failure.operation, "connect");
        assert_eq!(failure.attempts, 3);
    }

    #[tokio::test]
    async fn exhaustion_notifies_admins_exactly_once() {
        let (manager, _) = manager(3);
        let notifier = CountingNotifier::default();

        let result: DatabaseResult<()> = manager
            .execute_with_recovery(
                "connect",
                || async { Err(connection_error()) },
                || async { Err(connection_error()) },
                &notifier,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::CONNECTION_FAILED);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        let metrics = manager.metrics();
        assert_eq!(metrics.failed_reconnections, 1);
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test]
    async fn notifier_failure_is_swallowed() {
        let (manager, _) = manager(1);
        let notifier = CountingNotifier { fail: true, ..Default::default() };

        let outcome = manager
            .attempt_reconnection(|| async { Err(connection_error()) }, &notifier)
            .await;

        match outcome {
            ReconnectionOutcome::Failed(err) => assert_eq!(err.code, ErrorCode::RECONNECTION_FAILED),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_retries_the_operation_once_more() {
        let (manager, _) = manager(2);
        let notifier = CountingNotifier::default();
        let healthy = AtomicBool::new(false);

        let result = manager
            .execute_with_recovery(
                "find",
                || async {
                    if healthy.load(Ordering::SeqCst) {
                        Ok("doc")
                    } else {
                        Err(connection_error())
                    }
                },
                || async {
                    healthy.store(true, Ordering::SeqCst);
                    Ok(())
                },
                &notifier,
            )
            .await;

        assert_eq!(result.unwrap(), "doc");
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.metrics().successful_reconnections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reconnections_collapse() {
        let (manager, _) = manager(1);
        let notifier = CountingNotifier::default();
        let reconnects = AtomicU32::new(0);
        let reconnect = || async {
            reconnects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(())
        };

        let (first, second) = tokio::join!(
            manager.attempt_reconnection(reconnect, &notifier),
            manager.attempt_reconnection(reconnect, &notifier),
        );

        assert!(first.is_recovered());
        assert!(matches!(second, ReconnectionOutcome::AlreadyInProgress));
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);

        let metrics = manager.metrics();
        assert_eq!(metrics.successful_reconnections, 1);
        assert!((250.0..260.0).contains(&metrics.average_recovery_time_ms));
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_uses_latency_threshold() {
        let (manager, _) = manager(1);

        let fast = manager
            .health_check(|| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            })
            .await;
        assert!(fast.healthy);
        assert!((20.0..30.0).contains(&fast.latency_ms));

        let slow = manager
            .health_check(|| async {
                tokio::time::sleep(Duration::from_millis(1_500)).await;
                Ok(())
            })
            .await;
        assert!(!slow.healthy);
        assert!(slow.error.is_none());

        let failed = manager.health_check(|| async { Err(connection_error()) }).await;
        assert!(!failed.healthy);
        assert!(failed.error.unwrap().contains("CONNECTION_FAILED"));
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let (manager, _) = manager(1);
        let _: Result<(), DatabaseError> =
            manager.execute_with_retry("op", || async { Err(connection_error()) }, None).await;
        assert_eq!(manager.metrics().failed_retries, 1);

        manager.reset_metrics();
        assert_eq!(manager.metrics(), ResilienceMetrics::default());
    }
}
