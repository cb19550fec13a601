//! # Strata Resilience
//!
//! Keeps the data layer alive through transient outages:
//!
//! - **Retry**: bounded exponential backoff with jitter around any async
//!   operation ([`ResilienceManager::execute_with_retry`]).
//! - **Reconnection**: a single-flight reconnection flow run after retries are
//!   exhausted, which measures recovery time and alerts administrators when it
//!   fails ([`ResilienceManager::attempt_reconnection`]).
//! - **Diagnostics**: pool utilization classification and latency-based
//!   health checks.
//!
//! Failures are never hidden beyond the configured attempt budget, and the
//! alerting path can never crash the caller.

pub mod config;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod notifier;
pub mod pool;
pub mod sleeper;

pub use config::RetryConfig;
pub use health::{HEALTH_LATENCY_THRESHOLD, HealthReport};
pub use manager::{ReconnectionOutcome, ResilienceManager};
pub use metrics::{FAILURE_HISTORY_LIMIT, FailureRecord, ResilienceMetrics};
pub use notifier::{AdminNotifier, NotifyError};
pub use pool::{PoolDiagnostics, PoolHealth, PoolStats, diagnose_pool};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
