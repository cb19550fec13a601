use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// A ping slower than this marks the database unhealthy. Fixed so health
/// semantics compare across deployments.
pub const HEALTH_LATENCY_THRESHOLD: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub(crate) fn from_ping(latency: Duration, error: Option<String>) -> Self {
        Self {
            healthy: error.is_none() && latency < HEALTH_LATENCY_THRESHOLD,
            latency_ms: latency.as_secs_f64() * 1_000.0,
            error,
            checked_at: Utc::now(),
        }
    }
}
