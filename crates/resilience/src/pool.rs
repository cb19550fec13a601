use serde::Serialize;

/// A point-in-time view of a connection pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Pool capacity (the configured maximum).
    pub total_connections: u32,
    /// Connections currently checked out.
    pub active_connections: u32,
    pub idle_connections: u32,
    /// Requests waiting for a connection.
    pub waiting_requests: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDiagnostics {
    pub stats: PoolStats,
    /// Active / total, as a percentage.
    pub utilization_percent: f64,
    pub health: PoolHealth,
    pub recommendations: Vec<String>,
}

const DEGRADED_UTILIZATION: f64 = 75.0;
const CRITICAL_UTILIZATION: f64 = 90.0;
const DEGRADED_WAITERS: u32 = 5;
const CRITICAL_WAITERS: u32 = 10;
const IDLE_UTILIZATION: f64 = 10.0;

/// Classifies pool health:
/// - `healthy`: utilization below 75% and at most 5 waiters
/// - `degraded`: 75–90% utilization or 6–10 waiters
/// - `critical`: above 90% utilization or more than 10 waiters
pub fn diagnose_pool(stats: PoolStats) -> PoolDiagnostics {
    if stats.total_connections == 0 {
        return PoolDiagnostics {
            stats,
            utilization_percent: 0.0,
            health: PoolHealth::Critical,
            recommendations: vec![
                "Connection pool has no capacity; verify the database is reachable and maxPoolSize is set".to_string(),
            ],
        };
    }

    let utilization = f64::from(stats.active_connections) / f64::from(stats.total_connections) * 100.0;
    let waiting = stats.waiting_requests;

    let health = if utilization > CRITICAL_UTILIZATION || waiting > CRITICAL_WAITERS {
        PoolHealth::Critical
    } else if utilization >= DEGRADED_UTILIZATION || waiting > DEGRADED_WAITERS {
        PoolHealth::Degraded
    } else {
        PoolHealth::Healthy
    };

    let mut recommendations = Vec::new();
    if utilization > CRITICAL_UTILIZATION {
        recommendations.push(format!(
            "Pool is nearly exhausted ({utilization:.0}% in use); increase maxPoolSize or reduce concurrent load"
        ));
    } else if utilization >= DEGRADED_UTILIZATION {
        recommendations.push(format!(
            "Pool utilization is elevated ({utilization:.0}%); consider increasing maxPoolSize before peak traffic"
        ));
    }
    if waiting > CRITICAL_WAITERS {
        recommendations.push(format!(
            "{waiting} requests are waiting for a connection; increase maxPoolSize and look for long-running queries holding connections"
        ));
    } else if waiting > DEGRADED_WAITERS {
        recommendations.push(format!(
            "Requests are queueing for connections ({waiting} waiting); review slow queries"
        ));
    }
    if health == PoolHealth::Healthy && utilization < IDLE_UTILIZATION && stats.total_connections > 10 {
        recommendations.push(
            "Pool is mostly idle; consider lowering maxPoolSize to free database server resources".to_string(),
        );
    }

    PoolDiagnostics {
        stats,
        utilization_percent: utilization,
        health,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: u32, active: u32, waiting: u32) -> PoolStats {
        PoolStats {
            total_connections: total,
            active_connections: active,
            idle_connections: total - active,
            waiting_requests: waiting,
        }
    }

    #[test]
    fn utilization_thresholds() {
        assert_eq!(diagnose_pool(stats(100, 74, 0)).health, PoolHealth::Healthy);
        assert_eq!(diagnose_pool(stats(100, 75, 0)).health, PoolHealth::Degraded);
        assert_eq!(diagnose_pool(stats(100, 90, 0)).health, PoolHealth::Degraded);
        assert_eq!(diagnose_pool(stats(100, 91, 0)).health, PoolHealth::Critical);
    }

    #[test]
    fn waiter_thresholds() {
        assert_eq!(diagnose_pool(stats(10, 1, 5)).health, PoolHealth::Healthy);
        assert_eq!(diagnose_pool(stats(10, 1, 6)).health, PoolHealth::Degraded);
        assert_eq!(diagnose_pool(stats(10, 1, 10)).health, PoolHealth::Degraded);
        assert_eq!(diagnose_pool(stats(10, 1, 11)).health, PoolHealth::Critical);
    }

    #[test]
    fn recommendations_are_actionable() {
        let diagnostics = diagnose_pool(stats(10, 10, 12));
        assert_eq!(diagnostics.health, PoolHealth::Critical);
        assert_eq!(diagnostics.utilization_percent, 100.0);
        assert_eq!(diagnostics.recommendations.len(), 2);
        assert!(diagnostics.recommendations.iter().all(|r| r.contains("increase maxPoolSize")));

        let idle = diagnose_pool(stats(50, 1, 0));
        assert_eq!(idle.health, PoolHealth::Healthy);
        assert!(idle.recommendations[0].contains("lowering maxPoolSize"));

        assert!(diagnose_pool(stats(10, 3, 0)).recommendations.is_empty());
    }

    #[test]
    fn empty_pool_is_critical() {
        let diagnostics = diagnose_pool(PoolStats::default());
        assert_eq!(diagnostics.health, PoolHealth::Critical);
        assert_eq!(diagnostics.recommendations.len(), 1);
    }
}
