use async_trait::async_trait;
use core_types::DatabaseError;

pub type NotifyError = Box<dyn std::error::Error + Send + Sync>;

/// Delivers operational alerts to administrators.
///
/// Implemented by the alerting layer. Delivery is best-effort: the resilience
/// manager logs a failed notification and carries on.
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify_admins(&self, error: &DatabaseError) -> Result<(), NotifyError>;
}
