//! Administrator alerting for the data layer.
//!
//! Supplies the `notify_admins` callback the resilience manager invokes when
//! reconnection fails: [`TelegramAlerter`] when a bot is configured, otherwise
//! [`LogNotifier`].

use async_trait::async_trait;
use configuration::AlertingSettings;
use core_types::DatabaseError;
use resilience::{AdminNotifier, NotifyError};
use std::sync::Arc;

pub mod error;
pub mod telegram;

pub use error::AlerterError;
pub use telegram::{TelegramAlerter, escape_markdown, format_alert};

/// Writes alerts to the error log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify_admins(&self, error: &DatabaseError) -> Result<(), NotifyError> {
        tracing::error!(
            code = %error.code,
            details = ?error.details,
            "ADMIN ALERT: {}",
            error.message
        );
        Ok(())
    }
}

/// Picks the notifier for the configured alerting channel.
pub fn build_notifier(settings: &AlertingSettings) -> Arc<dyn AdminNotifier> {
    match TelegramAlerter::new(&settings.telegram) {
        Some(alerter) => {
            tracing::info!("Administrator alerts will be sent to Telegram");
            Arc::new(alerter)
        }
        None => Arc::new(LogNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ErrorCode;

    #[tokio::test]
    async fn log_notifier_never_fails() {
        let error = DatabaseError::new(ErrorCode::RECONNECTION_FAILED, "down");
        assert!(LogNotifier.notify_admins(&error).await.is_ok());
    }

    #[tokio::test]
    async fn unconfigured_telegram_falls_back_to_log() {
        let settings = AlertingSettings::default();
        assert!(TelegramAlerter::new(&settings.telegram).is_none());

        // A Telegram notifier would fail here without a valid bot.
        let notifier = build_notifier(&settings);
        let error = DatabaseError::new(ErrorCode::RECONNECTION_FAILED, "down");
        assert!(notifier.notify_admins(&error).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_telegram_reports_failure() {
        let config = configuration::TelegramConfig {
            token: "123:abc".into(),
            chat_id: "42".into(),
        };
        let alerter = TelegramAlerter::new(&config)
            .expect("configured")
            .with_api_base("http://127.0.0.1:1");
        let error = DatabaseError::new(ErrorCode::RECONNECTION_FAILED, "down");
        assert!(alerter.notify_admins(&error).await.is_err());
    }
}
