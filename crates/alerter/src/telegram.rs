use crate::error::AlerterError;
use async_trait::async_trait;
use configuration::TelegramConfig;
use core_types::DatabaseError;
use reqwest::Client;
use resilience::{AdminNotifier, NotifyError};
use serde::Serialize;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// The JSON payload for the Telegram `sendMessage` endpoint.
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

/// A client for sending messages to the Telegram Bot API.
pub struct TelegramAlerter {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramAlerter {
    /// Returns `None` if the token or chat_id is missing from the configuration,
    /// so alerting can be disabled without failing startup.
    pub fn new(config: &TelegramConfig) -> Option<Self> {
        if config.token.is_empty() || config.chat_id.is_empty() {
            tracing::warn!("Telegram alerter is not configured (missing token or chat_id).");
            return None;
        }
        Some(Self {
            client: Client::new(),
            api_base: TELEGRAM_API.to_string(),
            token: config.token.clone(),
            chat_id: config.chat_id.clone(),
        })
    }

    /// Points the client at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Sends a MarkdownV2 message to the configured chat.
    pub async fn send_message(&self, message: &str) -> Result<(), AlerterError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), self.token);

        let payload = SendMessagePayload {
            chat_id: &self.chat_id,
            text: message,
            parse_mode: "MarkdownV2",
        };

        let response = self.client.post(&url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to decode error response".to_string());
            return Err(AlerterError::ApiError { status: status.as_u16(), body });
        }

        Ok(())
    }
}

#[async_trait]
impl AdminNotifier for TelegramAlerter {
    async fn notify_admins(&self, error: &DatabaseError) -> Result<(), NotifyError> {
        self.send_message(&format_alert(error)).await?;
        tracing::debug!(code = %error.code, "Administrator alert delivered");
        Ok(())
    }
}

/// Renders a database error as a Telegram alert.
pub fn format_alert(error: &DatabaseError) -> String {
    let mut text = format!(
        "🚨 *Database alert*\n`{}`\n{}",
        escape_markdown(error.code.as_str()),
        escape_markdown(&error.message)
    );
    if let Some(details) = &error.details {
        text.push_str(&format!("\n```\n{}\n```", escape_code(&details.to_string())));
    }
    text
}

/// Escapes characters that have special meaning in Telegram's MarkdownV2.
pub fn escape_markdown(text: &str) -> String {
    const SPECIAL: &str = r"_*[]()~`>#+-=|{}.!\";
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// Inside pre blocks only the backtick and backslash need escaping.
fn escape_code(text: &str) -> String {
    text.replace('\\', "\\\\").replace('`', "\\`")
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ErrorCode;
    use serde_json::json;

    #[test]
    fn escapes_markdown_specials() {
        assert_eq!(escape_markdown("db_1 (primary)."), r"db\_1 \(primary\)\.");
        assert_eq!(escape_markdown(r"a\b"), r"a\\b");
        assert_eq!(escape_markdown("plain"), "plain");
    }

    #[test]
    fn alert_includes_code_message_and_details() {
        let error = DatabaseError::new(ErrorCode::RECONNECTION_FAILED, "Failed to reconnect after 5 attempts")
            .with_details(json!({ "cause": "CONNECTION_FAILED" }));
        let text = format_alert(&error);
        assert!(text.contains(r"RECONNECTION\_FAILED"));
        assert!(text.contains("Failed to reconnect after 5 attempts"));
        assert!(text.contains(r#"{"cause":"CONNECTION_FAILED"}"#));
    }

    #[test]
    fn requires_token_and_chat() {
        let config = TelegramConfig { token: "t".into(), chat_id: String::new() };
        assert!(TelegramAlerter::new(&config).is_none());
        let config = TelegramConfig { token: "t".into(), chat_id: "42".into() };
        assert!(TelegramAlerter::new(&config).is_some());
    }
}
