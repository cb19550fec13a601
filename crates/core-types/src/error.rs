use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A stable, machine-readable error key (e.g. `INSERT_ERROR`).
///
/// The taxonomy is open: the associated constants cover every code this
/// workspace produces, and `ErrorCode::new` allows collaborators to extend it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(Cow<'static, str>);

macro_rules! error_codes {
    ($($name:ident),* $(,)?) => {
        impl ErrorCode {
            $(pub const $name: ErrorCode = ErrorCode(Cow::Borrowed(stringify!($name)));)*
        }
    };
}

error_codes!(
    // Connection class
    CONNECTION_FAILED,
    NOT_CONNECTED,
    RECONNECTION_FAILED,
    HEALTH_CHECK_FAILED,
    // CRUD class
    FIND_ONE_ERROR,
    FIND_MANY_ERROR,
    FIND_BY_ID_ERROR,
    INSERT_ERROR,
    INSERT_MANY_ERROR,
    DUPLICATE_KEY_ERROR,
    UPDATE_ERROR,
    UPDATE_MANY_ERROR,
    UPSERT_ERROR,
    UPSERT_MANY_ERROR,
    DELETE_ERROR,
    DELETE_MANY_ERROR,
    COUNT_ERROR,
    EXISTS_ERROR,
    AGGREGATION_ERROR,
    QUERY_ERROR,
    STREAM_ERROR,
    BATCH_ERROR,
    TRANSACTION_ERROR,
    VALIDATION_ERROR,
    INVALID_ID,
    NOT_FOUND,
    SERIALIZATION_ERROR,
    // Schema class
    COLLECTION_NOT_FOUND,
    SCHEMA_MIGRATION_ERROR,
    AUTH_MODEL_SETUP_FAILED,
    NO_COLLECTIONS,
    // Resilience class
    NOT_IMPLEMENTED,
);

impl ErrorCode {
    /// Creates a code outside the built-in taxonomy.
    pub fn new(code: impl Into<String>) -> Self {
        Self(Cow::Owned(code.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The HTTP-style status associated with this code.
    pub fn status_code(&self) -> u16 {
        match self.as_str() {
            "NOT_FOUND" | "COLLECTION_NOT_FOUND" => 404,
            "DUPLICATE_KEY_ERROR" => 409,
            "VALIDATION_ERROR" | "INVALID_ID" | "QUERY_ERROR" => 400,
            "NOT_IMPLEMENTED" => 501,
            "CONNECTION_FAILED" | "NOT_CONNECTED" | "RECONNECTION_FAILED"
            | "HEALTH_CHECK_FAILED" => 503,
            _ => 500,
        }
    }

    /// True for the connection-class codes the resilience layer retries.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self.as_str(),
            "CONNECTION_FAILED" | "NOT_CONNECTED" | "RECONNECTION_FAILED" | "HEALTH_CHECK_FAILED"
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The public error half of the `DatabaseResult<T>` envelope.
///
/// Native driver errors never cross the facade boundary; they are converted
/// into this type with [`DatabaseError::from_source`], which keeps the
/// original message and stores the source chain and backtrace in a
/// diagnostics field that is never serialized.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("[{code}] {message}")]
#[serde(rename_all = "camelCase")]
pub struct DatabaseError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip)]
    diagnostics: Option<Arc<str>>,
}

impl DatabaseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let status_code = Some(code.status_code());
        Self {
            code,
            message: message.into(),
            status_code,
            details: None,
            diagnostics: None,
        }
    }

    /// Builds an envelope error from a raw error, a taxonomy code and a
    /// context message.
    pub fn from_source<E>(err: &E, code: ErrorCode, context: impl fmt::Display) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let mut diagnostics = String::new();
        if !chain.is_empty() {
            diagnostics.push_str("caused by: ");
            diagnostics.push_str(&chain.join(" <- "));
        }
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            if !diagnostics.is_empty() {
                diagnostics.push('\n');
            }
            diagnostics.push_str(&backtrace.to_string());
        }

        let mut error = Self::new(code, format!("{context}: {err}"));
        if !diagnostics.is_empty() {
            error.diagnostics = Some(diagnostics.into());
        }
        error
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Source chain and backtrace captured at construction, for logs only.
    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code == ErrorCode::DUPLICATE_KEY_ERROR
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NOT_CONNECTED, "Database adapter is not connected")
    }

    pub fn not_implemented(what: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::NOT_IMPLEMENTED,
            format!("{what} is not implemented for this backend"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn from_source_keeps_message_and_context() {
        let raw = io::Error::new(io::ErrorKind::ConnectionRefused, "refused by peer");
        let err = DatabaseError::from_source(&raw, ErrorCode::CONNECTION_FAILED, "Connecting to primary");

        assert_eq!(err.code, ErrorCode::CONNECTION_FAILED);
        assert_eq!(err.message, "Connecting to primary: refused by peer");
        assert_eq!(err.status_code, Some(503));
    }

    #[test]
    fn diagnostics_are_not_serialized() {
        #[derive(Debug, Error)]
        #[error("outer")]
        struct Outer(#[source] io::Error);

        let raw = Outer(io::Error::other("inner cause"));
        let err = DatabaseError::from_source(&raw, ErrorCode::INSERT_ERROR, "insert");
        assert!(err.diagnostics().unwrap().contains("inner cause"));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "INSERT_ERROR");
        assert_eq!(json["statusCode"], 500);
        assert!(json.get("diagnostics").is_none());
    }

    #[test]
    fn custom_codes_round_trip() {
        let err = DatabaseError::new(ErrorCode::new("WEBHOOK_DISABLED"), "off");
        let json = serde_json::to_string(&err).unwrap();
        let back: DatabaseError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code.as_str(), "WEBHOOK_DISABLED");
        assert_eq!(back.to_string(), "[WEBHOOK_DISABLED] off");
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(ErrorCode::DUPLICATE_KEY_ERROR.status_code(), 409);
        assert_eq!(ErrorCode::NOT_FOUND.status_code(), 404);
        assert_eq!(ErrorCode::INVALID_ID.status_code(), 400);
        assert!(ErrorCode::NOT_CONNECTED.is_connection_class());
        assert!(!ErrorCode::INSERT_ERROR.is_connection_class());
    }
}
