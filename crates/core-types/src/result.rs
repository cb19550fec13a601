use crate::error::{DatabaseError, ErrorCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result type every public database operation returns.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Advisory metadata attached to a successful envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMeta {
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

/// The serialized shape of a `DatabaseResult<T>`:
/// `{"success":true,"data":...,"meta":...}` or `{"success":false,"error":...}`.
///
/// Only the constructors below can build one, so exactly one branch is ever
/// populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<ResultMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<DatabaseError>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), meta: None, error: None }
    }

    pub fn failure(error: DatabaseError) -> Self {
        Self { success: false, data: None, meta: None, error: Some(error) }
    }

    /// Attaches metadata; ignored on failures.
    pub fn with_meta(mut self, meta: ResultMeta) -> Self {
        if self.success {
            self.meta = Some(meta);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn meta(&self) -> Option<&ResultMeta> {
        self.meta.as_ref()
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Converts back into a `DatabaseResult`, rejecting malformed envelopes
    /// received from the wire. A success whose `data` is null or absent is
    /// accepted when `T` itself can be null, e.g. `Option<_>` or `()`.
    pub fn into_result(self) -> DatabaseResult<T> {
        match (self.success, self.data, self.error) {
            (true, Some(data), None) => Ok(data),
            (true, None, None) => T::deserialize(Value::Null).map_err(|_| malformed()),
            (false, None, Some(error)) => Err(error),
            _ => Err(malformed()),
        }
    }
}

fn malformed() -> DatabaseError {
    DatabaseError::new(
        ErrorCode::SERIALIZATION_ERROR,
        "Malformed result envelope: exactly one of data or error must be present",
    )
}

impl<T> From<DatabaseResult<T>> for Envelope<T> {
    fn from(result: DatabaseResult<T>) -> Self {
        match result {
            Ok(data) => Envelope::success(data),
            Err(error) => Envelope::failure(error),
        }
    }
}
