use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A backend-neutral record: field name to JSON value.
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
/// Physical column holding fields that have no dedicated column.
pub const DATA_FIELD: &str = "_data";

/// The system fields every persisted record carries.
///
/// Domain types embed it with `#[serde(flatten)]`. `_id` is generated by the
/// adapter and never changes; `updatedAt` is rewritten on every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseEntity {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

/// The current instant as an ISO-8601 UTC string with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serializes a value that must be a JSON object into a `Document`.
pub fn to_document<T: Serialize + ?Sized>(value: &T) -> Result<Document, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(document))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Page {
        #[serde(flatten)]
        base: BaseEntity,
        title: String,
    }

    #[test]
    fn base_entity_flattens_with_wire_names() {
        let page = Page {
            base: BaseEntity {
                id: "a".repeat(32),
                created_at: "2024-01-01T00:00:00.000Z".into(),
                updated_at: "2024-01-01T00:00:00.000Z".into(),
            },
            title: "Home".into(),
        };
        let doc = to_document(&page).unwrap();
        assert_eq!(doc["_id"], json!("a".repeat(32)));
        assert_eq!(doc["createdAt"], json!("2024-01-01T00:00:00.000Z"));
        assert_eq!(from_document::<Page>(doc).unwrap(), page);
    }

    #[test]
    fn to_document_rejects_non_objects() {
        let err = to_document(&vec![1, 2]).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn timestamps_are_iso_8601_utc() {
        let now = timestamp_now();
        assert!(now.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
