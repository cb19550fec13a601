use serde::{Deserialize, Serialize};
use std::fmt;

/// The storage engine behind a `DatabaseAdapter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    MongoDb,
    Postgres,
    Sqlite,
}

impl Backend {
    /// Whether the backend can run multiple statements in one native transaction.
    pub fn supports_native_transactions(&self) -> bool {
        !matches!(self, Backend::MongoDb)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::MongoDb => "mongodb",
            Backend::Postgres => "postgres",
            Backend::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

/// The logical type of a field in a collection schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[serde(alias = "text", alias = "email", alias = "slug")]
    String,
    #[serde(alias = "float", alias = "decimal")]
    Number,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "bool", alias = "checkbox")]
    Boolean,
    #[serde(alias = "datetime")]
    Date,
    #[serde(alias = "object", alias = "richtext")]
    Json,
    Array,
}

impl FieldType {
    /// Scalar types get a dedicated physical column on relational backends;
    /// structured types live in the dynamic blob.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Number | FieldType::Integer | FieldType::Boolean | FieldType::Date
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Mongo-style numeric direction: `1` ascending, `-1` descending.
    pub fn as_i32(&self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(SortDirection::Asc),
            -1 => Some(SortDirection::Desc),
            _ => None,
        }
    }

    pub fn reverse(&self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_aliases() {
        let ty: FieldType = serde_json::from_str("\"richtext\"").unwrap();
        assert_eq!(ty, FieldType::Json);
        let ty: FieldType = serde_json::from_str("\"email\"").unwrap();
        assert_eq!(ty, FieldType::String);
        assert!(ty.is_scalar());
        assert!(!FieldType::Array.is_scalar());
    }

    #[test]
    fn only_mongodb_lacks_native_transactions() {
        assert!(!Backend::MongoDb.supports_native_transactions());
        assert!(Backend::Postgres.supports_native_transactions());
        assert!(Backend::Sqlite.supports_native_transactions());
        assert_eq!(Backend::MongoDb.to_string(), "mongodb");
    }

    #[test]
    fn sort_direction_numeric_forms() {
        assert_eq!(SortDirection::from_i64(-1), Some(SortDirection::Desc));
        assert_eq!(SortDirection::from_i64(2), None);
        assert_eq!(SortDirection::Desc.reverse().as_i32(), 1);
    }
}
