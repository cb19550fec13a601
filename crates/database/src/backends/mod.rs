//! Storage engines behind [`DatabaseAdapter`](crate::adapter::DatabaseAdapter).

pub mod mongo;
pub mod postgres;
pub mod sql;
pub mod sqlite;

pub use mongo::MongoAdapter;
pub use postgres::{PgExecutor, PostgresAdapter};
pub use sql::{SqlAdapter, SqlExecutor, SqlTransaction};
pub use sqlite::{SqliteAdapter, SqliteExecutor};

use core_types::Document;

/// The document as it reads back once stored: `null` fields are not kept.
pub(crate) fn stored_shape(doc: &Document) -> Document {
    doc.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stored_shape_drops_nulls() {
        let doc = json!({"_id": "a", "gone": null, "kept": 1});
        let shaped = stored_shape(doc.as_object().unwrap());
        assert!(!shaped.contains_key("gone"));
        assert_eq!(shaped.len(), 2);
    }
}
