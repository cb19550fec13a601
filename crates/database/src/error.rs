use core_types::{DatabaseError, ErrorCode};
use std::fmt;
use thiserror::Error;

/// Server error code for a unique-index violation in MongoDB.
pub(crate) const MONGO_DUPLICATE_KEY: i32 = 11000;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQL driver error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("MongoDB driver error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Failed to encode document as BSON: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[error("An error occurred during JSON serialization/deserialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("The database adapter is not connected.")]
    NotConnected,

    #[error("Invalid connection settings: {0}")]
    ConnectionConfig(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Collection '{0}' is not registered")]
    UnknownCollection(String),

    #[error("{0} is not implemented for this backend")]
    NotImplemented(String),

    #[error("Schema migration failed for '{collection}': {reason}")]
    Schema { collection: String, reason: String },

    #[error("The transaction has already been committed or rolled back.")]
    TransactionClosed,
}

impl DbError {
    /// Whether the error is a uniqueness-constraint violation, whichever
    /// driver raised it.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            DbError::DuplicateKey(_) => true,
            DbError::Sql(sqlx::Error::Database(e)) => e.is_unique_violation(),
            DbError::Mongo(e) => is_mongo_duplicate(e),
            _ => false,
        }
    }

    pub fn schema(collection: impl Into<String>, reason: impl fmt::Display) -> Self {
        DbError::Schema {
            collection: collection.into(),
            reason: reason.to_string(),
        }
    }

    /// Converts into the public envelope error. Classified failures keep
    /// their own code; everything else takes the operation's `code`.
    pub fn into_database_error(self, code: ErrorCode, context: impl fmt::Display) -> DatabaseError {
        let code = if self.is_duplicate_key() {
            ErrorCode::DUPLICATE_KEY_ERROR
        } else {
            match &self {
                DbError::NotConnected => ErrorCode::NOT_CONNECTED,
                DbError::ConnectionConfig(_) => ErrorCode::CONNECTION_FAILED,
                DbError::Validation(_) => ErrorCode::VALIDATION_ERROR,
                DbError::UnknownCollection(_) => ErrorCode::COLLECTION_NOT_FOUND,
                DbError::NotImplemented(_) => ErrorCode::NOT_IMPLEMENTED,
                DbError::Schema { .. } => ErrorCode::SCHEMA_MIGRATION_ERROR,
                DbError::InvalidQuery(_) => ErrorCode::QUERY_ERROR,
                _ => code,
            }
        };
        DatabaseError::from_source(&self, code, context)
    }
}

fn is_mongo_duplicate(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == MONGO_DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == MONGO_DUPLICATE_KEY,
        ErrorKind::InsertMany(e) => e
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|w| w.code == MONGO_DUPLICATE_KEY)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_errors_keep_their_code() {
        let err = DbError::DuplicateKey("_id".into()).into_database_error(ErrorCode::INSERT_ERROR, "insert");
        assert_eq!(err.code, ErrorCode::DUPLICATE_KEY_ERROR);
        assert_eq!(err.status_code, Some(409));

        let err = DbError::NotConnected.into_database_error(ErrorCode::FIND_ONE_ERROR, "find");
        assert_eq!(err.code, ErrorCode::NOT_CONNECTED);

        let err = DbError::UnknownCollection("posts".into()).into_database_error(ErrorCode::COUNT_ERROR, "count");
        assert_eq!(err.code, ErrorCode::COLLECTION_NOT_FOUND);
    }

    #[test]
    fn driver_errors_take_the_operation_code() {
        let err = DbError::Sql(sqlx::Error::RowNotFound).into_database_error(ErrorCode::UPDATE_ERROR, "update 'posts'");
        assert_eq!(err.code, ErrorCode::UPDATE_ERROR);
        assert!(err.message.starts_with("update 'posts': SQL driver error"));
    }
}
