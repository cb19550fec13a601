use crate::error::DbError;
use crate::filter::Filter;
use crate::pipeline::Stage;
use crate::query::FindOptions;
use crate::schema::ResolvedSchema;
use async_trait::async_trait;
use configuration::DatabaseSettings;
use core_types::{Backend, Document};
use resilience::PoolStats;
use std::sync::Arc;
use std::time::Duration;

/// Connection-string and pool options handed to a backend at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub url: String,
    /// Database name for backends that address one inside a server (MongoDB).
    pub database_name: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub acquire_timeout: Duration,
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database_name: "strata".to_string(),
            max_pool_size: 10,
            min_pool_size: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&DatabaseSettings> for ConnectionSettings {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            url: settings.url.clone(),
            database_name: settings.name.clone(),
            max_pool_size: settings.max_pool_size,
            min_pool_size: settings.min_pool_size,
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
        }
    }
}

/// Result of an unordered bulk insert: which documents made it and which
/// did not.
#[derive(Debug, Default)]
pub struct BatchInsertOutcome {
    pub inserted: Vec<Document>,
    pub failures: Vec<BatchInsertFailure>,
}

#[derive(Debug)]
pub struct BatchInsertFailure {
    /// Position of the document in the submitted batch.
    pub index: usize,
    pub error: DbError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub document: Document,
    /// `true` when no document matched and one was created.
    pub inserted: bool,
}

/// One storage engine behind the uniform data contract.
///
/// Implementations translate filters, sorts and pipelines into native
/// queries and report failures as [`DbError`]; conversion into the public
/// envelope happens in the repository layer. Data operations address
/// collections by identifier; relational backends require the collection to
/// have been registered with [`ensure_collection`](Self::ensure_collection).
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn backend(&self) -> Backend;

    async fn connect(&self) -> Result<(), DbError>;
    async fn disconnect(&self) -> Result<(), DbError>;
    fn is_connected(&self) -> bool;
    async fn ping(&self) -> Result<(), DbError>;
    fn pool_stats(&self) -> PoolStats;

    /// Creates the physical collection, or migrates it additively.
    async fn ensure_collection(&self, schema: &ResolvedSchema) -> Result<(), DbError>;
    async fn drop_collection(&self, collection: &str) -> Result<(), DbError>;
    async fn list_collections(&self) -> Result<Vec<String>, DbError>;

    async fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, DbError>;
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DbError>;
    /// Whether any document matches, fetching at most one identifier.
    async fn exists(&self, collection: &str, filter: &Filter) -> Result<bool, DbError>;

    async fn insert_one(&self, collection: &str, document: Document) -> Result<Document, DbError>;
    /// Unordered insert: a failing document does not stop the others.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<BatchInsertOutcome, DbError>;

    /// Applies `changes` to the first match and returns it as stored afterwards.
    async fn update_one(&self, collection: &str, filter: &Filter, changes: &Document) -> Result<Option<Document>, DbError>;
    /// Returns the number of matched documents.
    async fn update_many(&self, collection: &str, filter: &Filter, changes: &Document) -> Result<u64, DbError>;

    /// Updates the first match with `changes`, or inserts `insert` when
    /// nothing matches.
    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        changes: &Document,
        insert: &Document,
    ) -> Result<UpsertOutcome, DbError>;

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, DbError>;
    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DbError>;

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Document>, DbError>;

    /// Starts a native multi-statement transaction, if the backend has them.
    async fn begin_native(&self) -> Result<Option<Box<dyn TransactionScope>>, DbError> {
        Ok(None)
    }
}

/// An open transaction. Work runs through [`adapter`](Self::adapter) and
/// becomes durable only on [`commit`](Self::commit).
#[async_trait]
pub trait TransactionScope: Send + Sync {
    fn adapter(&self) -> Arc<dyn DatabaseAdapter>;
    /// Whether rollback is native or a best-effort compensation.
    fn is_native(&self) -> bool;
    async fn commit(self: Box<Self>) -> Result<(), DbError>;
    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}
