//! The relational adapter shared by Postgres and SQLite.
//!
//! [`SqlAdapter`] owns everything dialect-independent: schema registration,
//! additive migrations, batching and upsert strategy. The per-driver
//! [`SqlExecutor`] only runs compiled [`Statement`]s and decodes rows.

pub mod compile;
pub mod dialect;

use super::stored_shape;
use crate::adapter::{BatchInsertFailure, BatchInsertOutcome, ConnectionSettings, DatabaseAdapter, TransactionScope, UpsertOutcome};
use crate::error::DbError;
use crate::filter::Filter;
use crate::pipeline::{Stage, run_in_memory, split_pushdown};
use crate::query::{FindOptions, project};
use crate::schema::{ResolvedSchema, table_name};
use async_trait::async_trait;
use compile::Statement;
use core_types::{Backend, DATA_FIELD, Document, ID_FIELD};
use dialect::Dialect;
use parking_lot::RwLock;
use resilience::PoolStats;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A pooled SQL driver, or one transaction on it.
#[async_trait]
pub trait SqlExecutor: Clone + Send + Sync + 'static {
    const DIALECT: Dialect;
    const BACKEND: Backend;

    async fn open(settings: &ConnectionSettings) -> Result<Self, DbError>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
    fn pool_stats(&self) -> PoolStats;

    /// Returns the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64, DbError>;
    /// Runs a statement that returns the columns of [`compile::columns`].
    async fn fetch_documents(&self, statement: &Statement, schema: &ResolvedSchema) -> Result<Vec<Document>, DbError>;
    /// First column of every row, as text.
    async fn fetch_strings(&self, statement: &Statement) -> Result<Vec<String>, DbError>;
    async fn fetch_count(&self, statement: &Statement) -> Result<u64, DbError>;

    /// Opens a transaction. Returns `None` when `self` is already one.
    async fn begin(&self) -> Result<Option<Self>, DbError>;
    async fn commit(&self) -> Result<(), DbError>;
    async fn rollback(&self) -> Result<(), DbError>;
}

/// Builds the public document for a decoded row: the blob first, then the
/// non-null columns on top.
pub(crate) fn assemble_document(data: Option<Value>, columns: Vec<(String, Value)>) -> Document {
    let mut doc = match data {
        Some(Value::Object(map)) => map,
        _ => Document::new(),
    };
    for (name, value) in columns {
        if name != DATA_FIELD {
            doc.insert(name, value);
        }
    }
    doc
}

type SchemaRegistry = Arc<RwLock<HashMap<String, Arc<ResolvedSchema>>>>;

pub struct SqlAdapter<E: SqlExecutor> {
    settings: ConnectionSettings,
    executor: RwLock<Option<E>>,
    schemas: SchemaRegistry,
    /// Bound to one transaction; connect and disconnect are no-ops.
    scoped: bool,
}

impl<E: SqlExecutor> SqlAdapter<E> {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            executor: RwLock::new(None),
            schemas: Arc::new(RwLock::new(HashMap::new())),
            scoped: false,
        }
    }

    fn scoped_to(&self, executor: E) -> Self {
        Self {
            settings: self.settings.clone(),
            executor: RwLock::new(Some(executor)),
            schemas: Arc::clone(&self.schemas),
            scoped: true,
        }
    }

    fn executor(&self) -> Result<E, DbError> {
        self.executor.read().clone().ok_or(DbError::NotConnected)
    }

    fn schema(&self, collection: &str) -> Result<Arc<ResolvedSchema>, DbError> {
        self.schemas
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| DbError::UnknownCollection(collection.to_string()))
    }

    async fn upsert_once(
        &self,
        executor: &E,
        schema: &ResolvedSchema,
        filter: &Filter,
        changes: &Document,
        insert: &Document,
    ) -> Result<UpsertOutcome, DbError> {
        let (scope, owned) = match executor.begin().await? {
            Some(tx) => (tx, true),
            None => (executor.clone(), false),
        };
        let result = read_modify_write(&scope, schema, filter, changes, insert).await;
        if owned {
            match &result {
                Ok(_) => scope.commit().await?,
                Err(_) => {
                    if let Err(e) = scope.rollback().await {
                        warn!(error = %e, "Failed to roll back upsert");
                    }
                }
            }
        }
        result
    }
}

/// Updates the first match or inserts `insert`, inside the caller's
/// transaction. Postgres takes an advisory lock on the key first; SQLite
/// transactions already hold the write lock from `BEGIN IMMEDIATE`.
async fn read_modify_write<E: SqlExecutor>(
    executor: &E,
    schema: &ResolvedSchema,
    filter: &Filter,
    changes: &Document,
    insert: &Document,
) -> Result<UpsertOutcome, DbError> {
    if E::DIALECT == Dialect::Postgres {
        executor.execute(&compile::upsert_lock(&schema.table, filter)).await?;
    }
    let statement = compile::update_one(E::DIALECT, schema, filter, changes)?;
    if let Some(document) = executor.fetch_documents(&statement, schema).await?.into_iter().next() {
        return Ok(UpsertOutcome { document, inserted: false });
    }
    let statement = compile::insert(E::DIALECT, schema, std::slice::from_ref(insert), false)?;
    executor.execute(&statement).await?;
    Ok(UpsertOutcome {
        document: stored_shape(insert),
        inserted: true,
    })
}

#[async_trait]
impl<E: SqlExecutor> DatabaseAdapter for SqlAdapter<E> {
    fn backend(&self) -> Backend {
        E::BACKEND
    }

    async fn connect(&self) -> Result<(), DbError> {
        if self.scoped || self.is_connected() {
            return Ok(());
        }
        let executor = E::open(&self.settings).await?;
        if let Some(previous) = self.executor.write().replace(executor) {
            // A pool that went bad is replaced; close it in the background.
            tokio::spawn(async move { previous.close().await });
        }
        info!(backend = %E::BACKEND, "SQL connection pool established");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DbError> {
        if self.scoped {
            return Ok(());
        }
        let executor = self.executor.write().take();
        if let Some(executor) = executor {
            executor.close().await;
            info!(backend = %E::BACKEND, "SQL connection pool closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.executor.read().as_ref().is_some_and(|e| !e.is_closed())
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.executor()?.execute(&Statement::raw("SELECT 1")).await.map(|_| ())
    }

    fn pool_stats(&self) -> PoolStats {
        self.executor.read().as_ref().map(E::pool_stats).unwrap_or_default()
    }

    async fn ensure_collection(&self, schema: &ResolvedSchema) -> Result<(), DbError> {
        let executor = self.executor()?;
        let migrate = |e: DbError| DbError::schema(&schema.collection, e);

        executor
            .execute(&compile::create_table(E::DIALECT, schema))
            .await
            .map_err(migrate)?;
        let existing: HashSet<String> = executor
            .fetch_strings(&compile::table_columns(E::DIALECT, &schema.table))
            .await
            .map_err(migrate)?
            .into_iter()
            .collect();
        for (name, column_type) in schema.known_columns() {
            if !existing.contains(name) {
                info!(collection = %schema.collection, column = name, "Adding column");
                executor
                    .execute(&compile::add_column(E::DIALECT, schema, name, column_type))
                    .await
                    .map_err(migrate)?;
            }
        }
        for field in schema.unique_fields() {
            executor
                .execute(&compile::unique_index(E::DIALECT, schema, &field.definition.name))
                .await
                .map_err(migrate)?;
        }

        self.schemas
            .write()
            .insert(schema.collection.clone(), Arc::new(schema.clone()));
        debug!(collection = %schema.collection, table = %schema.table, "Collection ready");
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), DbError> {
        let executor = self.executor()?;
        let table = match self.schemas.read().get(collection) {
            Some(schema) => schema.table.clone(),
            None => table_name(collection)?,
        };
        executor.execute(&compile::drop_table(&table)).await?;
        self.schemas.write().remove(collection);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        self.executor()?
            .fetch_strings(&Statement::raw(E::DIALECT.list_tables()))
            .await
    }

    async fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, DbError> {
        let schema = self.schema(collection)?;
        filter.validate()?;
        options.validate()?;
        let statement = compile::select(E::DIALECT, &schema, filter, options)?;
        let docs = self.executor()?.fetch_documents(&statement, &schema).await?;
        Ok(match &options.projection {
            Some(fields) => docs.into_iter().map(|d| project(d, fields)).collect(),
            None => docs,
        })
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        let schema = self.schema(collection)?;
        filter.validate()?;
        let statement = compile::count(E::DIALECT, &schema, filter)?;
        self.executor()?.fetch_count(&statement).await
    }

    async fn exists(&self, collection: &str, filter: &Filter) -> Result<bool, DbError> {
        let schema = self.schema(collection)?;
        filter.validate()?;
        let statement = compile::exists(E::DIALECT, &schema, filter)?;
        Ok(!self.executor()?.fetch_strings(&statement).await?.is_empty())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<Document, DbError> {
        let schema = self.schema(collection)?;
        let statement = compile::insert(E::DIALECT, &schema, std::slice::from_ref(&document), false)?;
        self.executor()?.execute(&statement).await?;
        Ok(stored_shape(&document))
    }

    /// Rows go out in chunks that fit the bind limit. Conflicting rows are
    /// skipped by the server and reported per index; a chunk that fails
    /// outright aborts the call, leaving earlier chunks written.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<BatchInsertOutcome, DbError> {
        let schema = self.schema(collection)?;
        let executor = self.executor()?;
        let per_chunk = (compile::MAX_BINDS / compile::row_width(&schema)).max(1);
        let mut outcome = BatchInsertOutcome::default();

        for (chunk_index, chunk) in documents.chunks(per_chunk).enumerate() {
            let statement = compile::insert(E::DIALECT, &schema, chunk, true)?;
            let mut written: HashSet<String> = executor.fetch_strings(&statement).await?.into_iter().collect();
            for (i, doc) in chunk.iter().enumerate() {
                let id = doc.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default();
                if written.remove(id) {
                    outcome.inserted.push(stored_shape(doc));
                } else {
                    outcome.failures.push(BatchInsertFailure {
                        index: chunk_index * per_chunk + i,
                        error: DbError::DuplicateKey(format!("document '{id}' conflicts with an existing key")),
                    });
                }
            }
        }
        Ok(outcome)
    }

    async fn update_one(&self, collection: &str, filter: &Filter, changes: &Document) -> Result<Option<Document>, DbError> {
        let schema = self.schema(collection)?;
        filter.validate()?;
        let statement = compile::update_one(E::DIALECT, &schema, filter, changes)?;
        Ok(self
            .executor()?
            .fetch_documents(&statement, &schema)
            .await?
            .into_iter()
            .next())
    }

    async fn update_many(&self, collection: &str, filter: &Filter, changes: &Document) -> Result<u64, DbError> {
        let schema = self.schema(collection)?;
        filter.validate()?;
        let statement = compile::update_many(E::DIALECT, &schema, filter, changes)?;
        self.executor()?.execute(&statement).await
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        changes: &Document,
        insert: &Document,
    ) -> Result<UpsertOutcome, DbError> {
        let schema = self.schema(collection)?;
        filter.validate()?;
        let executor = self.executor()?;
        match self.upsert_once(&executor, &schema, filter, changes, insert).await {
            // A concurrent writer inserted the same key first; it now matches.
            Err(e) if e.is_duplicate_key() => {
                debug!(collection, "Upsert lost an insert race, retrying as update");
                match self.update_one(collection, filter, changes).await? {
                    Some(document) => Ok(UpsertOutcome { document, inserted: false }),
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        let schema = self.schema(collection)?;
        filter.validate()?;
        let statement = compile::delete_one(E::DIALECT, &schema, filter)?;
        self.executor()?.execute(&statement).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        let schema = self.schema(collection)?;
        filter.validate()?;
        let statement = compile::delete_many(E::DIALECT, &schema, filter)?;
        self.executor()?.execute(&statement).await
    }

    /// The leading match/sort/skip/limit stages run in SQL; the rest run in
    /// memory over the result.
    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Document>, DbError> {
        if let Some(Stage::Raw(raw)) = pipeline.iter().find(|s| matches!(s, Stage::Raw(_))) {
            return Err(DbError::NotImplemented(format!("aggregation stage {raw}")));
        }
        let (filter, options, rest) = split_pushdown(pipeline);
        let docs = self.find(collection, &filter, &options).await?;
        run_in_memory(docs, rest)
    }

    async fn begin_native(&self) -> Result<Option<Box<dyn TransactionScope>>, DbError> {
        let Some(executor) = self.executor()?.begin().await? else {
            return Ok(None);
        };
        let adapter = Arc::new(self.scoped_to(executor.clone()));
        Ok(Some(Box::new(SqlTransaction { executor, adapter })))
    }
}

/// A native SQL transaction.
pub struct SqlTransaction<E: SqlExecutor> {
    executor: E,
    adapter: Arc<SqlAdapter<E>>,
}

#[async_trait]
impl<E: SqlExecutor> TransactionScope for SqlTransaction<E> {
    fn adapter(&self) -> Arc<dyn DatabaseAdapter> {
        self.adapter.clone()
    }

    fn is_native(&self) -> bool {
        true
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.executor.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.executor.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn columns_override_blob_values() {
        let doc = assemble_document(
            Some(json!({"title": "stale", "tags": ["a"]})),
            vec![
                ("_id".into(), json!("p1")),
                ("title".into(), json!("fresh")),
            ],
        );
        assert_eq!(doc["title"], "fresh");
        assert_eq!(doc["tags"], json!(["a"]));
        assert_eq!(doc["_id"], "p1");
    }
}
