//! The generic per-collection CRUD repository.
//!
//! A [`Repository<T>`] binds one registered collection to the active adapter.
//! It assigns identifiers and timestamps, validates writes against the
//! collection schema, reads through the cache and turns every backend failure
//! into a [`DatabaseError`]. No method panics or lets a driver error escape.

use crate::adapter::DatabaseAdapter;
use crate::error::DbError;
use crate::filter::Filter;
use crate::performance::PerformanceMonitor;
use crate::pipeline::Stage;
use crate::query::FindOptions;
use crate::query_builder::QueryBuilder;
use crate::schema::{ResolvedSchema, WriteMode};
use cache::{CacheCategory, CacheStore};
use core_types::{
    CREATED_AT_FIELD, DatabaseError, DatabaseResult, Document, ErrorCode, ID_FIELD, UPDATED_AT_FIELD,
    from_document, generate_id, timestamp_now, to_document, validate_id,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// One failed document of an `insert_many`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Position in the submitted batch.
    pub index: usize,
    pub error: DatabaseError,
}

#[derive(Debug, Clone)]
pub struct BatchInsertResult<T> {
    pub inserted: Vec<T>,
    pub failures: Vec<BatchFailure>,
}

impl<T> BatchInsertResult<T> {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertResult<T> {
    pub document: T,
    pub inserted: bool,
}

/// SHA-256 of the value's canonical JSON, hex-encoded.
fn digest(value: &impl Serialize) -> Result<String, DbError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn serialization_error(err: &serde_json::Error, context: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::from_source(err, ErrorCode::SERIALIZATION_ERROR, context)
}

fn invalid_id(id: &str) -> DatabaseError {
    DatabaseError::new(ErrorCode::INVALID_ID, format!("'{id}' is not a valid identifier"))
}

pub struct Repository<T> {
    collection: String,
    adapter: Arc<dyn DatabaseAdapter>,
    schema: Arc<ResolvedSchema>,
    cache: Option<Arc<CacheStore>>,
    monitor: Arc<PerformanceMonitor>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            adapter: self.adapter.clone(),
            schema: self.schema.clone(),
            cache: self.cache.clone(),
            monitor: self.monitor.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> Repository<T>
where
    T: DeserializeOwned + Send + Sync,
{
    pub fn new(
        adapter: Arc<dyn DatabaseAdapter>,
        schema: Arc<ResolvedSchema>,
        cache: Option<Arc<CacheStore>>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            collection: schema.collection.clone(),
            adapter,
            schema,
            cache,
            monitor,
            _entity: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn schema(&self) -> &ResolvedSchema {
        &self.schema
    }

    /// A query builder over this collection.
    pub fn query(&self) -> QueryBuilder<T> {
        QueryBuilder::new(self.clone())
    }

    // ---- plumbing --------------------------------------------------------

    pub(crate) async fn observe<R, Fut>(&self, operation: &'static str, work: Fut) -> DatabaseResult<R>
    where
        Fut: Future<Output = DatabaseResult<R>>,
    {
        let started = Instant::now();
        let result = work.await;
        self.monitor
            .record(operation, &self.collection, started.elapsed(), result.is_ok());
        if let Err(e) = &result {
            debug!(collection = %self.collection, operation, error = %e, "Repository operation failed");
        }
        result
    }

    pub(crate) fn fail(&self, code: ErrorCode, operation: &str) -> impl FnOnce(DbError) -> DatabaseError {
        let context = format!("{operation} on '{}'", self.collection);
        move |e| e.into_database_error(code, context)
    }

    pub(crate) fn decode(&self, document: Document) -> DatabaseResult<T> {
        from_document(document).map_err(|e| serialization_error(&e, format!("decoding a '{}' record", self.collection)))
    }

    pub(crate) fn decode_all(&self, documents: Vec<Document>) -> DatabaseResult<Vec<T>> {
        documents.into_iter().map(|d| self.decode(d)).collect()
    }

    fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            let evicted = cache.invalidate_collection(&self.collection);
            if evicted > 0 {
                debug!(collection = %self.collection, evicted, "Invalidated cached queries");
            }
        }
    }

    /// Reads through the query cache under `query:<collection>:<op>:<hash>`.
    async fn cached<V, F, Fut>(&self, operation: &str, discriminator: &impl Serialize, fetch: F) -> Result<V, DbError>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, DbError>>,
    {
        let Some(cache) = self.cache.as_ref().filter(|c| c.is_enabled()) else {
            return fetch().await;
        };
        let hash = digest(discriminator)?;
        let key = CacheCategory::Query.key(&[self.collection.as_str(), operation, hash.as_str()]);
        let lookup = cache.get_or_compute(&key, CacheCategory::Query, fetch).await?;
        if lookup.cached {
            debug!(key, "Query served from cache");
        }
        Ok(lookup.value)
    }

    pub(crate) async fn find_documents(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, DbError> {
        self.cached("find", &(filter, options), || self.adapter.find(&self.collection, filter, options))
            .await
    }

    /// Bypasses the cache; used by streams, which page through live data.
    pub(crate) async fn find_fresh(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, DbError> {
        self.adapter.find(&self.collection, filter, options).await
    }

    pub(crate) async fn count_documents(&self, filter: &Filter) -> Result<u64, DbError> {
        self.cached("count", filter, || self.adapter.count(&self.collection, filter))
            .await
    }

    /// System fields set, caller `_id` honored when valid, schema checked.
    fn prepare_insert(&self, mut document: Document, now: &str) -> DatabaseResult<Document> {
        match document.get(ID_FIELD) {
            None | Some(Value::Null) => {
                document.insert(ID_FIELD.to_string(), Value::String(generate_id()));
            }
            Some(Value::String(id)) if validate_id(id) => {}
            Some(other) => return Err(invalid_id(&other.to_string())),
        }
        document.insert(CREATED_AT_FIELD.to_string(), Value::String(now.to_string()));
        document.insert(UPDATED_AT_FIELD.to_string(), Value::String(now.to_string()));
        self.schema
            .validate(&document, WriteMode::Insert)
            .map_err(self.fail(ErrorCode::VALIDATION_ERROR, "insert"))?;
        Ok(document)
    }

    /// Identity and creation time are immutable; `updatedAt` is rewritten.
    fn prepare_changes<D: Serialize + ?Sized>(&self, changes: &D, now: &str) -> DatabaseResult<Document> {
        let mut document =
            to_document(changes).map_err(|e| serialization_error(&e, format!("encoding changes for '{}'", self.collection)))?;
        document.remove(ID_FIELD);
        document.remove(CREATED_AT_FIELD);
        document.insert(UPDATED_AT_FIELD.to_string(), Value::String(now.to_string()));
        self.schema
            .validate(&document, WriteMode::Update)
            .map_err(self.fail(ErrorCode::VALIDATION_ERROR, "update"))?;
        Ok(document)
    }

    // ---- reads -----------------------------------------------------------

    pub async fn find_one(&self, filter: &Filter) -> DatabaseResult<Option<T>> {
        self.observe("find_one", async {
            let options = FindOptions::new().limit(1);
            let documents = self
                .find_documents(filter, &options)
                .await
                .map_err(self.fail(ErrorCode::FIND_ONE_ERROR, "find_one"))?;
            documents.into_iter().next().map(|d| self.decode(d)).transpose()
        })
        .await
    }

    pub async fn find_many(&self, filter: &Filter, options: &FindOptions) -> DatabaseResult<Vec<T>> {
        self.observe("find_many", async {
            let documents = self
                .find_documents(filter, options)
                .await
                .map_err(self.fail(ErrorCode::FIND_MANY_ERROR, "find_many"))?;
            self.decode_all(documents)
        })
        .await
    }

    pub async fn find_by_id(&self, id: &str) -> DatabaseResult<Option<T>> {
        self.observe("find_by_id", async {
            if !validate_id(id) {
                return Err(invalid_id(id));
            }
            let options = FindOptions::new().limit(1);
            let documents = self
                .find_documents(&Filter::id(id), &options)
                .await
                .map_err(self.fail(ErrorCode::FIND_BY_ID_ERROR, "find_by_id"))?;
            documents.into_iter().next().map(|d| self.decode(d)).transpose()
        })
        .await
    }

    pub async fn find_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> DatabaseResult<Vec<T>> {
        self.observe("find_by_ids", async {
            if let Some(bad) = ids.iter().map(AsRef::as_ref).find(|id| !validate_id(id)) {
                return Err(invalid_id(bad));
            }
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let filter = Filter::is_in(ID_FIELD, ids.iter().map(|id| id.as_ref().to_string()));
            let documents = self
                .find_documents(&filter, &FindOptions::new())
                .await
                .map_err(self.fail(ErrorCode::FIND_MANY_ERROR, "find_by_ids"))?;
            self.decode_all(documents)
        })
        .await
    }

    pub async fn count(&self, filter: &Filter) -> DatabaseResult<u64> {
        self.observe("count", async {
            self.count_documents(filter)
                .await
                .map_err(self.fail(ErrorCode::COUNT_ERROR, "count"))
        })
        .await
    }

    /// Fetches at most one identifier and never consults the cache.
    pub async fn exists(&self, filter: &Filter) -> DatabaseResult<bool> {
        self.observe("exists", async {
            self.adapter
                .exists(&self.collection, filter)
                .await
                .map_err(self.fail(ErrorCode::EXISTS_ERROR, "exists"))
        })
        .await
    }

    pub async fn aggregate(&self, pipeline: &[Stage]) -> DatabaseResult<Vec<Document>> {
        self.observe("aggregate", async {
            self.adapter
                .aggregate(&self.collection, pipeline)
                .await
                .map_err(self.fail(ErrorCode::AGGREGATION_ERROR, "aggregate"))
        })
        .await
    }

    // ---- writes ----------------------------------------------------------

    pub async fn insert<D: Serialize + ?Sized>(&self, data: &D) -> DatabaseResult<T> {
        self.observe("insert", async {
            let document =
                to_document(data).map_err(|e| serialization_error(&e, format!("encoding a '{}' record", self.collection)))?;
            let document = self.prepare_insert(document, &timestamp_now())?;
            let stored = self.adapter.insert_one(&self.collection, document).await;
            self.invalidate();
            let stored = stored.map_err(self.fail(ErrorCode::INSERT_ERROR, "insert"))?;
            self.decode(stored)
        })
        .await
    }

    /// Unordered: a failing document is reported by index and the rest are
    /// still written. Every document shares one timestamp.
    pub async fn insert_many<D: Serialize>(&self, items: &[D]) -> DatabaseResult<BatchInsertResult<T>> {
        self.observe("insert_many", async {
            let now = timestamp_now();
            let mut failures = Vec::new();
            let mut positions = Vec::with_capacity(items.len());
            let mut documents = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let prepared = to_document(item)
                    .map_err(|e| serialization_error(&e, format!("encoding item {index}")))
                    .and_then(|d| self.prepare_insert(d, &now));
                match prepared {
                    Ok(document) => {
                        positions.push(index);
                        documents.push(document);
                    }
                    Err(error) => failures.push(BatchFailure { index, error }),
                }
            }
            if documents.is_empty() {
                return Ok(BatchInsertResult {
                    inserted: Vec::new(),
                    failures,
                });
            }

            let outcome = self.adapter.insert_many(&self.collection, documents).await;
            self.invalidate();
            let outcome = outcome.map_err(self.fail(ErrorCode::INSERT_MANY_ERROR, "insert_many"))?;
            for failure in outcome.failures {
                let index = positions.get(failure.index).copied().unwrap_or(failure.index);
                let error = failure
                    .error
                    .into_database_error(ErrorCode::INSERT_MANY_ERROR, format!("insert_many item {index}"));
                failures.push(BatchFailure { index, error });
            }
            failures.sort_by_key(|f| f.index);
            Ok(BatchInsertResult {
                inserted: self.decode_all(outcome.inserted)?,
                failures,
            })
        })
        .await
    }

    /// Applies `changes` to the record with `id`. `NOT_FOUND` when it does not exist.
    pub async fn update<D: Serialize + ?Sized>(&self, id: &str, changes: &D) -> DatabaseResult<T> {
        self.observe("update", async {
            if !validate_id(id) {
                return Err(invalid_id(id));
            }
            let changes = self.prepare_changes(changes, &timestamp_now())?;
            let updated = self.adapter.update_one(&self.collection, &Filter::id(id), &changes).await;
            self.invalidate();
            match updated.map_err(self.fail(ErrorCode::UPDATE_ERROR, "update"))? {
                Some(document) => self.decode(document),
                None => Err(DatabaseError::new(
                    ErrorCode::NOT_FOUND,
                    format!("no '{}' record with id '{id}'", self.collection),
                )),
            }
        })
        .await
    }

    pub async fn update_many<D: Serialize + ?Sized>(&self, filter: &Filter, changes: &D) -> DatabaseResult<BulkWriteResult> {
        self.observe("update_many", async {
            let changes = self.prepare_changes(changes, &timestamp_now())?;
            let matched = self.adapter.update_many(&self.collection, filter, &changes).await;
            self.invalidate();
            let matched = matched.map_err(self.fail(ErrorCode::UPDATE_MANY_ERROR, "update_many"))?;
            Ok(BulkWriteResult {
                matched_count: matched,
                modified_count: matched,
                upserted_count: 0,
            })
        })
        .await
    }

    /// Updates the first record matching `filter`, or creates one from the
    /// filter's equality fields plus `data`. A valid `_id` in `data` keys the
    /// created record.
    pub async fn upsert<D: Serialize + ?Sized>(&self, filter: &Filter, data: &D) -> DatabaseResult<UpsertResult<T>> {
        self.observe("upsert", self.upsert_inner(filter, data)).await
    }

    async fn upsert_inner<D: Serialize + ?Sized>(&self, filter: &Filter, data: &D) -> DatabaseResult<UpsertResult<T>> {
        let now = timestamp_now();
        let raw = to_document(data).map_err(|e| serialization_error(&e, format!("encoding a '{}' record", self.collection)))?;
        let requested_id = raw.get(ID_FIELD).cloned();
        let changes = self.prepare_changes(&raw, &now)?;

        let mut insert = filter.equality_fields();
        insert.extend(changes.clone());
        match requested_id.or_else(|| insert.get(ID_FIELD).cloned()) {
            Some(Value::String(id)) if validate_id(&id) => {
                insert.insert(ID_FIELD.to_string(), Value::String(id));
            }
            Some(Value::Null) | None => {
                insert.insert(ID_FIELD.to_string(), Value::String(generate_id()));
            }
            Some(other) => return Err(invalid_id(&other.to_string())),
        }
        insert.insert(CREATED_AT_FIELD.to_string(), Value::String(now.clone()));

        // A payload that cannot stand alone as a record may still update one.
        if let Err(validation) = self.schema.validate(&insert, WriteMode::Insert) {
            let updated = self.adapter.update_one(&self.collection, filter, &changes).await;
            self.invalidate();
            return match updated.map_err(self.fail(ErrorCode::UPSERT_ERROR, "upsert"))? {
                Some(document) => Ok(UpsertResult {
                    document: self.decode(document)?,
                    inserted: false,
                }),
                None => Err(validation.into_database_error(ErrorCode::VALIDATION_ERROR, "upsert")),
            };
        }

        let outcome = self.adapter.upsert(&self.collection, filter, &changes, &insert).await;
        self.invalidate();
        let outcome = outcome.map_err(self.fail(ErrorCode::UPSERT_ERROR, "upsert"))?;
        Ok(UpsertResult {
            document: self.decode(outcome.document)?,
            inserted: outcome.inserted,
        })
    }

    /// Upserts each `(filter, data)` pair in order. Stops at the first
    /// failure, whose details carry the failing index.
    pub async fn upsert_many<D: Serialize>(&self, items: &[(Filter, D)]) -> DatabaseResult<BulkWriteResult> {
        self.observe("upsert_many", async {
            let mut result = BulkWriteResult::default();
            for (index, (filter, data)) in items.iter().enumerate() {
                let outcome = self.upsert_inner(filter, data).await.map_err(|e| {
                    DatabaseError::new(ErrorCode::UPSERT_MANY_ERROR, format!("upsert_many item {index}: {}", e.message))
                        .with_details(json!({ "failedIndex": index, "cause": e.code, "completed": result }))
                })?;
                if outcome.inserted {
                    result.upserted_count += 1;
                } else {
                    result.matched_count += 1;
                    result.modified_count += 1;
                }
            }
            Ok(result)
        })
        .await
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, id: &str) -> DatabaseResult<bool> {
        self.observe("delete", async {
            if !validate_id(id) {
                return Err(invalid_id(id));
            }
            let deleted = self.adapter.delete_one(&self.collection, &Filter::id(id)).await;
            self.invalidate();
            Ok(deleted.map_err(self.fail(ErrorCode::DELETE_ERROR, "delete"))? > 0)
        })
        .await
    }

    pub async fn delete_many(&self, filter: &Filter) -> DatabaseResult<u64> {
        self.observe("delete_many", async {
            let deleted = self.adapter.delete_many(&self.collection, filter).await;
            self.invalidate();
            deleted.map_err(self.fail(ErrorCode::DELETE_MANY_ERROR, "delete_many"))
        })
        .await
    }
}
