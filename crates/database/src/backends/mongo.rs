//! The document-store adapter.
//!
//! Documents map one-to-one onto BSON documents, so filters, sorts and
//! pipelines are handed to the server natively. Pool usage is tracked from
//! the driver's connection-monitoring events.

use super::stored_shape;
use crate::adapter::{BatchInsertFailure, BatchInsertOutcome, ConnectionSettings, DatabaseAdapter, UpsertOutcome};
use crate::error::{DbError, MONGO_DUPLICATE_KEY};
use crate::filter::Filter;
use crate::pipeline::{Stage, filter_to_json};
use crate::query::FindOptions;
use crate::schema::{ResolvedSchema, table_name};
use async_trait::async_trait;
use core_types::{Backend, Document, ID_FIELD};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document as BsonDocument, doc};
use mongodb::error::ErrorKind;
use mongodb::event::EventHandler;
use mongodb::event::cmap::CmapEvent;
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};
use parking_lot::RwLock;
use resilience::PoolStats;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};

/// Live connection counts, fed by CMAP events.
#[derive(Debug, Default)]
struct PoolCounters {
    open: AtomicI64,
    checked_out: AtomicI64,
    waiting: AtomicI64,
}

impl PoolCounters {
    fn observe(&self, event: &CmapEvent) {
        match event {
            CmapEvent::ConnectionCreated(_) => {
                self.open.fetch_add(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionClosed(_) => {
                self.open.fetch_sub(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionCheckoutStarted(_) => {
                self.waiting.fetch_add(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionCheckoutFailed(_) => {
                self.waiting.fetch_sub(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionCheckedOut(_) => {
                self.waiting.fetch_sub(1, Ordering::Relaxed);
                self.checked_out.fetch_add(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionCheckedIn(_) => {
                self.checked_out.fetch_sub(1, Ordering::Relaxed);
            }
            CmapEvent::PoolCleared(_) | CmapEvent::PoolClosed(_) => {
                self.open.store(0, Ordering::Relaxed);
                self.checked_out.store(0, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn read(counter: &AtomicI64) -> u32 {
        u32::try_from(counter.load(Ordering::Relaxed).max(0)).unwrap_or(u32::MAX)
    }

    fn stats(&self, max_pool_size: u32) -> PoolStats {
        let open = Self::read(&self.open);
        let active = Self::read(&self.checked_out);
        PoolStats {
            total_connections: max_pool_size,
            active_connections: active,
            idle_connections: open.saturating_sub(active),
            waiting_requests: Self::read(&self.waiting),
        }
    }
}

#[derive(Clone)]
struct Connection {
    client: Client,
    database: Database,
}

pub struct MongoAdapter {
    settings: ConnectionSettings,
    connection: RwLock<Option<Connection>>,
    counters: Arc<PoolCounters>,
    /// Physical collection names of registered schemas.
    names: RwLock<HashMap<String, String>>,
}

impl MongoAdapter {
    /// Re-reads an upsert target that another writer created first.
    async fn matched_after_race(
        &self,
        collection: &str,
        filter: &Filter,
        changes: &Document,
        error: Option<DbError>,
    ) -> Result<UpsertOutcome, DbError> {
        debug!(collection, "Upsert lost an insert race, retrying as update");
        match self.update_one(collection, filter, changes).await? {
            Some(document) => Ok(UpsertOutcome { document, inserted: false }),
            None => Err(error.unwrap_or_else(|| DbError::InvalidQuery("upsert matched no document".into()))),
        }
    }

    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            connection: RwLock::new(None),
            counters: Arc::new(PoolCounters::default()),
            names: RwLock::new(HashMap::new()),
        }
    }

    fn database(&self) -> Result<Database, DbError> {
        self.connection
            .read()
            .as_ref()
            .map(|c| c.database.clone())
            .ok_or(DbError::NotConnected)
    }

    fn collection(&self, collection: &str) -> Result<Collection<BsonDocument>, DbError> {
        let name = match self.names.read().get(collection) {
            Some(name) => name.clone(),
            None => table_name(collection)?,
        };
        Ok(self.database()?.collection(&name))
    }
}

fn to_bson(doc: &Document) -> Result<BsonDocument, DbError> {
    Ok(bson::to_document(doc)?)
}

fn from_bson(doc: BsonDocument) -> Result<Document, DbError> {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => Ok(map),
        other => Err(DbError::InvalidQuery(format!("server returned a non-document value {other}"))),
    }
}

fn query(filter: &Filter) -> Result<BsonDocument, DbError> {
    filter.validate()?;
    Ok(bson::to_document(&filter_to_json(filter))?)
}

fn sort_document(options: &FindOptions) -> BsonDocument {
    options
        .stable_sort()
        .into_iter()
        .map(|(field, direction)| (field, Bson::Int32(direction.as_i32())))
        .collect()
}

/// `$set` for present values, `$unset` for nulls and, on upsert, `$setOnInsert`
/// for insert-only fields that neither of the others touches.
fn update_document(changes: &Document, insert: Option<&Document>) -> Result<BsonDocument, DbError> {
    let mut set = Map::new();
    let mut unset = Map::new();
    for (key, value) in changes.iter().filter(|(k, _)| *k != ID_FIELD) {
        if value.is_null() {
            unset.insert(key.clone(), Value::String(String::new()));
        } else {
            set.insert(key.clone(), value.clone());
        }
    }
    let on_insert: Map<String, Value> = insert
        .map(|doc| {
            doc.iter()
                .filter(|(k, v)| !v.is_null() && !set.contains_key(*k) && !unset.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    let mut update = BsonDocument::new();
    for (operator, fields) in [("$set", set), ("$unset", unset), ("$setOnInsert", on_insert)] {
        if !fields.is_empty() {
            update.insert(operator, bson::to_document(&fields)?);
        }
    }
    Ok(update)
}

#[async_trait]
impl DatabaseAdapter for MongoAdapter {
    fn backend(&self) -> Backend {
        Backend::MongoDb
    }

    async fn connect(&self) -> Result<(), DbError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.settings.url.is_empty() {
            return Err(DbError::ConnectionConfig("a MongoDB connection URL must be set".into()));
        }
        let mut options = ClientOptions::parse(&self.settings.url).await?;
        options.max_pool_size = Some(self.settings.max_pool_size);
        options.min_pool_size = Some(self.settings.min_pool_size);
        options.connect_timeout = Some(self.settings.acquire_timeout);
        options.server_selection_timeout = Some(self.settings.acquire_timeout);
        let counters = Arc::clone(&self.counters);
        options.cmap_event_handler = Some(EventHandler::callback(move |event: CmapEvent| counters.observe(&event)));

        let client = Client::with_options(options)?;
        let database = client
            .default_database()
            .unwrap_or_else(|| client.database(&self.settings.database_name));
        // The driver connects lazily; ping so failures surface here.
        database.run_command(doc! { "ping": 1 }).await?;
        info!(database = %database.name(), "MongoDB client connected");
        *self.connection.write() = Some(Connection { client, database });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DbError> {
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            connection.client.shutdown().await;
            info!("MongoDB client shut down");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.database()?.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    fn pool_stats(&self) -> PoolStats {
        self.counters.stats(self.settings.max_pool_size)
    }

    async fn ensure_collection(&self, schema: &ResolvedSchema) -> Result<(), DbError> {
        let database = self.database()?;
        let migrate = |e: mongodb::error::Error| DbError::schema(&schema.collection, e);

        let existing = database.list_collection_names().await.map_err(migrate)?;
        if !existing.contains(&schema.table) {
            database.create_collection(&schema.table).await.map_err(migrate)?;
        }
        let collection = database.collection::<BsonDocument>(&schema.table);
        for field in schema.unique_fields() {
            let mut keys = BsonDocument::new();
            keys.insert(field.definition.name.clone(), 1);
            let index = IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build();
            collection.create_index(index).await.map_err(migrate)?;
        }
        self.names
            .write()
            .insert(schema.collection.clone(), schema.table.clone());
        debug!(collection = %schema.collection, "Collection ready");
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), DbError> {
        self.collection(collection)?.drop().await?;
        self.names.write().remove(collection);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        let mut names = self.database()?.list_collection_names().await?;
        names.sort();
        Ok(names)
    }

    async fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, DbError> {
        options.validate()?;
        let coll = self.collection(collection)?;
        let mut action = coll.find(query(filter)?).sort(sort_document(options));
        if let Some(skip) = options.skip {
            action = action.skip(skip);
        }
        if let Some(limit) = options.limit {
            action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(fields) = &options.projection {
            let projection: BsonDocument = fields.iter().map(|f| (f.clone(), Bson::Int32(1))).collect();
            action = action.projection(projection);
        }
        let docs: Vec<BsonDocument> = action.await?.try_collect().await?;
        docs.into_iter().map(from_bson).collect()
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        Ok(self.collection(collection)?.count_documents(query(filter)?).await?)
    }

    async fn exists(&self, collection: &str, filter: &Filter) -> Result<bool, DbError> {
        let found = self
            .collection(collection)?
            .find_one(query(filter)?)
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(found.is_some())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<Document, DbError> {
        let document = stored_shape(&document);
        self.collection(collection)?.insert_one(to_bson(&document)?).await?;
        Ok(document)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<BatchInsertOutcome, DbError> {
        let documents: Vec<Document> = documents.iter().map(stored_shape).collect();
        if documents.is_empty() {
            return Ok(BatchInsertOutcome::default());
        }
        let encoded = documents.iter().map(to_bson).collect::<Result<Vec<_>, _>>()?;
        let failed: HashMap<usize, (i32, String)> = match self
            .collection(collection)?
            .insert_many(encoded)
            .ordered(false)
            .await
        {
            Ok(_) => HashMap::new(),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::InsertMany(failure) if failure.write_concern_error.is_none() => failure
                    .write_errors
                    .iter()
                    .flatten()
                    .map(|w| (w.index, (w.code, w.message.clone())))
                    .collect(),
                _ => return Err(e.into()),
            },
        };

        let mut outcome = BatchInsertOutcome::default();
        for (index, doc) in documents.into_iter().enumerate() {
            match failed.get(&index) {
                None => outcome.inserted.push(doc),
                Some((code, message)) => outcome.failures.push(BatchInsertFailure {
                    index,
                    error: if *code == MONGO_DUPLICATE_KEY {
                        DbError::DuplicateKey(message.clone())
                    } else {
                        DbError::InvalidQuery(message.clone())
                    },
                }),
            }
        }
        Ok(outcome)
    }

    async fn update_one(&self, collection: &str, filter: &Filter, changes: &Document) -> Result<Option<Document>, DbError> {
        let collection = self.collection(collection)?;
        let update = update_document(changes, None)?;
        let found = if update.is_empty() {
            collection.find_one(query(filter)?).await?
        } else {
            collection
                .find_one_and_update(query(filter)?, update)
                .return_document(ReturnDocument::After)
                .await?
        };
        found.map(from_bson).transpose()
    }

    async fn update_many(&self, collection: &str, filter: &Filter, changes: &Document) -> Result<u64, DbError> {
        let collection = self.collection(collection)?;
        let update = update_document(changes, None)?;
        if update.is_empty() {
            return Ok(collection.count_documents(query(filter)?).await?);
        }
        Ok(collection.update_many(query(filter)?, update).await?.matched_count)
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        changes: &Document,
        insert: &Document,
    ) -> Result<UpsertOutcome, DbError> {
        if let Some(document) = self.update_one(collection, filter, changes).await? {
            return Ok(UpsertOutcome { document, inserted: false });
        }
        let coll = self.collection(collection)?;
        let result = coll
            .update_one(query(filter)?, update_document(changes, Some(insert))?)
            .upsert(true)
            .await;
        match result {
            Ok(outcome) => match outcome.upserted_id {
                Some(id) => {
                    let found = coll
                        .find_one(doc! { "_id": id })
                        .await?
                        .ok_or_else(|| DbError::InvalidQuery("upserted document vanished".into()))?;
                    Ok(UpsertOutcome {
                        document: from_bson(found)?,
                        inserted: true,
                    })
                }
                // A concurrent writer inserted the key between the two steps
                // and the upsert matched it; `$set` is idempotent.
                None => self.matched_after_race(collection, filter, changes, None).await,
            },
            Err(e) => {
                let e = DbError::from(e);
                if !e.is_duplicate_key() {
                    return Err(e);
                }
                self.matched_after_race(collection, filter, changes, Some(e)).await
            }
        }
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        Ok(self.collection(collection)?.delete_one(query(filter)?).await?.deleted_count)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        Ok(self.collection(collection)?.delete_many(query(filter)?).await?.deleted_count)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Document>, DbError> {
        let stages = pipeline
            .iter()
            .map(|stage| Ok(bson::to_document(&stage.to_json())?))
            .collect::<Result<Vec<BsonDocument>, DbError>>()?;
        let docs: Vec<BsonDocument> = self
            .collection(collection)?
            .aggregate(stages)
            .await?
            .try_collect()
            .await?;
        docs.into_iter().map(from_bson).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_splits_set_unset_and_insert_only_fields() {
        let changes = json!({"title": "New", "legacy": null, "_id": "ignored"});
        let insert = json!({"_id": "n1", "title": "Draft", "createdAt": "t0", "legacy": 1});
        let update = update_document(changes.as_object().unwrap(), insert.as_object()).unwrap();
        assert_eq!(
            update,
            doc! {
                "$set": {"title": "New"},
                "$unset": {"legacy": ""},
                "$setOnInsert": {"_id": "n1", "createdAt": "t0"},
            }
        );
    }

    #[test]
    fn sort_always_ends_with_id() {
        let options = FindOptions::new().sort("rank", core_types::SortDirection::Desc);
        assert_eq!(sort_document(&options), doc! {"rank": -1, "_id": 1});
    }

    #[test]
    fn pool_counters_follow_checkouts() {
        let counters = PoolCounters::default();
        counters.open.store(3, Ordering::Relaxed);
        counters.checked_out.store(2, Ordering::Relaxed);
        counters.waiting.store(-1, Ordering::Relaxed);
        let stats = counters.stats(10);
        assert_eq!(stats.total_connections, 10);
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.waiting_requests, 0);
    }
}
