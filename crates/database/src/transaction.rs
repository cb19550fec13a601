//! Best-effort transactions for backends without multi-document transactions.
//!
//! [`JournalingAdapter`] runs every write immediately against the real
//! backend and journals how to undo it: inserted identifiers, and snapshots
//! of documents taken before they were updated or deleted. Rolling back
//! replays the journal in reverse. Other clients can observe intermediate
//! state, and a crash mid-rollback leaves partial changes behind.

use crate::adapter::{BatchInsertOutcome, DatabaseAdapter, TransactionScope, UpsertOutcome};
use crate::error::DbError;
use crate::filter::Filter;
use crate::pipeline::Stage;
use crate::query::FindOptions;
use crate::schema::ResolvedSchema;
use async_trait::async_trait;
use core_types::{Backend, Document, ID_FIELD};
use parking_lot::Mutex;
use resilience::PoolStats;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
enum JournalEntry {
    Inserted { collection: String, ids: Vec<Value> },
    /// Documents as they were before an update or delete.
    Restore { collection: String, snapshot: Vec<Document> },
}

fn ids_of(docs: &[Document]) -> Vec<Value> {
    docs.iter().filter_map(|d| d.get(ID_FIELD).cloned()).collect()
}

pub struct JournalingAdapter {
    inner: Arc<dyn DatabaseAdapter>,
    journal: Mutex<Vec<JournalEntry>>,
}

impl JournalingAdapter {
    pub fn new(inner: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            inner,
            journal: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, entry: JournalEntry) {
        self.journal.lock().push(entry);
    }

    /// The first match in `_id` order, so the snapshot and the write agree on
    /// which document is affected.
    async fn first_match(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, DbError> {
        let options = FindOptions::new().limit(1);
        Ok(self.inner.find(collection, filter, &options).await?.into_iter().next())
    }

    fn pinned(doc: &Document, filter: &Filter) -> Filter {
        match doc.get(ID_FIELD) {
            Some(id) => Filter::Eq(ID_FIELD.to_string(), id.clone()).and(filter.clone()),
            None => filter.clone(),
        }
    }

    /// Undoes the journal newest-first. Every step is attempted; the first
    /// failure is returned after the rest have run.
    pub async fn undo(&self) -> Result<(), DbError> {
        let entries: Vec<JournalEntry> = std::mem::take(&mut *self.journal.lock());
        let mut first_error = None;
        for entry in entries.into_iter().rev() {
            let result = match &entry {
                JournalEntry::Inserted { collection, ids } => self
                    .inner
                    .delete_many(collection, &Filter::In(ID_FIELD.to_string(), ids.clone()))
                    .await
                    .map(|_| ()),
                JournalEntry::Restore { collection, snapshot } => self.restore(collection, snapshot).await,
            };
            if let Err(e) = result {
                warn!(error = %e, entry = ?entry, "Compensating step failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn restore(&self, collection: &str, snapshot: &[Document]) -> Result<(), DbError> {
        if snapshot.is_empty() {
            return Ok(());
        }
        self.inner
            .delete_many(collection, &Filter::In(ID_FIELD.to_string(), ids_of(snapshot)))
            .await?;
        let outcome = self.inner.insert_many(collection, snapshot.to_vec()).await?;
        match outcome.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    fn discard(&self) {
        self.journal.lock().clear();
    }
}

#[async_trait]
impl DatabaseAdapter for JournalingAdapter {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    async fn connect(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DbError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.inner.ping().await
    }

    fn pool_stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }

    async fn ensure_collection(&self, schema: &ResolvedSchema) -> Result<(), DbError> {
        self.inner.ensure_collection(schema).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), DbError> {
        Err(DbError::NotImplemented(format!("dropping '{collection}' inside a transaction")))
    }

    async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        self.inner.list_collections().await
    }

    async fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, DbError> {
        self.inner.find(collection, filter, options).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        self.inner.count(collection, filter).await
    }

    async fn exists(&self, collection: &str, filter: &Filter) -> Result<bool, DbError> {
        self.inner.exists(collection, filter).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<Document, DbError> {
        let inserted = self.inner.insert_one(collection, document).await?;
        self.record(JournalEntry::Inserted {
            collection: collection.to_string(),
            ids: ids_of(std::slice::from_ref(&inserted)),
        });
        Ok(inserted)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<BatchInsertOutcome, DbError> {
        let outcome = self.inner.insert_many(collection, documents).await?;
        self.record(JournalEntry::Inserted {
            collection: collection.to_string(),
            ids: ids_of(&outcome.inserted),
        });
        Ok(outcome)
    }

    async fn update_one(&self, collection: &str, filter: &Filter, changes: &Document) -> Result<Option<Document>, DbError> {
        let Some(before) = self.first_match(collection, filter).await? else {
            return Ok(None);
        };
        let pinned = Self::pinned(&before, filter);
        let updated = self.inner.update_one(collection, &pinned, changes).await?;
        if updated.is_some() {
            self.record(JournalEntry::Restore {
                collection: collection.to_string(),
                snapshot: vec![before],
            });
        }
        Ok(updated)
    }

    async fn update_many(&self, collection: &str, filter: &Filter, changes: &Document) -> Result<u64, DbError> {
        let snapshot = self.inner.find(collection, filter, &FindOptions::new()).await?;
        let matched = self.inner.update_many(collection, filter, changes).await?;
        self.record(JournalEntry::Restore {
            collection: collection.to_string(),
            snapshot,
        });
        Ok(matched)
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        changes: &Document,
        insert: &Document,
    ) -> Result<UpsertOutcome, DbError> {
        let before = self.first_match(collection, filter).await?;
        let outcome = self.inner.upsert(collection, filter, changes, insert).await?;
        let entry = if outcome.inserted {
            JournalEntry::Inserted {
                collection: collection.to_string(),
                ids: ids_of(std::slice::from_ref(&outcome.document)),
            }
        } else {
            JournalEntry::Restore {
                collection: collection.to_string(),
                snapshot: before.into_iter().collect(),
            }
        };
        self.record(entry);
        Ok(outcome)
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        let Some(before) = self.first_match(collection, filter).await? else {
            return Ok(0);
        };
        let deleted = self.inner.delete_one(collection, &Self::pinned(&before, filter)).await?;
        if deleted > 0 {
            self.record(JournalEntry::Restore {
                collection: collection.to_string(),
                snapshot: vec![before],
            });
        }
        Ok(deleted)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DbError> {
        let snapshot = self.inner.find(collection, filter, &FindOptions::new()).await?;
        let deleted = self.inner.delete_many(collection, filter).await?;
        self.record(JournalEntry::Restore {
            collection: collection.to_string(),
            snapshot,
        });
        Ok(deleted)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Document>, DbError> {
        self.inner.aggregate(collection, pipeline).await
    }
}

/// A transaction scope whose rollback is the journal's compensation.
pub struct CompensatingScope {
    adapter: Arc<JournalingAdapter>,
}

impl CompensatingScope {
    pub fn new(inner: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            adapter: Arc::new(JournalingAdapter::new(inner)),
        }
    }
}

#[async_trait]
impl TransactionScope for CompensatingScope {
    fn adapter(&self) -> Arc<dyn DatabaseAdapter> {
        self.adapter.clone()
    }

    fn is_native(&self) -> bool {
        false
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.adapter.discard();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        debug!("Rolling back with compensating writes");
        self.adapter.undo().await
    }
}
