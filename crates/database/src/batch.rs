//! Mixed and bulk writes across collections.

use crate::facade::Database;
use crate::filter::Filter;
use crate::repository::{BatchInsertResult, BulkWriteResult};
use core_types::{DatabaseError, DatabaseResult, Document, ErrorCode};
use serde::Serialize;
use serde_json::json;

/// One write in a [`BatchOperations::execute`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    Insert { collection: String, data: Document },
    Update { collection: String, id: String, changes: Document },
    Delete { collection: String, id: String },
    Upsert { collection: String, filter: Filter, data: Document },
}

impl BatchOperation {
    pub fn collection(&self) -> &str {
        match self {
            BatchOperation::Insert { collection, .. }
            | BatchOperation::Update { collection, .. }
            | BatchOperation::Delete { collection, .. }
            | BatchOperation::Upsert { collection, .. } => collection,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            BatchOperation::Insert { .. } => "insert",
            BatchOperation::Update { .. } => "update",
            BatchOperation::Delete { .. } => "delete",
            BatchOperation::Upsert { .. } => "upsert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatchOutcome {
    Inserted { document: Document },
    Updated { document: Document },
    Deleted { deleted: bool },
    Upserted { document: Document, inserted: bool },
}

/// Batch entry points, borrowed from a [`Database`].
pub struct BatchOperations<'a> {
    db: &'a Database,
}

impl<'a> BatchOperations<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Runs every operation inside one transaction, in order. The first
    /// failure rolls the whole batch back and is reported as `BATCH_ERROR`
    /// with the failing index in its details.
    pub async fn execute(&self, operations: Vec<BatchOperation>) -> DatabaseResult<Vec<BatchOutcome>> {
        let total = operations.len();
        let result = self
            .db
            .transaction(|tx| async move {
                let mut outcomes = Vec::with_capacity(total);
                for (index, operation) in operations.into_iter().enumerate() {
                    let kind = operation.kind();
                    let failed = |e: DatabaseError| {
                        DatabaseError::new(
                            ErrorCode::BATCH_ERROR,
                            format!("batch operation {index} ({kind}) failed: {}", e.message),
                        )
                        .with_details(json!({ "failedIndex": index, "operation": kind, "cause": e.code }))
                    };
                    let repository = tx.crud::<Document>(operation.collection()).map_err(&failed)?;
                    let outcome = match operation {
                        BatchOperation::Insert { data, .. } => repository
                            .insert(&data)
                            .await
                            .map(|document| BatchOutcome::Inserted { document }),
                        BatchOperation::Update { id, changes, .. } => repository
                            .update(&id, &changes)
                            .await
                            .map(|document| BatchOutcome::Updated { document }),
                        BatchOperation::Delete { id, .. } => repository
                            .delete(&id)
                            .await
                            .map(|deleted| BatchOutcome::Deleted { deleted }),
                        BatchOperation::Upsert { filter, data, .. } => {
                            repository.upsert(&filter, &data).await.map(|result| BatchOutcome::Upserted {
                                document: result.document,
                                inserted: result.inserted,
                            })
                        }
                    };
                    outcomes.push(outcome.map_err(&failed)?);
                }
                Ok(outcomes)
            })
            .await;
        if let Err(e) = &result {
            tracing::warn!(operations = total, error = %e, "Batch rolled back");
        }
        result
    }

    pub async fn bulk_insert<D: Serialize>(&self, collection: &str, items: &[D]) -> DatabaseResult<BatchInsertResult<Document>> {
        self.db.crud::<Document>(collection)?.insert_many(items).await
    }

    pub async fn bulk_update<D: Serialize + ?Sized>(
        &self,
        collection: &str,
        filter: &Filter,
        changes: &D,
    ) -> DatabaseResult<BulkWriteResult> {
        self.db.crud::<Document>(collection)?.update_many(filter, changes).await
    }

    pub async fn bulk_delete(&self, collection: &str, filter: &Filter) -> DatabaseResult<u64> {
        self.db.crud::<Document>(collection)?.delete_many(filter).await
    }
}
