//! The collection/schema module: registers logical collections with the
//! backend and hands out minimal read-only handles.

use crate::adapter::DatabaseAdapter;
use crate::error::DbError;
use crate::filter::Filter;
use crate::pipeline::Stage;
use crate::query::FindOptions;
use crate::schema::{CollectionSchema, ResolvedSchema};
use core_types::{DatabaseError, DatabaseResult, Document, ErrorCode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A per-collection handle. Everything beyond `find_one` and `aggregate`
/// goes through a [`Repository`](crate::Repository).
#[derive(Clone)]
pub struct CollectionModel {
    schema: Arc<ResolvedSchema>,
    source: CollectionSchema,
    adapter: Arc<dyn DatabaseAdapter>,
}

impl CollectionModel {
    pub fn name(&self) -> &str {
        &self.schema.collection
    }

    pub fn schema(&self) -> &Arc<ResolvedSchema> {
        &self.schema
    }

    /// The description this handle was registered from.
    pub fn definition(&self) -> &CollectionSchema {
        &self.source
    }

    pub async fn find_one(&self, filter: &Filter) -> DatabaseResult<Option<Document>> {
        let options = FindOptions::new().limit(1);
        let documents = self
            .adapter
            .find(self.name(), filter, &options)
            .await
            .map_err(|e| e.into_database_error(ErrorCode::FIND_ONE_ERROR, format!("find_one on '{}'", self.name())))?;
        Ok(documents.into_iter().next())
    }

    pub async fn aggregate(&self, pipeline: &[Stage]) -> DatabaseResult<Vec<Document>> {
        self.adapter
            .aggregate(self.name(), pipeline)
            .await
            .map_err(|e| e.into_database_error(ErrorCode::AGGREGATION_ERROR, format!("aggregate on '{}'", self.name())))
    }
}

impl std::fmt::Debug for CollectionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionModel")
            .field("collection", &self.schema.collection)
            .field("table", &self.schema.table)
            .finish()
    }
}

/// Adds the fields of `update` to `current`. Existing fields may change
/// their flags but never their type, and nothing is removed.
fn merge_additive(current: &CollectionSchema, update: &CollectionSchema) -> Result<CollectionSchema, DbError> {
    let mut merged = current.clone();
    for field in &update.fields {
        match merged.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) if existing.field_type != field.field_type => {
                return Err(DbError::schema(
                    &current.id,
                    format!(
                        "field '{}' cannot change type from {:?} to {:?}",
                        field.name, existing.field_type, field.field_type
                    ),
                ));
            }
            Some(existing) => *existing = field.clone(),
            None => merged.fields.push(field.clone()),
        }
    }
    Ok(merged)
}

/// The registry of collection handles, keyed by collection identifier.
pub struct CollectionRegistry {
    adapter: Arc<dyn DatabaseAdapter>,
    models: RwLock<HashMap<String, CollectionModel>>,
}

impl CollectionRegistry {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            adapter,
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_model(&self, id: &str) -> Option<CollectionModel> {
        self.models.read().get(id).cloned()
    }

    pub fn schema(&self, id: &str) -> Option<Arc<ResolvedSchema>> {
        self.models.read().get(id).map(|m| m.schema.clone())
    }

    /// Registered identifiers, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    /// Creates the physical collection, or reuses it. An identical
    /// description returns the existing handle; a different one is merged
    /// in additively as by [`update_model`](Self::update_model).
    pub async fn create_model(&self, schema: &CollectionSchema) -> DatabaseResult<CollectionModel> {
        if let Some(existing) = self.get_model(&schema.id) {
            if existing.source == *schema {
                debug!(collection = %schema.id, "Reusing registered collection");
                return Ok(existing);
            }
            return self.update_model(schema).await;
        }
        self.register(schema.clone()).await
    }

    /// Migrates a registered collection additively: new fields become new
    /// columns, existing data is untouched.
    pub async fn update_model(&self, schema: &CollectionSchema) -> DatabaseResult<CollectionModel> {
        let merged = match self.get_model(&schema.id) {
            Some(existing) => merge_additive(&existing.source, schema).map_err(|e| migration_error(e, &schema.id))?,
            None => schema.clone(),
        };
        self.register(merged).await
    }

    /// Forgets the handle. The physical collection and its data stay.
    pub fn delete_model(&self, id: &str) -> bool {
        let removed = self.models.write().remove(id).is_some();
        if removed {
            info!(collection = id, "Collection handle removed");
        }
        removed
    }

    async fn register(&self, source: CollectionSchema) -> DatabaseResult<CollectionModel> {
        let resolved = ResolvedSchema::resolve(&source).map_err(|e| migration_error(e, &source.id))?;
        self.adapter
            .ensure_collection(&resolved)
            .await
            .map_err(|e| migration_error(e, &source.id))?;
        let model = CollectionModel {
            schema: Arc::new(resolved),
            source,
            adapter: self.adapter.clone(),
        };
        self.models.write().insert(model.name().to_string(), model.clone());
        info!(collection = %model.name(), table = %model.schema.table, "Collection registered");
        Ok(model)
    }
}

fn migration_error(err: DbError, collection: &str) -> DatabaseError {
    err.into_database_error(
        ErrorCode::SCHEMA_MIGRATION_ERROR,
        format!("registering collection '{collection}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDefinition;
    use core_types::FieldType;

    #[test]
    fn merge_is_additive() {
        let current = CollectionSchema::new("pages").field(FieldDefinition::new("title", FieldType::String));
        let update = CollectionSchema::new("pages")
            .field(FieldDefinition::new("title", FieldType::String).required())
            .field(FieldDefinition::new("views", FieldType::Integer));
        let merged = merge_additive(&current, &update).unwrap();
        assert_eq!(merged.fields.len(), 2);
        assert!(merged.fields[0].required);

        let narrowed = CollectionSchema::new("pages");
        assert_eq!(merge_additive(&merged, &narrowed).unwrap().fields.len(), 2);

        let retyped = CollectionSchema::new("pages").field(FieldDefinition::new("title", FieldType::Integer));
        assert!(matches!(merge_additive(&merged, &retyped), Err(DbError::Schema { .. })));
    }
}
