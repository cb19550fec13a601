//! Logical collection schemas and their physical placement.
//!
//! A [`CollectionSchema`] arrives from the content-modeling layer. Resolving it
//! decides, once, where every declared field lives: scalar fields get their
//! own column on the relational backends, structured and undeclared fields go
//! into the dynamic `_data` blob.

use crate::error::DbError;
use crate::filter::validate_field;
use core_types::{CREATED_AT_FIELD, DATA_FIELD, Document, FieldType, ID_FIELD, UPDATED_AT_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const SYSTEM_FIELDS: [&str; 4] = [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD, DATA_FIELD];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            unique: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// The logical schema description of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// The collection identifier.
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl CollectionSchema {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }
}

/// Physical column type of a known field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Real,
    Integer,
    Boolean,
}

impl ColumnType {
    fn for_field(field_type: FieldType) -> Option<Self> {
        match field_type {
            FieldType::String | FieldType::Date => Some(ColumnType::Text),
            FieldType::Number => Some(ColumnType::Real),
            FieldType::Integer => Some(ColumnType::Integer),
            FieldType::Boolean => Some(ColumnType::Boolean),
            FieldType::Json | FieldType::Array => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPlacement {
    /// One of `_id`, `createdAt`, `updatedAt`.
    System,
    Known(ColumnType),
    /// Stored inside the `_data` blob.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedField {
    pub definition: FieldDefinition,
    pub placement: FieldPlacement,
}

/// A schema with every field's placement decided.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSchema {
    pub collection: String,
    pub table: String,
    pub fields: Vec<ResolvedField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Insert,
    Update,
}

impl ResolvedSchema {
    pub fn resolve(schema: &CollectionSchema) -> Result<Self, DbError> {
        let table = table_name(&schema.id)?;
        let mut fields: Vec<ResolvedField> = Vec::with_capacity(schema.fields.len());
        for definition in &schema.fields {
            if validate_field(&definition.name).is_err() || definition.name.contains('.') {
                return Err(DbError::schema(&schema.id, format!("invalid field name '{}'", definition.name)));
            }
            if SYSTEM_FIELDS.contains(&definition.name.as_str()) {
                return Err(DbError::schema(&schema.id, format!("'{}' is a reserved field", definition.name)));
            }
            if fields.iter().any(|f| f.definition.name == definition.name) {
                return Err(DbError::schema(&schema.id, format!("duplicate field '{}'", definition.name)));
            }
            let placement = match ColumnType::for_field(definition.field_type) {
                Some(column) => FieldPlacement::Known(column),
                None => FieldPlacement::Dynamic,
            };
            fields.push(ResolvedField {
                definition: definition.clone(),
                placement,
            });
        }
        Ok(Self {
            collection: schema.id.clone(),
            table,
            fields,
        })
    }

    /// Where `path` is stored. Only a top-level name can be a column.
    pub fn placement(&self, path: &str) -> FieldPlacement {
        if [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD].contains(&path) {
            return FieldPlacement::System;
        }
        self.fields
            .iter()
            .find(|f| f.definition.name == path)
            .map_or(FieldPlacement::Dynamic, |f| f.placement)
    }

    pub fn known_columns(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.fields.iter().filter_map(|f| match f.placement {
            FieldPlacement::Known(column) => Some((f.definition.name.as_str(), column)),
            _ => None,
        })
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &ResolvedField> {
        self.fields.iter().filter(|f| f.definition.unique)
    }

    /// Checks required fields (on insert) and declared types.
    pub fn validate(&self, doc: &Document, mode: WriteMode) -> Result<(), DbError> {
        for field in &self.fields {
            let def = &field.definition;
            match doc.get(&def.name) {
                None | Some(Value::Null) => {
                    if def.required && mode == WriteMode::Insert {
                        return Err(DbError::Validation(format!(
                            "'{}' is required in collection '{}'",
                            def.name, self.collection
                        )));
                    }
                    if def.required && mode == WriteMode::Update && doc.contains_key(&def.name) {
                        return Err(DbError::Validation(format!("'{}' cannot be set to null", def.name)));
                    }
                }
                Some(value) if !type_matches(def.field_type, value) => {
                    return Err(DbError::Validation(format!(
                        "'{}' must be of type {:?}, got {}",
                        def.name,
                        def.field_type,
                        kind_of(value)
                    )));
                }
                Some(_) => {}
            }
        }
        doc.keys()
            .filter(|k| !SYSTEM_FIELDS.contains(&k.as_str()))
            .try_for_each(|k| {
                validate_field(k)
                    .ok()
                    .filter(|_| !k.contains('.'))
                    .ok_or_else(|| DbError::Validation(format!("invalid field name '{k}'")))
            })
    }
}

fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String | FieldType::Date => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Integer => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Array => value.is_array(),
        FieldType::Json => true,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The physical table/collection name for a collection identifier: every
/// character outside `[A-Za-z0-9_]` becomes `_`.
pub fn table_name(collection: &str) -> Result<String, DbError> {
    let name: String = collection
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() || name.len() > 63 {
        return Err(DbError::schema(collection, "collection name must be 1-63 characters"));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn posts() -> CollectionSchema {
        CollectionSchema::new("blog-posts")
            .field(FieldDefinition::new("title", FieldType::String).required())
            .field(FieldDefinition::new("slug", FieldType::String).unique())
            .field(FieldDefinition::new("views", FieldType::Integer))
            .field(FieldDefinition::new("tags", FieldType::Array))
            .field(FieldDefinition::new("body", FieldType::Json))
    }

    #[test]
    fn resolves_placements_once() {
        let schema = ResolvedSchema::resolve(&posts()).unwrap();
        assert_eq!(schema.table, "blog_posts");
        assert_eq!(schema.placement("title"), FieldPlacement::Known(ColumnType::Text));
        assert_eq!(schema.placement("views"), FieldPlacement::Known(ColumnType::Integer));
        assert_eq!(schema.placement("tags"), FieldPlacement::Dynamic);
        assert_eq!(schema.placement("undeclared"), FieldPlacement::Dynamic);
        assert_eq!(schema.placement("_id"), FieldPlacement::System);
        let columns: Vec<_> = schema.known_columns().map(|(n, _)| n).collect();
        assert_eq!(columns, vec!["title", "slug", "views"]);
        assert_eq!(schema.unique_fields().count(), 1);
    }

    #[test]
    fn parses_schema_descriptions() {
        let schema: CollectionSchema = serde_json::from_value(json!({
            "_id": "pages",
            "fields": [
                {"name": "title", "type": "text", "required": true},
                {"name": "published", "type": "checkbox"}
            ]
        }))
        .unwrap();
        assert_eq!(schema.fields[0].field_type, FieldType::String);
        assert!(schema.fields[0].required);
        assert_eq!(schema.fields[1].field_type, FieldType::Boolean);
    }

    #[test]
    fn rejects_reserved_and_duplicate_fields() {
        let reserved = CollectionSchema::new("x").field(FieldDefinition::new("_data", FieldType::Json));
        assert!(ResolvedSchema::resolve(&reserved).is_err());
        let duplicate = CollectionSchema::new("x")
            .field(FieldDefinition::new("a", FieldType::String))
            .field(FieldDefinition::new("a", FieldType::Integer));
        assert!(ResolvedSchema::resolve(&duplicate).is_err());
        assert!(table_name("").is_err());
    }

    #[test]
    fn validates_required_and_types() {
        let schema = ResolvedSchema::resolve(&posts()).unwrap();
        let ok = json!({"title": "Hello", "views": 3, "extra": {"any": true}});
        assert!(schema.validate(ok.as_object().unwrap(), WriteMode::Insert).is_ok());

        let missing = json!({"views": 3});
        assert!(matches!(
            schema.validate(missing.as_object().unwrap(), WriteMode::Insert),
            Err(DbError::Validation(_))
        ));
        assert!(schema.validate(missing.as_object().unwrap(), WriteMode::Update).is_ok());

        let wrong_type = json!({"title": "Hello", "views": "many"});
        assert!(schema.validate(wrong_type.as_object().unwrap(), WriteMode::Insert).is_err());

        let bad_key = json!({"title": "Hello", "my-field": 1});
        assert!(schema.validate(bad_key.as_object().unwrap(), WriteMode::Insert).is_err());
    }
}
