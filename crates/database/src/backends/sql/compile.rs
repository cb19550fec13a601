//! Renders filters, windows and writes into parameterized SQL.
//!
//! Every value reaches the server as a bind. Identifiers are either system
//! names, schema-declared column names or validated field paths, so they are
//! quoted or inlined into JSON path literals.

use super::dialect::{Dialect, quote};
use crate::error::DbError;
use crate::filter::Filter;
use crate::query::FindOptions;
use crate::schema::{ColumnType, FieldPlacement, ResolvedSchema};
use core_types::{CREATED_AT_FIELD, DATA_FIELD, Document, ID_FIELD, SortDirection, UPDATED_AT_FIELD};
use serde_json::{Map, Value};

/// Upper bound on binds per statement; SQLite and Postgres both cap around
/// 32k parameters.
pub const MAX_BINDS: usize = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Json(Value),
    /// A typed SQL NULL.
    Null(ColumnType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

impl Statement {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    pub fn with_bind(mut self, value: SqlValue) -> Self {
        self.binds.push(value);
        self
    }
}

enum Target {
    Column(String, ColumnType),
    Dynamic(String),
}

struct SqlBuilder<'a> {
    dialect: Dialect,
    schema: &'a ResolvedSchema,
    sql: String,
    binds: Vec<SqlValue>,
}

impl<'a> SqlBuilder<'a> {
    fn new(dialect: Dialect, schema: &'a ResolvedSchema) -> Self {
        Self {
            dialect,
            schema,
            sql: String::new(),
            binds: Vec::new(),
        }
    }

    fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Registers a bind and returns its placeholder. Callers must place the
    /// placeholder in the text before registering the next bind.
    fn bind(&mut self, value: SqlValue) -> String {
        self.binds.push(value);
        self.dialect.placeholder(self.binds.len())
    }

    fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            binds: self.binds,
        }
    }

    fn table(&self) -> String {
        quote(&self.schema.table)
    }

    fn target(&self, field: &str) -> Target {
        match self.schema.placement(field) {
            FieldPlacement::System => Target::Column(quote(field), ColumnType::Text),
            FieldPlacement::Known(column) => Target::Column(quote(field), column),
            FieldPlacement::Dynamic => Target::Dynamic(field.to_string()),
        }
    }

    fn value_expr(&self, target: &Target) -> String {
        match target {
            Target::Column(column, _) => column.clone(),
            Target::Dynamic(path) => self.dialect.dynamic_json(path),
        }
    }

    fn null_check(&self, target: &Target) -> String {
        match target {
            Target::Column(column, _) => format!("{column} IS NULL"),
            Target::Dynamic(path) => self.dialect.dynamic_null(path),
        }
    }

    /// Bind expression comparable with `value_expr(target)`.
    fn bind_compare(&mut self, target: &Target, value: &Value) -> Result<String, DbError> {
        match target {
            Target::Column(column, column_type) => {
                let bound = compare_value(*column_type, value)
                    .ok_or_else(|| DbError::InvalidQuery(format!("{value} cannot be compared with column {column}")))?;
                Ok(self.bind(bound))
            }
            Target::Dynamic(_) => Ok(self.bind_json(value)),
        }
    }

    /// A JSON value in the dialect's blob representation.
    fn bind_json(&mut self, value: &Value) -> String {
        match self.dialect {
            Dialect::Postgres => self.bind(SqlValue::Json(value.clone())),
            Dialect::Sqlite => match value {
                Value::String(s) => self.bind(SqlValue::Text(s.clone())),
                Value::Bool(b) => self.bind(SqlValue::Int(i64::from(*b))),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => self.bind(SqlValue::Int(i)),
                    None => self.bind(SqlValue::Float(n.as_f64().unwrap_or_default())),
                },
                other => {
                    let placeholder = self.bind(SqlValue::Text(other.to_string()));
                    format!("json({placeholder})")
                }
            },
        }
    }

    fn push_filter(&mut self, filter: &Filter) -> Result<(), DbError> {
        match filter {
            Filter::All => self.push("1 = 1"),
            Filter::Eq(field, Value::Null) => {
                let target = self.target(field);
                let sql = self.null_check(&target);
                self.push(&sql);
            }
            Filter::Eq(field, value) => self.push_comparison(field, "=", value)?,
            Filter::Ne(field, Value::Null) => {
                let target = self.target(field);
                let sql = format!("NOT ({})", self.null_check(&target));
                self.push(&sql);
            }
            Filter::Ne(field, value) => {
                let target = self.target(field);
                let null = self.null_check(&target);
                let expr = self.value_expr(&target);
                let placeholder = self.bind_compare(&target, value)?;
                self.push(&format!("({null} OR {expr} <> {placeholder})"));
            }
            Filter::Gt(_, Value::Null)
            | Filter::Gte(_, Value::Null)
            | Filter::Lt(_, Value::Null)
            | Filter::Lte(_, Value::Null) => self.push("1 = 0"),
            Filter::Gt(field, value) => self.push_comparison(field, ">", value)?,
            Filter::Gte(field, value) => self.push_comparison(field, ">=", value)?,
            Filter::Lt(field, value) => self.push_comparison(field, "<", value)?,
            Filter::Lte(field, value) => self.push_comparison(field, "<=", value)?,
            Filter::In(field, values) => self.push_membership(field, values, false)?,
            Filter::NotIn(field, values) => self.push_membership(field, values, true)?,
            Filter::Exists(field, exists) => {
                let target = self.target(field);
                let present = match &target {
                    Target::Column(column, _) => format!("{column} IS NOT NULL"),
                    Target::Dynamic(path) => self.dialect.dynamic_present(path),
                };
                if *exists {
                    self.push(&present);
                } else {
                    self.push(&format!("NOT ({present})"));
                }
            }
            Filter::Contains(field, needle) => self.push_position(field, needle, "> 0")?,
            Filter::StartsWith(field, prefix) => self.push_position(field, prefix, "= 1")?,
            Filter::And(filters) => self.push_group(filters, " AND ", "1 = 1")?,
            Filter::Or(filters) => self.push_group(filters, " OR ", "1 = 0")?,
            Filter::Not(inner) => {
                // A NULL comparison inside counts as a non-match, as in memory.
                self.push("NOT COALESCE((");
                self.push_filter(inner)?;
                self.push("), FALSE)");
            }
        }
        Ok(())
    }

    fn push_comparison(&mut self, field: &str, operator: &str, value: &Value) -> Result<(), DbError> {
        let target = self.target(field);
        let expr = self.value_expr(&target);
        let placeholder = self.bind_compare(&target, value)?;
        self.push(&format!("{expr} {operator} {placeholder}"));
        Ok(())
    }

    fn push_membership(&mut self, field: &str, values: &[Value], negated: bool) -> Result<(), DbError> {
        let target = self.target(field);
        let expr = self.value_expr(&target);
        let null = self.null_check(&target);
        let has_null = values.iter().any(Value::is_null);
        let mut placeholders = Vec::new();
        for value in values.iter().filter(|v| !v.is_null()) {
            placeholders.push(self.bind_compare(&target, value)?);
        }
        let list = placeholders.join(", ");
        let sql = match (negated, placeholders.is_empty(), has_null) {
            (false, true, false) => "1 = 0".to_string(),
            (false, true, true) => null,
            (false, false, false) => format!("{expr} IN ({list})"),
            (false, false, true) => format!("({null} OR {expr} IN ({list}))"),
            (true, true, false) => "1 = 1".to_string(),
            (true, true, true) => format!("NOT ({null})"),
            (true, false, false) => format!("({null} OR {expr} NOT IN ({list}))"),
            (true, false, true) => format!("(NOT ({null}) AND {expr} NOT IN ({list}))"),
        };
        self.push(&sql);
        Ok(())
    }

    fn push_position(&mut self, field: &str, needle: &str, test: &str) -> Result<(), DbError> {
        let haystack = match self.target(field) {
            Target::Column(column, ColumnType::Text) => column,
            Target::Column(column, _) => {
                return Err(DbError::InvalidQuery(format!("text search on non-text column {column}")));
            }
            Target::Dynamic(path) => self.dialect.dynamic_text(&path),
        };
        let placeholder = self.bind(SqlValue::Text(needle.to_string()));
        let position = self.dialect.position(&haystack, &placeholder);
        self.push(&format!("{position} {test}"));
        Ok(())
    }

    fn push_group(&mut self, filters: &[Filter], separator: &str, empty: &str) -> Result<(), DbError> {
        if filters.is_empty() {
            self.push(empty);
            return Ok(());
        }
        self.push("(");
        for (i, filter) in filters.iter().enumerate() {
            if i > 0 {
                self.push(separator);
            }
            self.push_filter(filter)?;
        }
        self.push(")");
        Ok(())
    }

    fn push_where(&mut self, filter: &Filter) -> Result<(), DbError> {
        if matches!(filter, Filter::All) {
            return Ok(());
        }
        self.push(" WHERE ");
        self.push_filter(filter)
    }

    fn push_order(&mut self, sort: &[(String, SortDirection)]) {
        let terms: Vec<String> = sort
            .iter()
            .map(|(field, direction)| {
                let expr = self.value_expr(&self.target(field));
                match direction {
                    SortDirection::Asc => format!("{expr} ASC NULLS FIRST"),
                    SortDirection::Desc => format!("{expr} DESC NULLS LAST"),
                }
            })
            .collect();
        if !terms.is_empty() {
            self.push(" ORDER BY ");
            self.push(&terms.join(", "));
        }
    }

    fn push_window(&mut self, skip: Option<u64>, limit: Option<u64>) {
        let skip = skip.filter(|s| *s > 0);
        match (self.dialect, limit) {
            (_, Some(limit)) => {
                let placeholder = self.bind(SqlValue::Int(to_i64(limit)));
                self.push(&format!(" LIMIT {placeholder}"));
            }
            // SQLite only accepts OFFSET after a LIMIT.
            (Dialect::Sqlite, None) if skip.is_some() => self.push(" LIMIT -1"),
            _ => {}
        }
        if let Some(skip) = skip {
            let placeholder = self.bind(SqlValue::Int(to_i64(skip)));
            self.push(&format!(" OFFSET {placeholder}"));
        }
    }

    /// `"_id" = (SELECT "_id" ... LIMIT 1)`, the first match of `filter`.
    fn push_first_match(&mut self, filter: &Filter) -> Result<(), DbError> {
        let table = self.table();
        self.push(&format!(" WHERE \"{ID_FIELD}\" = (SELECT \"{ID_FIELD}\" FROM {table}"));
        self.push_where(filter)?;
        self.push(" LIMIT 1)");
        Ok(())
    }

    /// Renders the `SET` list for `changes`. Columns are assigned directly;
    /// blob keys are merged in, and `null` removes a blob key.
    fn push_assignments(&mut self, changes: &Document) -> Result<(), DbError> {
        let mut parts = Vec::new();
        for (name, column_type) in self.schema.known_columns() {
            if let Some(value) = changes.get(name) {
                let bound = write_value(column_type, value)
                    .ok_or_else(|| DbError::Validation(format!("'{name}' cannot store {value}")))?;
                let placeholder = self.bind(bound);
                parts.push(format!("{} = {placeholder}", quote(name)));
            }
        }
        if let Some(Value::String(updated_at)) = changes.get(UPDATED_AT_FIELD) {
            let placeholder = self.bind(SqlValue::Text(updated_at.clone()));
            parts.push(format!("\"{UPDATED_AT_FIELD}\" = {placeholder}"));
        }

        let (set, mut unset) = blob_changes(self.schema, changes);
        // A column write also drops any copy left in the blob from before the
        // field was promoted to a column.
        unset.extend(
            self.schema
                .known_columns()
                .filter(|(name, _)| changes.contains_key(*name))
                .map(|(name, _)| name.to_string()),
        );
        if !set.is_empty() || !unset.is_empty() {
            let blob = self.blob_assignment(set, &unset);
            parts.push(format!("\"{DATA_FIELD}\" = {blob}"));
        }

        if parts.is_empty() {
            parts.push(format!("\"{ID_FIELD}\" = \"{ID_FIELD}\""));
        }
        self.push(" SET ");
        self.push(&parts.join(", "));
        Ok(())
    }

    fn blob_assignment(&mut self, set: Map<String, Value>, unset: &[String]) -> String {
        let mut expr = format!("COALESCE(\"{DATA_FIELD}\", {})", self.dialect.empty_data());
        match self.dialect {
            Dialect::Postgres => {
                if !unset.is_empty() {
                    expr = format!("({expr} - '{{{}}}'::text[])", unset.join(","));
                }
                if !set.is_empty() {
                    let placeholder = self.bind(SqlValue::Json(Value::Object(set)));
                    expr = format!("({expr} || {placeholder})");
                }
            }
            Dialect::Sqlite => {
                if !unset.is_empty() {
                    let paths: Vec<String> = unset.iter().map(|k| format!("'$.{k}'")).collect();
                    expr = format!("json_remove({expr}, {})", paths.join(", "));
                }
                if !set.is_empty() {
                    let mut args = Vec::with_capacity(set.len());
                    for (key, value) in set {
                        let placeholder = self.bind(SqlValue::Text(value.to_string()));
                        args.push(format!("'$.{key}', json({placeholder})"));
                    }
                    expr = format!("json_set({expr}, {})", args.join(", "));
                }
            }
        }
        expr
    }

    /// One `(...)` row of an INSERT for `doc`, in `insert_columns` order.
    fn row_placeholders(&mut self, doc: &Document) -> Result<String, DbError> {
        let id = match doc.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            _ => return Err(DbError::Validation("documents need a string _id".into())),
        };
        let mut placeholders = vec![self.bind(SqlValue::Text(id))];
        for field in [CREATED_AT_FIELD, UPDATED_AT_FIELD] {
            let bound = match doc.get(field) {
                Some(Value::String(s)) => SqlValue::Text(s.clone()),
                _ => SqlValue::Null(ColumnType::Text),
            };
            placeholders.push(self.bind(bound));
        }
        for (name, column_type) in self.schema.known_columns() {
            let value = doc.get(name).unwrap_or(&Value::Null);
            let bound = write_value(column_type, value)
                .ok_or_else(|| DbError::Validation(format!("'{name}' cannot store {value}")))?;
            placeholders.push(self.bind(bound));
        }
        let (data, _) = blob_changes(self.schema, doc);
        let placeholder = match self.dialect {
            Dialect::Postgres => self.bind(SqlValue::Json(Value::Object(data))),
            Dialect::Sqlite => self.bind(SqlValue::Text(Value::Object(data).to_string())),
        };
        placeholders.push(placeholder);
        Ok(placeholders.join(", "))
    }
}

/// System columns, then known columns in declaration order, then `_data`.
pub fn columns(schema: &ResolvedSchema) -> Vec<String> {
    let mut columns = vec![ID_FIELD.to_string(), CREATED_AT_FIELD.to_string(), UPDATED_AT_FIELD.to_string()];
    columns.extend(schema.known_columns().map(|(name, _)| name.to_string()));
    columns.push(DATA_FIELD.to_string());
    columns
}

fn column_list(schema: &ResolvedSchema) -> String {
    columns(schema).iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
}

/// Binds per inserted row.
pub fn row_width(schema: &ResolvedSchema) -> usize {
    4 + schema.known_columns().count()
}

/// Splits the non-column keys of `doc` into blob keys to write and blob keys
/// to remove (those set to `null`).
fn blob_changes(schema: &ResolvedSchema, doc: &Document) -> (Map<String, Value>, Vec<String>) {
    let mut set = Map::new();
    let mut unset = Vec::new();
    for (key, value) in doc {
        if key == DATA_FIELD || schema.placement(key) != FieldPlacement::Dynamic {
            continue;
        }
        if value.is_null() {
            unset.push(key.clone());
        } else {
            set.insert(key.clone(), value.clone());
        }
    }
    (set, unset)
}

fn compare_value(column_type: ColumnType, value: &Value) -> Option<SqlValue> {
    match (column_type, value) {
        (ColumnType::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
        (ColumnType::Text, Value::Number(_) | Value::Bool(_)) => Some(SqlValue::Text(value.to_string())),
        (ColumnType::Real | ColumnType::Integer, Value::Number(n)) => match n.as_i64() {
            Some(i) if column_type == ColumnType::Integer => Some(SqlValue::Int(i)),
            _ => n.as_f64().map(SqlValue::Float),
        },
        (ColumnType::Boolean, Value::Bool(b)) => Some(SqlValue::Bool(*b)),
        _ => None,
    }
}

fn write_value(column_type: ColumnType, value: &Value) -> Option<SqlValue> {
    match (column_type, value) {
        (_, Value::Null) => Some(SqlValue::Null(column_type)),
        (ColumnType::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(SqlValue::Int),
        (ColumnType::Real, Value::Number(n)) => n.as_f64().map(SqlValue::Float),
        _ => compare_value(column_type, value),
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

pub fn select(dialect: Dialect, schema: &ResolvedSchema, filter: &Filter, options: &FindOptions) -> Result<Statement, DbError> {
    let mut b = SqlBuilder::new(dialect, schema);
    let sql = format!("SELECT {} FROM {}", column_list(schema), b.table());
    b.push(&sql);
    b.push_where(filter)?;
    b.push_order(&options.stable_sort());
    b.push_window(options.skip, options.limit);
    Ok(b.finish())
}

pub fn count(dialect: Dialect, schema: &ResolvedSchema, filter: &Filter) -> Result<Statement, DbError> {
    let mut b = SqlBuilder::new(dialect, schema);
    let sql = format!("SELECT COUNT(*) FROM {}", b.table());
    b.push(&sql);
    b.push_where(filter)?;
    Ok(b.finish())
}

pub fn exists(dialect: Dialect, schema: &ResolvedSchema, filter: &Filter) -> Result<Statement, DbError> {
    let mut b = SqlBuilder::new(dialect, schema);
    let sql = format!("SELECT \"{ID_FIELD}\" FROM {}", b.table());
    b.push(&sql);
    b.push_where(filter)?;
    b.push(" LIMIT 1");
    Ok(b.finish())
}

/// A multi-row INSERT. With `skip_conflicts`, conflicting rows are skipped
/// and the statement returns the `_id` of each row actually written.
pub fn insert(dialect: Dialect, schema: &ResolvedSchema, docs: &[Document], skip_conflicts: bool) -> Result<Statement, DbError> {
    let mut b = SqlBuilder::new(dialect, schema);
    let sql = format!("INSERT INTO {} ({}) VALUES ", b.table(), column_list(schema));
    b.push(&sql);
    for (i, doc) in docs.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        let row = b.row_placeholders(doc)?;
        b.push(&format!("({row})"));
    }
    if skip_conflicts {
        b.push(&format!(" ON CONFLICT DO NOTHING RETURNING \"{ID_FIELD}\""));
    }
    Ok(b.finish())
}

/// Updates the first match and returns it.
pub fn update_one(dialect: Dialect, schema: &ResolvedSchema, filter: &Filter, changes: &Document) -> Result<Statement, DbError> {
    let mut b = SqlBuilder::new(dialect, schema);
    let sql = format!("UPDATE {}", b.table());
    b.push(&sql);
    b.push_assignments(changes)?;
    b.push_first_match(filter)?;
    b.push(&format!(" RETURNING {}", column_list(schema)));
    Ok(b.finish())
}

pub fn update_many(dialect: Dialect, schema: &ResolvedSchema, filter: &Filter, changes: &Document) -> Result<Statement, DbError> {
    let mut b = SqlBuilder::new(dialect, schema);
    let sql = format!("UPDATE {}", b.table());
    b.push(&sql);
    b.push_assignments(changes)?;
    b.push_where(filter)?;
    Ok(b.finish())
}

pub fn delete_one(dialect: Dialect, schema: &ResolvedSchema, filter: &Filter) -> Result<Statement, DbError> {
    let mut b = SqlBuilder::new(dialect, schema);
    let sql = format!("DELETE FROM {}", b.table());
    b.push(&sql);
    b.push_first_match(filter)?;
    Ok(b.finish())
}

pub fn delete_many(dialect: Dialect, schema: &ResolvedSchema, filter: &Filter) -> Result<Statement, DbError> {
    let mut b = SqlBuilder::new(dialect, schema);
    let sql = format!("DELETE FROM {}", b.table());
    b.push(&sql);
    b.push_where(filter)?;
    Ok(b.finish())
}

/// Serializes Postgres upserts of the same key for the rest of the current
/// transaction. Must run inside one.
pub fn upsert_lock(table: &str, filter: &Filter) -> Statement {
    Statement::raw("SELECT pg_advisory_xact_lock(hashtext($1))")
        .with_bind(SqlValue::Text(format!("{table}:{}", filter.fingerprint())))
}

pub fn create_table(dialect: Dialect, schema: &ResolvedSchema) -> Statement {
    let mut columns = vec![
        format!("\"{ID_FIELD}\" TEXT PRIMARY KEY"),
        format!("\"{CREATED_AT_FIELD}\" TEXT"),
        format!("\"{UPDATED_AT_FIELD}\" TEXT"),
    ];
    columns.extend(
        schema
            .known_columns()
            .map(|(name, column_type)| format!("{} {}", quote(name), dialect.column_type(column_type))),
    );
    columns.push(format!(
        "\"{DATA_FIELD}\" {} NOT NULL DEFAULT {}",
        dialect.data_type(),
        dialect.empty_data()
    ));
    Statement::raw(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&schema.table),
        columns.join(", ")
    ))
}

pub fn add_column(dialect: Dialect, schema: &ResolvedSchema, name: &str, column_type: ColumnType) -> Statement {
    Statement::raw(format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote(&schema.table),
        quote(name),
        dialect.column_type(column_type)
    ))
}

/// Unique index for a declared field. Blob fields get an expression index.
pub fn unique_index(dialect: Dialect, schema: &ResolvedSchema, field: &str) -> Statement {
    let expr = match schema.placement(field) {
        FieldPlacement::Dynamic => format!("({})", dialect.dynamic_text(field)),
        _ => quote(field),
    };
    let mut name = format!("{}_{}_key", schema.table, field);
    name.truncate(63);
    Statement::raw(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({expr})",
        quote(&name),
        quote(&schema.table)
    ))
}

pub fn drop_table(table: &str) -> Statement {
    Statement::raw(format!("DROP TABLE IF EXISTS {}", quote(table)))
}

pub fn table_columns(dialect: Dialect, table: &str) -> Statement {
    Statement::raw(dialect.table_columns()).with_bind(SqlValue::Text(table.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionSchema, FieldDefinition};
    use core_types::FieldType;
    use serde_json::json;

    fn posts() -> ResolvedSchema {
        ResolvedSchema::resolve(
            &CollectionSchema::new("posts")
                .field(FieldDefinition::new("title", FieldType::String))
                .field(FieldDefinition::new("views", FieldType::Integer))
                .field(FieldDefinition::new("tags", FieldType::Array)),
        )
        .unwrap()
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn select_binds_in_text_order() {
        let filter = Filter::eq("title", "Hello").and(Filter::gt("meta.score", 3));
        let options = FindOptions::new().sort("views", SortDirection::Desc).skip(10).limit(5);
        let stmt = select(Dialect::Postgres, &posts(), &filter, &options).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"_id\", \"createdAt\", \"updatedAt\", \"title\", \"views\", \"_data\" FROM \"posts\" \
             WHERE (\"title\" = $1 AND (\"_data\" #> '{meta,score}') > $2) \
             ORDER BY \"views\" DESC NULLS LAST, \"_id\" ASC NULLS FIRST LIMIT $3 OFFSET $4"
        );
        assert_eq!(
            stmt.binds,
            vec![
                SqlValue::Text("Hello".into()),
                SqlValue::Json(json!(3)),
                SqlValue::Int(5),
                SqlValue::Int(10)
            ]
        );
    }

    #[test]
    fn sqlite_offset_without_limit() {
        let stmt = select(Dialect::Sqlite, &posts(), &Filter::All, &FindOptions::new().skip(2)).unwrap();
        assert!(stmt.sql.ends_with("LIMIT -1 OFFSET ?"));
        assert_eq!(stmt.binds, vec![SqlValue::Int(2)]);
    }

    #[test]
    fn membership_and_null_semantics() {
        let schema = posts();
        let empty = count(Dialect::Sqlite, &schema, &Filter::is_in("title", Vec::<Value>::new())).unwrap();
        assert!(empty.sql.ends_with("WHERE 1 = 0"));

        let ne = count(Dialect::Sqlite, &schema, &Filter::ne("views", 3)).unwrap();
        assert!(ne.sql.ends_with("WHERE (\"views\" IS NULL OR \"views\" <> ?)"));

        let missing = count(Dialect::Postgres, &schema, &Filter::eq("extra", Value::Null)).unwrap();
        assert!(missing.sql.contains("IS NULL OR (\"_data\" #> '{extra}') = 'null'::jsonb"));
    }

    #[test]
    fn incompatible_column_values_are_rejected() {
        let err = count(Dialect::Postgres, &posts(), &Filter::eq("views", "many")).unwrap_err();
        assert!(matches!(err, DbError::InvalidQuery(_)));
        let err = count(Dialect::Postgres, &posts(), &Filter::contains("views", "1")).unwrap_err();
        assert!(matches!(err, DbError::InvalidQuery(_)));
    }

    #[test]
    fn update_merges_blob_and_removes_nulls() {
        let changes = doc(json!({"title": "New", "tags": ["a"], "legacy": null, "updatedAt": "t2"}));
        let stmt = update_many(Dialect::Postgres, &posts(), &Filter::id("p1"), &changes).unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"posts\" SET \"title\" = $1, \"updatedAt\" = $2, \
             \"_data\" = ((COALESCE(\"_data\", '{}'::jsonb) - '{legacy,title}'::text[]) || $3) WHERE \"_id\" = $4"
        );

        let stmt = update_many(Dialect::Sqlite, &posts(), &Filter::id("p1"), &changes).unwrap();
        assert!(stmt.sql.contains(
            "\"_data\" = json_set(json_remove(COALESCE(\"_data\", '{}'), '$.legacy', '$.title'), '$.tags', json(?))"
        ));
        assert_eq!(stmt.binds[2], SqlValue::Text("[\"a\"]".into()));
    }

    #[test]
    fn insert_rows_split_columns_from_blob() {
        let docs = vec![
            doc(json!({"_id": "a", "createdAt": "t", "updatedAt": "t", "title": "A", "tags": ["x"]})),
            doc(json!({"_id": "b", "createdAt": "t", "updatedAt": "t", "views": 2})),
        ];
        let stmt = insert(Dialect::Sqlite, &posts(), &docs, true).unwrap();
        assert_eq!(stmt.binds.len(), 2 * row_width(&posts()));
        assert!(stmt.sql.ends_with("ON CONFLICT DO NOTHING RETURNING \"_id\""));
        assert_eq!(stmt.binds[4], SqlValue::Null(ColumnType::Integer));
        assert_eq!(stmt.binds[5], SqlValue::Text("{\"tags\":[\"x\"]}".into()));
    }

    #[test]
    fn ddl_covers_columns_and_unique_blob_fields() {
        let schema = ResolvedSchema::resolve(
            &CollectionSchema::new("users")
                .field(FieldDefinition::new("email", FieldType::String).unique())
                .field(FieldDefinition::new("profile", FieldType::Json).unique()),
        )
        .unwrap();
        let create = create_table(Dialect::Postgres, &schema);
        assert!(create.sql.contains("\"email\" TEXT"));
        assert!(create.sql.contains("\"_data\" JSONB NOT NULL DEFAULT '{}'::jsonb"));
        assert_eq!(
            unique_index(Dialect::Sqlite, &schema, "profile").sql,
            "CREATE UNIQUE INDEX IF NOT EXISTS \"users_profile_key\" ON \"users\" ((json_extract(\"_data\", '$.profile')))"
        );
    }

    #[test]
    fn upsert_lock_is_keyed_by_table_and_filter() {
        let a = upsert_lock("posts", &Filter::eq("slug", "home"));
        assert_eq!(a.sql, "SELECT pg_advisory_xact_lock(hashtext($1))");
        assert_eq!(a, upsert_lock("posts", &Filter::eq("slug", "home")));
        assert_ne!(a, upsert_lock("pages", &Filter::eq("slug", "home")));
        assert_ne!(a, upsert_lock("posts", &Filter::eq("slug", "about")));
    }
}
