//! Backend-neutral predicates.
//!
//! A [`Filter`] is built either with the constructor functions or parsed from
//! a MongoDB-style query document, then compiled by each backend into its
//! native query (a BSON filter or a parameterized SQL `WHERE` clause). The
//! same tree can be evaluated in memory with [`Filter::matches`].

use crate::error::DbError;
use core_types::Document;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum Filter {
    /// Matches every document.
    #[default]
    All,
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    /// Field presence; a field holding `null` counts as present.
    Exists(String, bool),
    /// Case-sensitive substring match on a string field.
    Contains(String, String),
    StartsWith(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::All
    }

    pub fn id(id: impl Into<String>) -> Self {
        Filter::Eq(core_types::ID_FIELD.to_string(), Value::String(id.into()))
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn not_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::NotIn(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Filter::Exists(field.into(), exists)
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains(field.into(), needle.into())
    }

    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Filter::StartsWith(field.into(), prefix.into())
    }

    pub fn between(field: impl Into<String>, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        let field = field.into();
        Filter::And(vec![Filter::Gte(field.clone(), low.into()), Filter::Lte(field, high.into())])
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::Or(mut a), Filter::Or(b)) => {
                a.extend(b);
                Filter::Or(a)
            }
            (Filter::Or(mut a), f) => {
                a.push(f);
                Filter::Or(a)
            }
            (a, b) => Filter::Or(vec![a, b]),
        }
    }

    /// Parses a MongoDB-style query document such as
    /// `{"status": "active", "age": {"$gte": 18}, "$or": [...]}`.
    ///
    /// `$regex` is accepted only for literal patterns (optionally anchored
    /// with `^`), which become `Contains`/`StartsWith`.
    pub fn parse(query: &Value) -> Result<Self, DbError> {
        match query {
            Value::Null => Ok(Filter::All),
            Value::Object(map) => parse_object(map),
            other => Err(DbError::InvalidQuery(format!("query must be an object, got {other}"))),
        }
    }

    /// Top-level equality constraints, used to seed the document created by
    /// an upsert that matched nothing.
    pub fn equality_fields(&self) -> Document {
        let mut fields = Document::new();
        self.collect_equalities(&mut fields);
        fields
    }

    fn collect_equalities(&self, fields: &mut Document) {
        match self {
            Filter::Eq(field, value) if !field.contains('.') => {
                fields.insert(field.clone(), value.clone());
            }
            Filter::And(filters) => filters.iter().for_each(|f| f.collect_equalities(fields)),
            _ => {}
        }
    }

    /// Every field name referenced by the filter.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::All => {}
            Filter::Eq(f, _)
            | Filter::Ne(f, _)
            | Filter::Gt(f, _)
            | Filter::Gte(f, _)
            | Filter::Lt(f, _)
            | Filter::Lte(f, _)
            | Filter::In(f, _)
            | Filter::NotIn(f, _)
            | Filter::Exists(f, _)
            | Filter::Contains(f, _)
            | Filter::StartsWith(f, _) => out.push(f),
            Filter::And(filters) | Filter::Or(filters) => filters.iter().for_each(|f| f.collect_fields(out)),
            Filter::Not(inner) => inner.collect_fields(out),
        }
    }

    /// Rejects field names that are not dot-separated identifiers.
    pub fn validate(&self) -> Result<(), DbError> {
        self.fields().into_iter().try_for_each(validate_field)
    }

    /// Hex SHA-256 of the filter tree, stable across processes.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_else(|_| format!("{self:?}").into_bytes());
        hex::encode(Sha256::digest(&bytes))
    }

    /// Evaluates the filter against a document in memory.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => values_equal(lookup(doc, field), value),
            Filter::Ne(field, value) => !values_equal(lookup(doc, field), value),
            Filter::Gt(field, value) => compare_field(doc, field, value) == Some(Ordering::Greater),
            Filter::Gte(field, value) => matches!(
                compare_field(doc, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(field, value) => compare_field(doc, field, value) == Some(Ordering::Less),
            Filter::Lte(field, value) => {
                matches!(compare_field(doc, field, value), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::In(field, values) => {
                let actual = lookup(doc, field);
                values.iter().any(|v| values_equal(actual, v))
            }
            Filter::NotIn(field, values) => {
                let actual = lookup(doc, field);
                !values.iter().any(|v| values_equal(actual, v))
            }
            Filter::Exists(field, expected) => lookup(doc, field).is_some() == *expected,
            Filter::Contains(field, needle) => {
                matches!(lookup(doc, field), Some(Value::String(s)) if s.contains(needle.as_str()))
            }
            Filter::StartsWith(field, prefix) => {
                matches!(lookup(doc, field), Some(Value::String(s)) if s.starts_with(prefix.as_str()))
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
        }
    }
}

fn parse_object(map: &Map<String, Value>) -> Result<Filter, DbError> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" => Filter::And(parse_list(key, value)?),
            "$or" => Filter::Or(parse_list(key, value)?),
            "$nor" => Filter::Not(Box::new(Filter::Or(parse_list(key, value)?))),
            op if op.starts_with('$') => {
                return Err(DbError::InvalidQuery(format!("unsupported top-level operator '{op}'")));
            }
            field => {
                validate_field(field)?;
                parse_condition(field, value)?
            }
        };
        clauses.push(clause);
    }
    Ok(match clauses.len() {
        0 => Filter::All,
        1 => clauses.remove(0),
        _ => Filter::And(clauses),
    })
}

fn parse_list(op: &str, value: &Value) -> Result<Vec<Filter>, DbError> {
    let Value::Array(items) = value else {
        return Err(DbError::InvalidQuery(format!("'{op}' expects an array")));
    };
    items.iter().map(Filter::parse).collect()
}

fn parse_condition(field: &str, value: &Value) -> Result<Filter, DbError> {
    let ops = match value {
        Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops,
        _ => return Ok(Filter::Eq(field.to_string(), value.clone())),
    };

    let f = || field.to_string();
    let mut clauses = Vec::with_capacity(ops.len());
    for (op, arg) in ops {
        let clause = match op.as_str() {
            "$eq" => Filter::Eq(f(), arg.clone()),
            "$ne" => Filter::Ne(f(), arg.clone()),
            "$gt" => Filter::Gt(f(), arg.clone()),
            "$gte" => Filter::Gte(f(), arg.clone()),
            "$lt" => Filter::Lt(f(), arg.clone()),
            "$lte" => Filter::Lte(f(), arg.clone()),
            "$in" => Filter::In(f(), expect_array(op, arg)?),
            "$nin" => Filter::NotIn(f(), expect_array(op, arg)?),
            "$exists" => Filter::Exists(f(), truthy(arg)),
            "$contains" => Filter::Contains(f(), expect_str(op, arg)?.to_string()),
            "$startsWith" => Filter::StartsWith(f(), expect_str(op, arg)?.to_string()),
            "$regex" => parse_literal_regex(field, expect_str(op, arg)?)?,
            "$not" => Filter::Not(Box::new(parse_condition(field, arg)?)),
            other => {
                return Err(DbError::InvalidQuery(format!("unsupported operator '{other}' on '{field}'")));
            }
        };
        clauses.push(clause);
    }
    Ok(if clauses.len() == 1 { clauses.remove(0) } else { Filter::And(clauses) })
}

fn expect_array(op: &str, arg: &Value) -> Result<Vec<Value>, DbError> {
    match arg {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(DbError::InvalidQuery(format!("'{op}' expects an array"))),
    }
}

fn expect_str<'a>(op: &str, arg: &'a Value) -> Result<&'a str, DbError> {
    arg.as_str()
        .ok_or_else(|| DbError::InvalidQuery(format!("'{op}' expects a string")))
}

fn truthy(arg: &Value) -> bool {
    match arg {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Null => false,
        _ => true,
    }
}

const REGEX_META: &[char] = &['.', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '\\', '$', '^'];

fn parse_literal_regex(field: &str, pattern: &str) -> Result<Filter, DbError> {
    let (anchored, body) = match pattern.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    if body.contains(REGEX_META) {
        return Err(DbError::InvalidQuery(format!(
            "only literal $regex patterns are supported, got '{pattern}'"
        )));
    }
    Ok(if anchored {
        Filter::StartsWith(field.to_string(), body.to_string())
    } else {
        Filter::Contains(field.to_string(), body.to_string())
    })
}

/// A field name is one or more identifiers (`[A-Za-z_][A-Za-z0-9_]*`)
/// joined by dots.
pub fn validate_field(name: &str) -> Result<(), DbError> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidQuery(format!("invalid field name '{name}'")))
    }
}

/// Resolves a dotted path inside a document.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) | (Some(Value::Null), Value::Null) => true,
        (None, _) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
    }
}

fn compare_field(doc: &Document, field: &str, value: &Value) -> Option<Ordering> {
    compare_values(lookup(doc, field)?, value)
}

/// Orders two scalars of the same kind; mixed kinds are incomparable.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order used for in-memory sorting: missing and `null` sort first,
/// then booleans, numbers and strings; incomparable values keep their order.
pub(crate) fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(Value::Object(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Bool(_)) => 5,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parses_mongo_style_queries() {
        let filter = Filter::parse(&json!({
            "status": "active",
            "age": {"$gte": 18, "$lt": 65},
            "$or": [{"role": "admin"}, {"role": {"$in": ["editor", "author"]}}]
        }))
        .unwrap();

        let Filter::And(clauses) = &filter else { panic!("expected And, got {filter:?}") };
        assert_eq!(clauses.len(), 3);
        assert!(clauses.contains(&Filter::eq("status", "active")));
        assert!(clauses.contains(&Filter::And(vec![Filter::gte("age", 18), Filter::lt("age", 65)])));
    }

    #[test]
    fn empty_and_null_queries_match_everything() {
        assert_eq!(Filter::parse(&json!({})).unwrap(), Filter::All);
        assert_eq!(Filter::parse(&Value::Null).unwrap(), Filter::All);
        assert!(Filter::parse(&json!([1, 2])).is_err());
    }

    #[test]
    fn rejects_unsafe_field_names_and_unknown_operators() {
        assert!(Filter::parse(&json!({"name; DROP TABLE x": 1})).is_err());
        assert!(Filter::parse(&json!({"a..b": 1})).is_err());
        assert!(Filter::parse(&json!({"age": {"$where": "1"}})).is_err());
        assert!(Filter::parse(&json!({"$where": "1"})).is_err());
        assert!(Filter::eq("bad-name", 1).validate().is_err());
        assert!(Filter::eq("meta.tags_1", 1).validate().is_ok());
    }

    #[test]
    fn literal_regex_becomes_substring_match() {
        assert_eq!(
            Filter::parse(&json!({"slug": {"$regex": "^blog"}})).unwrap(),
            Filter::starts_with("slug", "blog")
        );
        assert_eq!(
            Filter::parse(&json!({"slug": {"$regex": "news"}})).unwrap(),
            Filter::contains("slug", "news")
        );
        assert!(Filter::parse(&json!({"slug": {"$regex": "a.*b"}})).is_err());
    }

    #[test]
    fn evaluates_in_memory() {
        let d = doc(json!({"name": "Ada", "age": 36, "meta": {"team": "core"}, "deleted": null}));

        assert!(Filter::eq("name", "Ada").matches(&d));
        assert!(Filter::eq("age", 36.0).matches(&d));
        assert!(Filter::gt("age", 30).matches(&d));
        assert!(!Filter::lt("age", 30).matches(&d));
        assert!(Filter::between("age", 30, 40).matches(&d));
        assert!(Filter::eq("meta.team", "core").matches(&d));
        assert!(Filter::eq("missing", Value::Null).matches(&d));
        assert!(Filter::eq("deleted", Value::Null).matches(&d));
        assert!(Filter::exists("deleted", true).matches(&d));
        assert!(Filter::exists("missing", false).matches(&d));
        assert!(Filter::ne("missing", "x").matches(&d));
        assert!(Filter::not_in("name", ["Bob"]).matches(&d));
        assert!(Filter::contains("name", "d").matches(&d));
        assert!(!Filter::contains("name", "D").matches(&d));
        assert!(Filter::starts_with("name", "Ad").matches(&d));
        assert!(!Filter::gt("name", 3).matches(&d));
        assert!(Filter::eq("name", "Bob").or(Filter::gte("age", 36)).matches(&d));
        assert!(Filter::eq("name", "Bob").negate().matches(&d));
    }

    #[test]
    fn and_flattens() {
        let f = Filter::All.and(Filter::eq("a", 1)).and(Filter::eq("b", 2)).and(Filter::All);
        assert_eq!(f, Filter::And(vec![Filter::eq("a", 1), Filter::eq("b", 2)]));
    }

    #[test]
    fn equality_fields_seed_upserts() {
        let f = Filter::parse(&json!({"slug": "home", "locale": "en", "views": {"$gt": 1}, "a.b": 1})).unwrap();
        let fields = f.equality_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["slug"], json!("home"));
        assert_eq!(fields["locale"], json!("en"));
    }

    #[test]
    fn fingerprint_is_stable_per_filter() {
        let a = Filter::eq("status", "active");
        assert_eq!(a.fingerprint(), Filter::eq("status", "active").fingerprint());
        assert_ne!(a.fingerprint(), Filter::eq("status", "draft").fingerprint());
    }

    #[test]
    fn sort_order_puts_missing_first() {
        assert_eq!(sort_order(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(sort_order(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(sort_order(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
    }
}
