//! Aggregation pipelines.
//!
//! MongoDB runs a pipeline natively. The relational backends push the leading
//! `$match`/`$sort`/`$skip`/`$limit` prefix into SQL and evaluate the
//! remaining stages here, over the fetched documents.

use crate::error::DbError;
use crate::filter::{Filter, compare_values, lookup, validate_field};
use crate::query::{FindOptions, project, sort_documents};
use core_types::{Document, ID_FIELD, SortDirection};
use serde_json::{Map, Number, Value, json};

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<(String, SortDirection)>),
    Skip(u64),
    Limit(u64),
    Project(Vec<String>),
    Group {
        /// Field whose value keys the groups; `None` puts everything in one group.
        by: Option<String>,
        accumulators: Vec<(String, Accumulator)>,
    },
    /// Replaces the stream with a single `{<name>: count}` document.
    Count(String),
    /// A backend-native stage passed through verbatim (MongoDB only).
    Raw(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// `$sum: 1` counts; `$sum: "$field"` adds numeric values.
    Sum(Operand),
    Avg(String),
    Min(String),
    Max(String),
    First(String),
    Push(String),
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Constant(f64),
}

impl Stage {
    /// Parses a MongoDB-style pipeline (`[{"$match": {...}}, {"$group": {...}}]`).
    /// Stages other than the ones modeled here are kept as [`Stage::Raw`].
    pub fn parse_pipeline(pipeline: &Value) -> Result<Vec<Stage>, DbError> {
        let Value::Array(stages) = pipeline else {
            return Err(DbError::InvalidQuery("pipeline must be an array of stages".into()));
        };
        stages.iter().map(Stage::parse).collect()
    }

    pub fn parse(stage: &Value) -> Result<Stage, DbError> {
        let Some((name, arg)) = stage.as_object().filter(|m| m.len() == 1).and_then(|m| m.iter().next()) else {
            return Err(DbError::InvalidQuery(format!("stage must have exactly one operator: {stage}")));
        };
        Ok(match name.as_str() {
            "$match" => Stage::Match(Filter::parse(arg)?),
            "$sort" => Stage::Sort(parse_sort(arg)?),
            "$skip" => Stage::Skip(expect_u64(name, arg)?),
            "$limit" => Stage::Limit(expect_u64(name, arg)?),
            "$project" => Stage::Project(parse_projection(arg)?),
            "$group" => parse_group(arg)?,
            "$count" => Stage::Count(
                arg.as_str()
                    .ok_or_else(|| DbError::InvalidQuery("$count expects a field name".into()))?
                    .to_string(),
            ),
            _ => Stage::Raw(stage.clone()),
        })
    }

    /// The MongoDB representation of the stage.
    pub fn to_json(&self) -> Value {
        match self {
            Stage::Match(filter) => json!({ "$match": filter_to_json(filter) }),
            Stage::Sort(sort) => {
                let body: Map<String, Value> = sort
                    .iter()
                    .map(|(f, d)| (f.clone(), Value::from(d.as_i32())))
                    .collect();
                json!({ "$sort": body })
            }
            Stage::Skip(n) => json!({ "$skip": n }),
            Stage::Limit(n) => json!({ "$limit": n }),
            Stage::Project(fields) => {
                let body: Map<String, Value> = fields.iter().map(|f| (f.clone(), Value::from(1))).collect();
                json!({ "$project": body })
            }
            Stage::Group { by, accumulators } => {
                let mut body = Map::new();
                body.insert(
                    ID_FIELD.to_string(),
                    by.as_ref().map_or(Value::Null, |f| Value::String(format!("${f}"))),
                );
                for (name, acc) in accumulators {
                    body.insert(name.clone(), acc.to_json());
                }
                json!({ "$group": body })
            }
            Stage::Count(name) => json!({ "$count": name }),
            Stage::Raw(raw) => raw.clone(),
        }
    }
}

impl Accumulator {
    fn to_json(&self) -> Value {
        let field = |f: &String| Value::String(format!("${f}"));
        match self {
            Accumulator::Sum(Operand::Field(f)) => json!({ "$sum": field(f) }),
            Accumulator::Sum(Operand::Constant(c)) => json!({ "$sum": c }),
            Accumulator::Avg(f) => json!({ "$avg": field(f) }),
            Accumulator::Min(f) => json!({ "$min": field(f) }),
            Accumulator::Max(f) => json!({ "$max": field(f) }),
            Accumulator::First(f) => json!({ "$first": field(f) }),
            Accumulator::Push(f) => json!({ "$push": field(f) }),
            Accumulator::Count => json!({ "$count": {} }),
        }
    }
}

fn parse_sort(arg: &Value) -> Result<Vec<(String, SortDirection)>, DbError> {
    let Value::Object(body) = arg else {
        return Err(DbError::InvalidQuery("$sort expects an object".into()));
    };
    body.iter()
        .map(|(field, dir)| {
            validate_field(field)?;
            let direction = dir
                .as_i64()
                .and_then(SortDirection::from_i64)
                .ok_or_else(|| DbError::InvalidQuery(format!("invalid sort direction for '{field}'")))?;
            Ok((field.clone(), direction))
        })
        .collect()
}

fn parse_projection(arg: &Value) -> Result<Vec<String>, DbError> {
    let Value::Object(body) = arg else {
        return Err(DbError::InvalidQuery("$project expects an object".into()));
    };
    let mut fields = Vec::new();
    for (field, include) in body {
        validate_field(field)?;
        let included = match include {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => return Err(DbError::InvalidQuery(format!("computed projection of '{field}' is not supported"))),
        };
        if included {
            fields.push(field.clone());
        } else if field != ID_FIELD {
            return Err(DbError::InvalidQuery("exclusion projections are not supported".into()));
        }
    }
    Ok(fields)
}

fn parse_group(arg: &Value) -> Result<Stage, DbError> {
    let Value::Object(body) = arg else {
        return Err(DbError::InvalidQuery("$group expects an object".into()));
    };
    let by = match body.get(ID_FIELD) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(field_ref(s)?),
        Some(other) => return Err(DbError::InvalidQuery(format!("unsupported group key {other}"))),
    };

    let mut accumulators = Vec::new();
    for (name, acc) in body.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
        let Some((op, operand)) = acc.as_object().filter(|m| m.len() == 1).and_then(|m| m.iter().next()) else {
            return Err(DbError::InvalidQuery(format!("accumulator '{name}' must have one operator")));
        };
        let field = || {
            operand
                .as_str()
                .ok_or_else(|| DbError::InvalidQuery(format!("'{op}' expects a \"$field\"")))
                .and_then(field_ref)
        };
        let accumulator = match op.as_str() {
            "$sum" => match operand {
                Value::Number(n) => Accumulator::Sum(Operand::Constant(n.as_f64().unwrap_or(0.0))),
                _ => Accumulator::Sum(Operand::Field(field()?)),
            },
            "$avg" => Accumulator::Avg(field()?),
            "$min" => Accumulator::Min(field()?),
            "$max" => Accumulator::Max(field()?),
            "$first" => Accumulator::First(field()?),
            "$push" => Accumulator::Push(field()?),
            "$count" => Accumulator::Count,
            other => return Err(DbError::InvalidQuery(format!("unsupported accumulator '{other}'"))),
        };
        accumulators.push((name.clone(), accumulator));
    }
    Ok(Stage::Group { by, accumulators })
}

fn field_ref(value: &str) -> Result<String, DbError> {
    let field = value
        .strip_prefix('$')
        .ok_or_else(|| DbError::InvalidQuery(format!("expected a field reference, got '{value}'")))?;
    validate_field(field)?;
    Ok(field.to_string())
}

fn expect_u64(name: &str, arg: &Value) -> Result<u64, DbError> {
    arg.as_u64()
        .ok_or_else(|| DbError::InvalidQuery(format!("'{name}' expects a non-negative integer")))
}

/// Renders a filter back into a MongoDB query document.
pub fn filter_to_json(filter: &Filter) -> Value {
    fn op(field: &str, op: &str, value: Value) -> Value {
        json!({ field: { op: value } })
    }
    match filter {
        Filter::All => json!({}),
        Filter::Eq(f, v) => op(f, "$eq", v.clone()),
        Filter::Ne(f, v) => op(f, "$ne", v.clone()),
        Filter::Gt(f, v) => op(f, "$gt", v.clone()),
        Filter::Gte(f, v) => op(f, "$gte", v.clone()),
        Filter::Lt(f, v) => op(f, "$lt", v.clone()),
        Filter::Lte(f, v) => op(f, "$lte", v.clone()),
        Filter::In(f, vs) => op(f, "$in", Value::Array(vs.clone())),
        Filter::NotIn(f, vs) => op(f, "$nin", Value::Array(vs.clone())),
        Filter::Exists(f, b) => op(f, "$exists", Value::Bool(*b)),
        Filter::Contains(f, s) => op(f, "$regex", Value::String(escape_regex(s))),
        Filter::StartsWith(f, s) => op(f, "$regex", Value::String(format!("^{}", escape_regex(s)))),
        Filter::And(filters) if filters.is_empty() => json!({}),
        Filter::And(filters) => json!({ "$and": filters.iter().map(filter_to_json).collect::<Vec<_>>() }),
        // Every stored document has an `_id`, so this matches nothing.
        Filter::Or(filters) if filters.is_empty() => json!({ ID_FIELD: { "$exists": false } }),
        Filter::Or(filters) => json!({ "$or": filters.iter().map(filter_to_json).collect::<Vec<_>>() }),
        Filter::Not(inner) => json!({ "$nor": [filter_to_json(inner)] }),
    }
}

fn escape_regex(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if ".*+?()[]{}|\\$^".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Splits off the prefix a relational backend can run in SQL: any number of
/// `Match` stages, then at most one each of `Sort`, `Skip` and `Limit`, in
/// that order.
pub(crate) fn split_pushdown(stages: &[Stage]) -> (Filter, FindOptions, &[Stage]) {
    let mut filter = Filter::All;
    let mut options = FindOptions::default();
    let mut index = 0;

    while let Some(Stage::Match(f)) = stages.get(index) {
        filter = filter.and(f.clone());
        index += 1;
    }
    if let Some(Stage::Sort(sort)) = stages.get(index) {
        options.sort = sort.clone();
        index += 1;
    }
    if let Some(Stage::Skip(n)) = stages.get(index) {
        options.skip = Some(*n);
        index += 1;
    }
    if let Some(Stage::Limit(n)) = stages.get(index) {
        options.limit = Some(*n);
        index += 1;
    }
    (filter, options, &stages[index..])
}

/// Evaluates stages over documents in memory.
pub(crate) fn run_in_memory(mut docs: Vec<Document>, stages: &[Stage]) -> Result<Vec<Document>, DbError> {
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            Stage::Sort(sort) => {
                sort_documents(&mut docs, sort);
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(*n as usize).collect(),
            Stage::Limit(n) => docs.into_iter().take(*n as usize).collect(),
            Stage::Project(fields) => docs.into_iter().map(|d| project(d, fields)).collect(),
            Stage::Group { by, accumulators } => group(docs, by.as_deref(), accumulators),
            Stage::Count(name) => {
                let mut out = Document::new();
                out.insert(name.clone(), Value::from(docs.len() as u64));
                if docs.is_empty() { Vec::new() } else { vec![out] }
            }
            Stage::Raw(raw) => {
                return Err(DbError::NotImplemented(format!("aggregation stage {raw}")));
            }
        };
    }
    Ok(docs)
}

fn group(docs: Vec<Document>, by: Option<&str>, accumulators: &[(String, Accumulator)]) -> Vec<Document> {
    // Groups keep first-appearance order.
    let mut groups: Vec<(Value, Vec<Document>)> = Vec::new();
    for doc in docs {
        let key = by.and_then(|f| lookup(&doc, f).cloned()).unwrap_or(Value::Null);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut out = Document::new();
            out.insert(ID_FIELD.to_string(), key);
            for (name, acc) in accumulators {
                out.insert(name.clone(), accumulate(acc, &members));
            }
            out
        })
        .collect()
}

fn present<'a>(members: &'a [Document], field: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    members
        .iter()
        .filter_map(move |d| lookup(d, field))
        .filter(|v| !v.is_null())
}

fn accumulate(acc: &Accumulator, members: &[Document]) -> Value {
    match acc {
        Accumulator::Count => Value::from(members.len() as u64),
        Accumulator::Sum(Operand::Constant(c)) => number(c * members.len() as f64),
        Accumulator::Sum(Operand::Field(f)) => number(present(members, f).filter_map(Value::as_f64).sum()),
        Accumulator::Avg(f) => {
            let nums: Vec<f64> = present(members, f).filter_map(Value::as_f64).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                number(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        Accumulator::Min(f) => present(members, f)
            .min_by(|a, b| compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal))
            .cloned()
            .unwrap_or(Value::Null),
        Accumulator::Max(f) => present(members, f)
            .max_by(|a, b| compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal))
            .cloned()
            .unwrap_or(Value::Null),
        Accumulator::First(f) => members
            .first()
            .and_then(|d| lookup(d, f).cloned())
            .unwrap_or(Value::Null),
        Accumulator::Push(f) => Value::Array(present(members, f).cloned().collect()),
    }
}

/// Integral results are emitted as integers so they decode into integer fields.
pub(crate) fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}
