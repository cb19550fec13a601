//! Fluent, single-use query construction.
//!
//! Chained calls only accumulate state. Terminal methods take `self`, so a
//! builder cannot be reused once it has run.

use crate::error::DbError;
use crate::filter::{Filter, lookup};
use crate::query::{FindOptions, project};
use crate::repository::{BulkWriteResult, Repository};
use core_types::{DatabaseError, DatabaseResult, ErrorCode, ID_FIELD, SortDirection};
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    /// Only computed when requested with `include_total_count(true)`.
    pub total_count: Option<u64>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    /// Pass to [`QueryBuilder::after`] to fetch the following page.
    pub next_cursor: Option<String>,
}

/// Position after the last item of a page: its primary sort value and `_id`.
#[derive(Debug, Clone, PartialEq)]
struct Cursor {
    value: Value,
    id: Value,
}

impl Cursor {
    fn encode(&self) -> String {
        hex::encode(json!([self.value, self.id]).to_string())
    }

    fn decode(token: &str) -> Result<Self, DbError> {
        let invalid = || DbError::InvalidQuery(format!("invalid cursor '{token}'"));
        let bytes = hex::decode(token).map_err(|_| invalid())?;
        match serde_json::from_slice::<Value>(&bytes).map_err(|_| invalid())? {
            Value::Array(mut parts) if parts.len() == 2 => {
                let id = parts.pop().unwrap_or_default();
                let value = parts.pop().unwrap_or_default();
                Ok(Self { value, id })
            }
            _ => Err(invalid()),
        }
    }

    /// Keyset predicate for "strictly after this cursor" under the given
    /// primary sort, with `_id` ascending as tie-breaker. Missing values sort
    /// first ascending and last descending.
    fn after(&self, field: &str, direction: SortDirection) -> Filter {
        let id_after = Filter::gt(ID_FIELD, self.id.clone());
        if field == ID_FIELD {
            return match direction {
                SortDirection::Asc => id_after,
                SortDirection::Desc => Filter::lt(ID_FIELD, self.id.clone()),
            };
        }
        let is_null = Filter::eq(field, Value::Null);
        let not_null = Filter::ne(field, Value::Null);
        match (direction, self.value.is_null()) {
            (SortDirection::Asc, true) => is_null.and(id_after).or(not_null),
            (SortDirection::Asc, false) => Filter::gt(field, self.value.clone())
                .or(Filter::eq(field, self.value.clone()).and(id_after)),
            (SortDirection::Desc, true) => is_null.and(id_after),
            (SortDirection::Desc, false) => Filter::lt(field, self.value.clone())
                .or(Filter::eq(field, self.value.clone()).and(id_after))
                .or(is_null),
        }
    }
}

pub struct QueryBuilder<T> {
    repository: Repository<T>,
    filters: Vec<Filter>,
    sort: Vec<(String, SortDirection)>,
    page: Option<(u64, u64)>,
    limit: Option<u64>,
    cursor: Option<String>,
    projection: Option<Vec<String>>,
    include_total_count: bool,
    /// A chained call that could not be applied; reported by the terminal.
    error: Option<DbError>,
}

impl<T> QueryBuilder<T>
where
    T: DeserializeOwned + Send + Sync,
{
    pub fn new(repository: Repository<T>) -> Self {
        Self {
            repository,
            filters: Vec::new(),
            sort: Vec::new(),
            page: None,
            limit: None,
            cursor: None,
            projection: None,
            include_total_count: false,
            error: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(field, value));
        self
    }

    pub fn where_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds a MongoDB-style query document.
    pub fn where_query(mut self, query: &Value) -> Self {
        match Filter::parse(query) {
            Ok(filter) => self.filters.push(filter),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn where_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.filters.push(Filter::is_in(field, values));
        self
    }

    /// Inclusive on both ends.
    pub fn where_between(mut self, field: impl Into<String>, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        self.filters.push(Filter::between(field, low, high));
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    /// Offset pagination; `page` is 1-based.
    pub fn paginate(mut self, page: u64, page_size: u64) -> Self {
        self.page = Some((page.max(1), page_size.max(1)));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Cursor pagination: continue after a page's `next_cursor`.
    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn include_total_count(mut self, include: bool) -> Self {
        self.include_total_count = include;
        self
    }

    fn query_error(&self, err: DbError) -> DatabaseError {
        err.into_database_error(ErrorCode::QUERY_ERROR, format!("query on '{}'", self.repository.collection()))
    }

    /// The accumulated filter without the cursor condition.
    fn base_filter(&mut self) -> DatabaseResult<Filter> {
        if let Some(e) = self.error.take() {
            return Err(self.query_error(e));
        }
        let filter = std::mem::take(&mut self.filters)
            .into_iter()
            .fold(Filter::All, Filter::and);
        filter.validate().map_err(|e| self.query_error(e))?;
        Ok(filter)
    }

    fn primary_sort(&self) -> (String, SortDirection) {
        self.sort
            .first()
            .cloned()
            .unwrap_or_else(|| (ID_FIELD.to_string(), SortDirection::Asc))
    }

    fn page_size(&self) -> Option<u64> {
        self.page.map(|(_, size)| size).or(self.limit)
    }

    pub async fn execute(mut self) -> DatabaseResult<PaginatedResult<T>> {
        let repository = self.repository.clone();
        repository.observe("query_execute", async move {
            let base = self.base_filter()?;
            let (sort_field, sort_direction) = self.primary_sort();
            let filter = match &self.cursor {
                Some(token) => {
                    let cursor = Cursor::decode(token).map_err(|e| self.query_error(e))?;
                    base.clone().and(cursor.after(&sort_field, sort_direction))
                }
                None => base.clone(),
            };

            let page_size = self.page_size();
            let skip = match (self.page, &self.cursor) {
                (Some((page, size)), None) => (page - 1) * size,
                _ => 0,
            };
            let options = FindOptions {
                sort: self.sort.clone(),
                skip: (skip > 0).then_some(skip),
                limit: page_size.map(|size| size + 1),
                projection: None,
            };
            options.validate().map_err(|e| self.query_error(e))?;
            if let Some(fields) = &self.projection {
                FindOptions::new()
                    .select(fields.iter().cloned())
                    .validate()
                    .map_err(|e| self.query_error(e))?;
            }

            let mut documents = self
                .repository
                .find_documents(&filter, &options)
                .await
                .map_err(self.repository.fail(ErrorCode::FIND_MANY_ERROR, "query"))?;

            let has_next_page = page_size.is_some_and(|size| documents.len() as u64 > size);
            if let Some(size) = page_size {
                documents.truncate(size as usize);
            }
            let next_cursor = documents.last().filter(|_| has_next_page).map(|last| {
                Cursor {
                    value: lookup(last, &sort_field).cloned().unwrap_or(Value::Null),
                    id: last.get(ID_FIELD).cloned().unwrap_or(Value::Null),
                }
                .encode()
            });

            let total_count = if self.include_total_count {
                Some(
                    self.repository
                        .count_documents(&base)
                        .await
                        .map_err(self.repository.fail(ErrorCode::COUNT_ERROR, "query count"))?,
                )
            } else {
                None
            };

            if let Some(fields) = &self.projection {
                documents = documents.into_iter().map(|d| project(d, fields)).collect();
            }
            Ok(PaginatedResult {
                items: self.repository.decode_all(documents)?,
                total_count,
                page: self.page.map(|(page, _)| page),
                page_size,
                has_next_page,
                has_previous_page: skip > 0 || self.cursor.is_some(),
                next_cursor,
            })
        })
        .await
    }

    pub async fn find_one(self) -> DatabaseResult<Option<T>> {
        let result = self.limit(1).execute().await?;
        Ok(result.items.into_iter().next())
    }

    pub async fn count(mut self) -> DatabaseResult<u64> {
        let filter = self.base_filter()?;
        self.repository.count(&filter).await
    }

    pub async fn update_many<D: Serialize + ?Sized>(mut self, changes: &D) -> DatabaseResult<BulkWriteResult> {
        let filter = self.base_filter()?;
        self.repository.update_many(&filter, changes).await
    }

    pub async fn delete_many(mut self) -> DatabaseResult<u64> {
        let filter = self.base_filter()?;
        self.repository.delete_many(&filter).await
    }

    /// A lazy, forward-only sequence fetched `batch_size` records at a time.
    /// Batches are read live (not from the cache) by offset, so concurrent
    /// writes can shift records between batches. The first error ends the
    /// stream.
    pub fn stream(mut self, batch_size: u64) -> impl Stream<Item = DatabaseResult<T>> + Send + 'static
    where
        T: 'static,
    {
        struct State<T> {
            repository: Repository<T>,
            filter: Filter,
            options: FindOptions,
            offset: u64,
            remaining: Option<u64>,
            done: bool,
        }

        let batch_size = batch_size.max(1);
        let start = self.page.map_or(0, |(page, size)| (page - 1) * size);
        let remaining = self.page_size();
        let projection = self.projection.take();
        let initial = self.base_filter().map(|filter| State {
            repository: self.repository.clone(),
            filter,
            options: FindOptions {
                sort: self.sort.clone(),
                skip: None,
                limit: None,
                projection,
            },
            offset: start,
            remaining,
            done: false,
        });

        let batches = stream::unfold(Some(initial), move |state| async move {
            let mut state = match state? {
                Ok(state) if !state.done => state,
                Ok(_) => return None,
                Err(e) => return Some((vec![Err(e)], None)),
            };
            let take = state.remaining.map_or(batch_size, |r| r.min(batch_size));
            if take == 0 {
                return None;
            }
            let mut options = state.options.clone();
            options.skip = (state.offset > 0).then_some(state.offset);
            options.limit = Some(take);
            let fetched = state
                .repository
                .find_fresh(&state.filter, &options)
                .await
                .map_err(state.repository.fail(ErrorCode::STREAM_ERROR, "stream"));
            match fetched {
                Ok(documents) => {
                    let fetched = documents.len() as u64;
                    state.offset += fetched;
                    state.remaining = state.remaining.map(|r| r - fetched.min(r));
                    state.done = fetched < take;
                    let items: Vec<DatabaseResult<T>> =
                        documents.into_iter().map(|d| state.repository.decode(d)).collect();
                    if items.is_empty() {
                        return None;
                    }
                    Some((items, Some(Ok(state))))
                }
                Err(e) => Some((vec![Err(e)], None)),
            }
        });
        batches.flat_map(stream::iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Document;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn cursor_round_trips_through_hex() {
        let cursor = Cursor {
            value: json!(42),
            id: json!("abc"),
        };
        let token = cursor.encode();
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
        assert!(Cursor::decode("zz").is_err());
        assert!(Cursor::decode(&hex::encode("[1]")).is_err());
    }

    #[test]
    fn keyset_ascending_follows_sort_order() {
        let cursor = Cursor {
            value: json!(2),
            id: json!("b"),
        };
        let after = cursor.after("rank", SortDirection::Asc);
        assert!(after.matches(&doc(json!({"_id": "a", "rank": 3}))));
        assert!(after.matches(&doc(json!({"_id": "c", "rank": 2}))));
        assert!(!after.matches(&doc(json!({"_id": "a", "rank": 2}))));
        assert!(!after.matches(&doc(json!({"_id": "z", "rank": 1}))));
        assert!(!after.matches(&doc(json!({"_id": "z"}))));
    }

    #[test]
    fn keyset_descending_puts_missing_values_last() {
        let cursor = Cursor {
            value: json!(2),
            id: json!("b"),
        };
        let after = cursor.after("rank", SortDirection::Desc);
        assert!(after.matches(&doc(json!({"_id": "a", "rank": 1}))));
        assert!(after.matches(&doc(json!({"_id": "a"}))));
        assert!(!after.matches(&doc(json!({"_id": "a", "rank": 3}))));

        let null_cursor = Cursor {
            value: Value::Null,
            id: json!("m"),
        };
        let after_null = null_cursor.after("rank", SortDirection::Asc);
        assert!(after_null.matches(&doc(json!({"_id": "n"}))));
        assert!(after_null.matches(&doc(json!({"_id": "a", "rank": 0}))));
        assert!(!after_null.matches(&doc(json!({"_id": "a"}))));
    }
}
