use crate::filter::{lookup, sort_order, validate_field};
use crate::error::DbError;
use core_types::{Document, ID_FIELD, SortDirection};
use serde::Serialize;
use std::cmp::Ordering;

/// Sort, window and projection for a `find`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FindOptions {
    pub sort: Vec<(String, SortDirection)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    /// Fields to return; `_id` is always included. `None` returns everything.
    pub projection: Option<Vec<String>>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
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

    pub fn validate(&self) -> Result<(), DbError> {
        self.sort.iter().try_for_each(|(field, _)| validate_field(field))?;
        if let Some(fields) = &self.projection {
            fields.iter().try_for_each(|f| validate_field(f))?;
        }
        Ok(())
    }

    /// The sort with an `_id` tie-breaker appended, so pagination is stable.
    pub(crate) fn stable_sort(&self) -> Vec<(String, SortDirection)> {
        let mut sort = self.sort.clone();
        if !sort.iter().any(|(field, _)| field == ID_FIELD) {
            sort.push((ID_FIELD.to_string(), SortDirection::Asc));
        }
        sort
    }
}

pub(crate) fn sort_documents(docs: &mut [Document], sort: &[(String, SortDirection)]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (field, direction) in sort {
            let ordering = sort_order(lookup(a, field), lookup(b, field));
            let ordering = match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Keeps only the listed top-level fields plus `_id`.
pub(crate) fn project(doc: Document, fields: &[String]) -> Document {
    doc.into_iter()
        .filter(|(key, _)| {
            key == ID_FIELD
                || fields
                    .iter()
                    .any(|f| f == key || f.split('.').next() == Some(key.as_str()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<Document> {
        [
            json!({"_id": "a", "rank": 3, "name": "x"}),
            json!({"_id": "b", "rank": 1, "name": "y"}),
            json!({"_id": "c", "name": "z"}),
            json!({"_id": "d", "rank": 2, "name": "w"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d["_id"].as_str().unwrap()).collect()
    }

    #[test]
    fn sorts_descending_and_projects() {
        let mut out = docs();
        sort_documents(&mut out, &[("rank".to_string(), SortDirection::Desc)]);
        assert_eq!(ids(&out), vec!["a", "d", "b", "c"]);
        let projected = project(out.remove(0), &["rank".to_string()]);
        assert_eq!(projected, json!({"_id": "a", "rank": 3}).as_object().cloned().unwrap());
    }

    #[test]
    fn missing_values_sort_first_ascending() {
        let mut out = docs();
        sort_documents(&mut out, &FindOptions::new().sort("rank", SortDirection::Asc).sort);
        assert_eq!(ids(&out), vec!["c", "b", "d", "a"]);
    }

    #[test]
    fn stable_sort_appends_id() {
        let options = FindOptions::new().sort("rank", SortDirection::Asc);
        assert_eq!(options.stable_sort().last().unwrap().0, "_id");
        let by_id = FindOptions::new().sort("_id", SortDirection::Desc);
        assert_eq!(by_id.stable_sort().len(), 1);
    }

    #[test]
    fn rejects_invalid_sort_fields() {
        assert!(FindOptions::new().sort("rank desc", SortDirection::Asc).validate().is_err());
        assert!(FindOptions::new().select(["a;b"]).validate().is_err());
    }
}
