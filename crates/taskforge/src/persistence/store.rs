//! DocumentStore trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Document not found
    #[error("document not found: {0}")]
    NotFound(String),

    /// Concurrency conflict (optimistic locking failed)
    #[error("version conflict on {id}: expected {expected}, found {actual:?}")]
    Conflict {
        id: String,
        expected: Version,
        actual: Option<Version>,
    },

    /// Backend unavailable or overloaded; safe to retry later
    #[error("transient store error: {0}")]
    Transient(String),

    /// Request rejected by the backend; retrying will not help
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the failed operation may succeed if attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Opaque optimistic-concurrency token
///
/// Every successful write returns a new version; callers must use it for
/// their next write to the same document.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A document body together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub id: String,
    pub body: Value,
    pub version: Version,
}

/// Structured filter over dotted JSON field paths
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document
    All,
    /// Field equals value
    Term { field: String, value: Value },
    /// Field equals one of the values
    Terms { field: String, values: Vec<Value> },
    /// Field within bounds (inclusive); numbers compare numerically, strings lexically
    Range {
        field: String,
        gte: Option<Value>,
        lte: Option<Value>,
    },
    /// Field present and not null
    Exists { field: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn terms<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::Terms {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Range {
            field: field.into(),
            gte: None,
            lte: Some(value.into()),
        }
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Range {
            field: field.into(),
            gte: Some(value.into()),
            lte: None,
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    pub fn negate(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort clause
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// A search request
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub filter: Filter,
    pub sort: Vec<SortField>,
    pub size: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            filter: Filter::All,
            sort: vec![],
            size: 100,
        }
    }
}

impl SearchQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn with_sort(mut self, sort: SortField) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

/// One page of search results
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub documents: Vec<VersionedDocument>,
    /// Total number of matching documents (may exceed `documents.len()`)
    pub total: usize,
}

/// One item of a bulk update
#[derive(Debug, Clone)]
pub struct BulkUpdateItem {
    pub id: String,
    pub body: Value,
    pub expected_version: Version,
}

/// Per-item outcome of a bulk update
#[derive(Debug, Clone)]
pub struct BulkItemResult {
    pub id: String,
    pub result: Result<Version, StoreError>,
}

/// Versioned document store
///
/// All mutating calls take the version read at the most recent fetch; a
/// mismatch yields [`StoreError::Conflict`] and the document is left
/// untouched. Implementations must be thread-safe; correctness across
/// processes relies only on these version checks.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Create a document; fails with `Conflict` if the id already exists
    async fn create(&self, id: &str, body: Value) -> Result<Version, StoreError>;

    /// Fetch a document and its current version
    async fn get(&self, id: &str) -> Result<VersionedDocument, StoreError>;

    /// Replace a document if its version still matches
    async fn update(
        &self,
        id: &str,
        body: Value,
        expected_version: Version,
    ) -> Result<Version, StoreError>;

    /// Update many documents; one item failing does not affect the others
    async fn bulk_update(
        &self,
        items: Vec<BulkUpdateItem>,
    ) -> Result<Vec<BulkItemResult>, StoreError> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = self.update(&item.id, item.body, item.expected_version).await;
            results.push(BulkItemResult {
                id: item.id,
                result,
            });
        }
        Ok(results)
    }

    /// Delete a document, optionally only if its version still matches
    async fn delete(&self, id: &str, expected_version: Option<Version>) -> Result<(), StoreError>;

    /// Search documents
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, StoreError>;

    /// Count documents matching a filter
    async fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        let page = self
            .search(&SearchQuery::new(filter.clone()).with_size(0))
            .await?;
        Ok(page.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(StoreError::Transient("unavailable".into()).is_retryable());
        assert!(!StoreError::Validation("bad".into()).is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());

        let conflict = StoreError::Conflict {
            id: "a".into(),
            expected: Version(1),
            actual: Some(Version(2)),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn test_query_builder() {
        let query = SearchQuery::new(Filter::term("status", "idle"))
            .with_sort(SortField::asc("run_at"))
            .with_size(5);

        assert_eq!(query.size, 5);
        assert_eq!(query.sort[0].order, SortOrder::Asc);
        assert!(matches!(query.filter, Filter::Term { .. }));
    }
}
