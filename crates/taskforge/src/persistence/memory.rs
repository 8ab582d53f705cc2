//! In-memory implementation of DocumentStore for testing

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::store::*;

/// Internal document state
struct StoredDocument {
    body: Value,
    version: Version,
}

/// In-memory implementation of DocumentStore
///
/// Provides the same optimistic-concurrency semantics a remote backend
/// would: every write bumps the version and writes carrying a stale
/// version are rejected. Several task managers sharing one instance
/// behave like independent processes sharing one index.
///
/// # Example
///
/// ```
/// use taskforge::InMemoryDocumentStore;
///
/// let store = InMemoryDocumentStore::new();
/// assert_eq!(store.len(), 0);
/// ```
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
    version_counter: AtomicU64,
    failing_searches: AtomicUsize,
    failing_updates: AtomicUsize,
}

impl InMemoryDocumentStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            version_counter: AtomicU64::new(0),
            failing_searches: AtomicUsize::new(0),
            failing_updates: AtomicUsize::new(0),
        }
    }

    /// Get the number of stored documents
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.documents.write().clear();
    }

    /// Make the next `count` searches fail with a transient error
    pub fn fail_next_searches(&self, count: usize) {
        self.failing_searches.store(count, AtomicOrdering::SeqCst);
    }

    /// Make the next `count` updates fail with a transient error
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, AtomicOrdering::SeqCst);
    }

    fn next_version(&self) -> Version {
        Version(self.version_counter.fetch_add(1, AtomicOrdering::SeqCst) + 1)
    }

    fn take_injected_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create(&self, id: &str, body: Value) -> Result<Version, StoreError> {
        let mut documents = self.documents.write();
        if let Some(existing) = documents.get(id) {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: Version(0),
                actual: Some(existing.version),
            });
        }

        let version = self.next_version();
        documents.insert(id.to_string(), StoredDocument { body, version });
        Ok(version)
    }

    async fn get(&self, id: &str) -> Result<VersionedDocument, StoreError> {
        let documents = self.documents.read();
        documents
            .get(id)
            .map(|d| VersionedDocument {
                id: id.to_string(),
                body: d.body.clone(),
                version: d.version,
            })
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(
        &self,
        id: &str,
        body: Value,
        expected_version: Version,
    ) -> Result<Version, StoreError> {
        if Self::take_injected_failure(&self.failing_updates) {
            return Err(StoreError::Transient("injected update failure".into()));
        }

        let mut documents = self.documents.write();
        let document = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if document.version != expected_version {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                actual: Some(document.version),
            });
        }

        let version = self.next_version();
        document.body = body;
        document.version = version;
        Ok(version)
    }

    async fn delete(&self, id: &str, expected_version: Option<Version>) -> Result<(), StoreError> {
        let mut documents = self.documents.write();
        let current = documents
            .get(id)
            .map(|d| d.version)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(expected) = expected_version {
            if expected != current {
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected,
                    actual: Some(current),
                });
            }
        }

        documents.remove(id);
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, StoreError> {
        if Self::take_injected_failure(&self.failing_searches) {
            return Err(StoreError::Transient("injected search failure".into()));
        }

        let documents = self.documents.read();
        let mut matching: Vec<VersionedDocument> = documents
            .iter()
            .filter(|(_, d)| matches_filter(&d.body, &query.filter))
            .map(|(id, d)| VersionedDocument {
                id: id.clone(),
                body: d.body.clone(),
                version: d.version,
            })
            .collect();
        drop(documents);

        // Stable tiebreak on id so results are deterministic
        matching.sort_by(|a, b| {
            for sort in &query.sort {
                let ordering = compare_optional(
                    lookup(&a.body, &sort.field),
                    lookup(&b.body, &sort.field),
                );
                let ordering = match sort.order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.id.cmp(&b.id)
        });

        let total = matching.len();
        matching.truncate(query.size);

        Ok(SearchPage {
            documents: matching,
            total,
        })
    }
}

/// Resolve a dotted field path within a JSON document
fn lookup<'a>(body: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(body, |value, segment| value.get(segment))
        .filter(|v| !v.is_null())
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Missing values sort last
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn matches_filter(body: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::All => true,
        Filter::Term { field, value } => lookup(body, field) == Some(value),
        Filter::Terms { field, values } => {
            lookup(body, field).is_some_and(|v| values.iter().any(|candidate| candidate == v))
        }
        Filter::Range { field, gte, lte } => {
            let Some(value) = lookup(body, field) else {
                return false;
            };
            let above = gte.as_ref().map_or(true, |bound| {
                matches!(
                    compare_values(value, bound),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            });
            let below = lte.as_ref().map_or(true, |bound| {
                matches!(
                    compare_values(value, bound),
                    Some(Ordering::Less | Ordering::Equal)
                )
            });
            above && below
        }
        Filter::Exists { field } => lookup(body, field).is_some(),
        Filter::And(filters) => filters.iter().all(|f| matches_filter(body, f)),
        Filter::Or(filters) => filters.iter().any(|f| matches_filter(body, f)),
        Filter::Not(inner) => !matches_filter(body, inner),
    }
}
