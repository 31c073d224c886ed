//! Document-store collaborator contract for the Family Tasks engine.
//!
//! The engine persists its state through this narrow interface: keyed JSON
//! documents grouped into named collections, simple field filters, shallow
//! patch updates, and a change-feed subscription. The backing service is
//! eventually consistent; callers tolerate duplicate change events and
//! re-read state each cycle rather than caching across ticks.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;

pub use memory::MemoryStore;

/// A stored document. Documents are plain JSON objects; typed models
/// round-trip through serde at the call sites.
pub type Document = Value;

/// Errors surfaced by a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("not an object document: {collection}/{id}")]
    NotAnObject { collection: String, id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Comparison operator for a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lte,
    Gte,
}

/// A single field filter. Filters in a query are ANDed.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Lte,
            value: value.into(),
        }
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Gte,
            value: value.into(),
        }
    }

    /// Whether a document satisfies this filter.
    ///
    /// Missing fields never match. Ordered comparisons apply to numbers
    /// and to strings (lexicographic, which is correct for RFC 3339
    /// timestamps stored as strings).
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lte | FilterOp::Gte => {
                let ord = match (actual, &self.value) {
                    (Value::Number(a), Value::Number(b)) => a
                        .as_f64()
                        .zip(b.as_f64())
                        .and_then(|(a, b)| a.partial_cmp(&b)),
                    (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
                    _ => None,
                };
                match (ord, self.op) {
                    (Some(ord), FilterOp::Lte) => ord != std::cmp::Ordering::Greater,
                    (Some(ord), FilterOp::Gte) => ord != std::cmp::Ordering::Less,
                    _ => false,
                }
            }
        }
    }
}

/// Kind of change delivered on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change-feed event.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: String,
    pub id: String,
    pub doc: Document,
}

/// Narrow document-store contract consumed by the engine.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document. Absence is `Ok(None)`, not an error.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// All documents in a collection satisfying every filter, with ids.
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<(String, Document)>, StoreError>;

    /// Insert a new document with a generated id.
    async fn add(&self, collection: &str, doc: Document) -> Result<String, StoreError>;

    /// Insert or fully replace a document under a known id.
    async fn set(&self, collection: &str, id: &str, doc: Document) -> Result<(), StoreError>;

    /// Shallow-merge a patch into an existing document.
    ///
    /// Unlike `get`, updating a missing document is an error.
    async fn update(&self, collection: &str, id: &str, patch: Document)
        -> Result<(), StoreError>;

    /// Delete a document. Deleting a missing document is a no-op.
    async fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Subscribe to the change feed for all collections.
    fn watch(&self) -> broadcast::Receiver<ChangeEvent>;
}
