//! In-memory reference implementation of the document store.
//!
//! Used by tests and the demo binary. Not durable: everything lives in a
//! pair of locked maps, and the change feed is a best-effort broadcast
//! (slow subscribers lose events, mirroring the eventual-consistency
//! contract of the real backing service).

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::{ChangeEvent, ChangeKind, Document, DocumentStore, Filter, StoreError};

const CHANGE_FEED_CAPACITY: usize = 256;

/// In-memory document store.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Document>>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            collections: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn emit(&self, kind: ChangeKind, collection: &str, id: &str, doc: Document) {
        // Nobody listening is fine; the feed is advisory.
        let _ = self.changes.send(ChangeEvent {
            kind,
            collection: collection.to_string(),
            id: id.to_string(),
            doc,
        });
    }

    /// Number of documents in a collection, for tests.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<(String, Document)>, StoreError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, doc)| filters.iter().all(|f| f.matches(doc)))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }

    async fn add(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc.clone());
        drop(collections);
        self.emit(ChangeKind::Added, collection, &id, doc);
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, doc: Document) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let existed = collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone())
            .is_some();
        drop(collections);
        let kind = if existed {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        self.emit(kind, collection, id, doc);
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Document,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        let Value::Object(target) = doc else {
            return Err(StoreError::NotAnObject {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        let Value::Object(fields) = patch else {
            return Err(StoreError::NotAnObject {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        for (key, value) in fields {
            target.insert(key, value);
        }
        let updated = doc.clone();
        drop(collections);
        self.emit(ChangeKind::Modified, collection, id, updated);
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let removed = collections
            .get_mut(collection)
            .and_then(|c| c.remove(id));
        drop(collections);
        if let Some(doc) = removed {
            self.emit(ChangeKind::Removed, collection, id, doc);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
