//! Document store abstraction.
//!
//! The engine does not own application storage. It talks to a
//! [`DocumentStore`] exposing `get/put/delete`, which is enough to capture
//! a pre-image before an optimistic write and to restore it on rollback.
//! [`MemoryStore`] is the in-process implementation used by tests and by
//! hosts without their own storage.

use crate::{error::Result, CollectionName, DocumentId, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Storage collaborator consumed by the optimistic tracker and rollback.
pub trait DocumentStore {
    /// Read a document. Returns an owned copy so callers can keep pre-images.
    fn get(&self, collection: &str, id: &str) -> Option<Value>;

    /// Insert or replace a document.
    fn put(&mut self, collection: &str, id: &str, document: Value) -> Result<()>;

    /// Hard-delete a document. Returns whether it existed.
    fn delete(&mut self, collection: &str, id: &str) -> Result<bool>;
}

/// A collection of documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCollection {
    documents: HashMap<DocumentId, Value>,
}

impl MemoryCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            documents: HashMap::new(),
        }
    }

    /// Get a document by ID.
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.documents.get(id)
    }

    /// Insert or replace a document.
    pub fn insert(&mut self, id: impl Into<DocumentId>, document: Value) {
        self.documents.insert(id.into(), document);
    }

    /// Remove a document.
    pub fn remove(&mut self, id: &str) -> Option<Value> {
        self.documents.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.documents.keys()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// In-memory [`DocumentStore`] keyed by collection name.
///
/// Collections are created on first write. A set of read-only collections
/// can be configured to simulate a store that refuses writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: BTreeMap<CollectionName, MemoryCollection>,
    read_only: Vec<CollectionName>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes to `collection` with [`Error::Store`].
    pub fn set_read_only(&mut self, collection: impl Into<CollectionName>, read_only: bool) {
        let collection = collection.into();
        self.read_only.retain(|c| c != &collection);
        if read_only {
            self.read_only.push(collection);
        }
    }

    pub fn collection(&self, name: &str) -> Option<&MemoryCollection> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &CollectionName> {
        self.collections.keys()
    }

    fn check_writable(&self, collection: &str) -> Result<()> {
        if self.read_only.iter().any(|c| c == collection) {
            return Err(Error::Store(format!("collection '{}' is read-only", collection)));
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections.get(collection)?.get(id).cloned()
    }

    fn put(&mut self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.check_writable(collection)?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, document);
        Ok(())
    }

    fn delete(&mut self, collection: &str, id: &str) -> Result<bool> {
        self.check_writable(collection)?;
        Ok(self
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_delete() {
        let mut store = MemoryStore::new();
        store.put("todos", "t1", json!({"title": "a"})).unwrap();
        assert_eq!(store.get("todos", "t1"), Some(json!({"title": "a"})));
        assert!(store.delete("todos", "t1").unwrap());
        assert!(!store.delete("todos", "t1").unwrap());
        assert_eq!(store.get("todos", "t1"), None);
    }

    #[test]
    fn read_only_collection_rejects_writes() {
        let mut store = MemoryStore::new();
        store.set_read_only("locked", true);
        assert!(matches!(
            store.put("locked", "x", json!({})),
            Err(Error::Store(_))
        ));
        store.set_read_only("locked", false);
        assert!(store.put("locked", "x", json!({})).is_ok());
        assert_eq!(store.collection("locked").unwrap().len(), 1);
    }
}
