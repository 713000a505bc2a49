//! In-memory store, lost on restart.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{Document, Store, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn create(&self, doc: &Document) -> Result<(), StoreError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        if documents.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists(doc.id.clone()));
        }
        documents.insert(doc.id.clone(), doc.content.clone());
        Ok(())
    }

    fn update(&self, doc: &Document) -> Result<(), StoreError> {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc.id.clone(), doc.content.clone());
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Document, StoreError> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents
            .get(id)
            .map(|content| Document {
                id: id.to_string(),
                content: content.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_read_update() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        let mut doc = Document::new("hello world");
        store.create(&doc).unwrap();
        assert_eq!(store.read(&doc.id).unwrap().content, "hello world");

        doc.content = "hello universe".into();
        store.update(&doc).unwrap();
        assert_eq!(store.read(&doc.id).unwrap().content, "hello universe");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_create_rejects_existing() {
        let store = MemoryStore::new();
        let doc = Document::new("a");
        store.create(&doc).unwrap();
        assert_eq!(store.create(&doc), Err(StoreError::AlreadyExists(doc.id.clone())));
    }

    #[test]
    fn test_read_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.read("nope"), Err(StoreError::NotFound("nope".into())));
    }
}
