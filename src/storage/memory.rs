//! In-memory storage backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::document::{Document, Operation, Scope};
use crate::history::operations_are_equal;
use crate::storage::{Storage, StorageError};

/// Keeps whole documents in a map behind an async lock. Appends hold the
/// write lock for the full check-and-merge, so the position-uniqueness
/// invariant holds without a serialization failure path.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_document(
        &self,
        document_id: &str,
        document: Document,
    ) -> Result<(), StorageError> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(document_id) {
            return Err(StorageError::AlreadyExists(document_id.to_string()));
        }
        documents.insert(document_id.to_string(), document);
        Ok(())
    }

    async fn document_exists(&self, document_id: &str) -> Result<bool, StorageError> {
        Ok(self.documents.read().await.contains_key(document_id))
    }

    async fn get_document(&self, document_id: &str) -> Result<Document, StorageError> {
        self.documents
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), StorageError> {
        self.documents
            .write()
            .await
            .remove(document_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))
    }

    async fn document_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.documents.read().await.keys().cloned().collect())
    }

    async fn add_operations(
        &self,
        document_id: &str,
        operations: &[Operation],
        document: &Document,
    ) -> Result<(), StorageError> {
        let mut documents = self.documents.write().await;
        let stored = documents
            .get_mut(document_id)
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))?;

        for operation in operations {
            let occupied = stored
                .operations
                .get(operation.scope)
                .iter()
                .find(|existing| {
                    existing.index == operation.index && existing.skip == operation.skip
                });
            if let Some(existing) = occupied {
                if !operations_are_equal(existing, operation) {
                    return Err(StorageError::Conflict {
                        existing: Box::new(existing.clone()),
                        attempted: Box::new(operation.clone()),
                    });
                }
            }
        }

        // merge into the stored log rather than replacing the whole
        // document: a concurrent job on the other scope may have committed
        // since the caller read its snapshot
        let mut touched = Vec::new();
        for operation in operations {
            let log = stored.operations.get_mut(operation.scope);
            if !log.iter().any(|existing| {
                existing.index == operation.index && existing.skip == operation.skip
            }) {
                log.push(operation.clone());
            }
            if !touched.contains(&operation.scope) {
                touched.push(operation.scope);
            }
        }
        for scope in touched {
            stored
                .state
                .set(scope, document.state.get(scope).clone());
        }
        stored.name = document.name.clone();
        stored.last_modified = stored.last_modified.max(document.last_modified);
        Ok(())
    }

    async fn get_resulting_state(
        &self,
        document_id: &str,
        scope: Scope,
        index: u64,
    ) -> Result<Option<String>, StorageError> {
        let documents = self.documents.read().await;
        let document = documents
            .get(document_id)
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))?;
        Ok(document
            .operations
            .get(scope)
            .iter()
            .find(|op| op.index == index)
            .and_then(|op| op.resulting_state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentState;
    use serde_json::json;

    fn doc() -> Document {
        Document::new("test/doc", DocumentState::default())
    }

    fn op(index: u64, hash: &str) -> Operation {
        Operation {
            index,
            skip: 0,
            action_type: "SET".to_string(),
            scope: Scope::Global,
            input: json!(index),
            hash: hash.to_string(),
            timestamp: chrono::Utc::now(),
            id: None,
            resulting_state: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn create_get_delete_roundtrip() {
        let storage = MemoryStorage::new();
        storage.create_document("a", doc()).await.unwrap();
        assert!(storage.document_exists("a").await.unwrap());
        assert!(matches!(
            storage.create_document("a", doc()).await,
            Err(StorageError::AlreadyExists(_))
        ));

        storage.get_document("a").await.unwrap();
        storage.delete_document("a").await.unwrap();
        assert!(matches!(
            storage.get_document("a").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn conflicting_append_is_rejected() {
        let storage = MemoryStorage::new();
        let mut document = doc();
        let first = op(0, "aaa");
        document.operations.global.push(first.clone());
        storage.create_document("a", document.clone()).await.unwrap();

        // same position, different hash
        let diverged = op(0, "bbb");
        let err = storage
            .add_operations("a", &[diverged], &document)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        // byte-identical retransmission is accepted
        storage
            .add_operations("a", &[first], &document)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn append_updates_log_and_scope_state() {
        let storage = MemoryStorage::new();
        storage.create_document("a", doc()).await.unwrap();

        let mut updated = doc();
        let o = op(0, "aaa");
        updated.operations.global.push(o.clone());
        updated.state.global = json!(0);
        storage.add_operations("a", &[o], &updated).await.unwrap();

        let stored = storage.get_document("a").await.unwrap();
        assert_eq!(stored.operations.global.len(), 1);
        assert_eq!(stored.state.global, json!(0));
    }

    #[tokio::test]
    async fn stale_snapshot_does_not_erase_the_other_scope() {
        let storage = MemoryStorage::new();
        storage.create_document("a", doc()).await.unwrap();

        // two writers read the same empty document, then commit one scope
        // each; the second commit must not clobber the first
        let mut local_snapshot = doc();
        let mut local_op = op(0, "lll");
        local_op.scope = Scope::Local;
        local_snapshot.operations.local.push(local_op.clone());
        local_snapshot.state.local = json!("local");
        storage
            .add_operations("a", &[local_op], &local_snapshot)
            .await
            .unwrap();

        let mut global_snapshot = doc();
        let global_op = op(0, "ggg");
        global_snapshot.operations.global.push(global_op.clone());
        global_snapshot.state.global = json!("global");
        storage
            .add_operations("a", &[global_op], &global_snapshot)
            .await
            .unwrap();

        let stored = storage.get_document("a").await.unwrap();
        assert_eq!(stored.operations.global.len(), 1);
        assert_eq!(stored.operations.local.len(), 1);
        assert_eq!(stored.state.global, json!("global"));
        assert_eq!(stored.state.local, json!("local"));
    }
}
