//! In-memory collaborators for blob storage, the audit log and the commit database.
//!
//! Transactions are staged against a copy of the record map and only swapped in
//! when every write succeeds, so an injected failure leaves nothing behind.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::commit::{Persistence, RecordWrite};
use crate::error::{RetrievalError, StoreError};
use crate::storage::{BlobStore, StoredObject};
use crate::usage::{AuditSink, UsageLogEntry};

type Collections = HashMap<String, HashMap<String, serde_json::Value>>;

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, StoredObject>,
    denied: HashSet<String>,
    audit: Vec<UsageLogEntry>,
    fail_audit: bool,
    records: Collections,
    /// Zero-based index of the write that fails inside the next transactions.
    fail_write_at: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_object(&self, path: &str, bytes: Vec<u8>, content_type: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.objects.insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn deny(&self, path: &str) {
        self.inner.write().unwrap().denied.insert(path.to_string());
    }

    pub fn fail_audit_inserts(&self, fail: bool) {
        self.inner.write().unwrap().fail_audit = fail;
    }

    pub fn fail_write_at(&self, index: Option<usize>) {
        self.inner.write().unwrap().fail_write_at = index;
    }

    pub fn audit_entries(&self) -> Vec<UsageLogEntry> {
        self.inner.read().unwrap().audit.clone()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .records
            .get(collection)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.inner
            .read()
            .unwrap()
            .records
            .get(collection)?
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<StoredObject, RetrievalError> {
        let inner = self.inner.read().unwrap();
        if inner.denied.contains(path) {
            return Err(RetrievalError::AccessDenied(path.to_string()));
        }
        inner
            .objects
            .get(path)
            .cloned()
            .ok_or_else(|| RetrievalError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn insert(&self, entry: &UsageLogEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.fail_audit {
            return Err(StoreError::Other("audit store unavailable".to_string()));
        }
        inner.audit.push(entry.clone());
        Ok(())
    }

    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageLogEntry>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut entries: Vec<UsageLogEntry> = inner
            .audit
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn transaction(&self, writes: Vec<RecordWrite>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut staged = inner.records.clone();

        for (index, write) in writes.into_iter().enumerate() {
            if inner.fail_write_at == Some(index) {
                return Err(StoreError::Other(format!(
                    "simulated failure writing {}/{}",
                    write.collection, write.id
                )));
            }
            let collection = staged.entry(write.collection).or_default();
            if collection.contains_key(&write.id) {
                return Err(StoreError::Rejected {
                    status: 409,
                    message: format!("duplicate id {}", write.id),
                });
            }
            collection.insert(write.id, write.record);
        }

        inner.records = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(collection: &str, id: &str) -> RecordWrite {
        RecordWrite {
            collection: collection.to_string(),
            id: id.to_string(),
            record: json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn test_transaction_applies_all_writes() {
        let store = MemoryStore::new();
        store
            .transaction(vec![write("projects", "p1"), write("contracts", "c1")])
            .await
            .unwrap();

        assert_eq!(store.count("projects"), 1);
        assert_eq!(store.count("contracts"), 1);
        assert_eq!(store.record("projects", "p1").unwrap()["id"], "p1");
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_nothing() {
        let store = MemoryStore::new();
        store.fail_write_at(Some(1));

        let result = store
            .transaction(vec![write("projects", "p1"), write("contracts", "c1")])
            .await;

        assert!(result.is_err());
        assert_eq!(store.count("projects"), 0);
        assert_eq!(store.count("contracts"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rolls_back() {
        let store = MemoryStore::new();
        store.transaction(vec![write("projects", "p1")]).await.unwrap();

        let result = store
            .transaction(vec![write("projects", "p2"), write("projects", "p1")])
            .await;

        assert!(matches!(result, Err(StoreError::Rejected { status: 409, .. })));
        assert_eq!(store.count("projects"), 1);
    }
}
