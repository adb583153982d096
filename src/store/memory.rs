use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Blob, BlobStore, KvStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, blob: Blob) -> Result<(), StoreError> {
        self.blobs.write().await.insert(key.to_string(), blob);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put_all(&self, entries: Vec<(String, serde_json::Value)>) -> Result<(), StoreError> {
        let mut guard = self.entries.write().await;
        guard.extend(entries);
        Ok(())
    }
}
