//! Durable collaborators of the actors: a blob store for snapshots and
//! uploaded assets, and a per-instance key/value store for counters.

pub mod fs;
pub mod memory;

pub use fs::{FsBlobStore, FsKvStore};
pub use memory::{MemoryBlobStore, MemoryKvStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub content_type: String,
    pub etag: String,
    pub uploaded: DateTime<Utc>,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    pub metadata: BlobMetadata,
}

impl Blob {
    pub fn new(data: Vec<u8>, content_type: impl Into<String>) -> Self {
        let etag = hex::encode(Sha256::digest(&data));
        let metadata = BlobMetadata {
            content_type: content_type.into(),
            etag,
            uploaded: Utc::now(),
            size: data.len(),
        };
        Self { data, metadata }
    }
}

/// Last-write-wins store of opaque blobs.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Blob>, StoreError>;
    async fn put(&self, key: &str, blob: Blob) -> Result<(), StoreError>;
}

/// Key/value state belonging to a single actor instance.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Writes every entry or none of them.
    async fn put_all(&self, entries: Vec<(String, serde_json::Value)>) -> Result<(), StoreError>;
}

pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub fn snapshot_key(instance: &crate::identity::InstanceId) -> String {
    format!("rooms/{}", instance)
}

pub fn asset_key(id: &str) -> String {
    format!("assets/{}", id)
}
