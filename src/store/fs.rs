use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::{fs, sync::Mutex};

use super::{Blob, BlobMetadata, BlobStore, KvStore, StoreError};
use crate::identity::InstanceId;

/// Writes `bytes` next to `path` and renames it into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Blob store backed by a directory. Keys are hashed into file names so
/// caller-supplied asset ids can never escape the root.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        (
            self.root.join(format!("{name}.bin")),
            self.root.join(format!("{name}.meta.json")),
        )
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
        let (data_path, meta_path) = self.paths(key);
        let meta = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata: BlobMetadata = serde_json::from_slice(&meta)?;
        let data = match fs::read(&data_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Blob { data, metadata }))
    }

    async fn put(&self, key: &str, blob: Blob) -> Result<(), StoreError> {
        let (data_path, meta_path) = self.paths(key);
        let meta = serde_json::to_vec(&blob.metadata)?;
        // Metadata last: a blob is only visible once both files are in place.
        write_atomic(&data_path, &blob.data).await?;
        write_atomic(&meta_path, &meta).await?;
        Ok(())
    }
}

/// Key/value store persisted as one JSON document per actor instance.
#[derive(Debug)]
pub struct FsKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl FsKvStore {
    pub async fn open(dir: impl AsRef<Path>, instance: &InstanceId) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{instance}.json"));
        let entries = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }
}

#[async_trait]
impl KvStore for FsKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put_all(&self, entries: Vec<(String, serde_json::Value)>) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().await;
        let mut next = guard.clone();
        next.extend(entries);
        write_atomic(&self.path, &serde_json::to_vec_pretty(&next)?).await?;
        *guard = next;
        Ok(())
    }
}
