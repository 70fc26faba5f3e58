//! Durable key/value storage for the replica cache.
//!
//! Values are JSON. [`MemoryStorage`] is used when nothing should survive
//! a restart, [`FileStorage`] keeps one file per key in a directory.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::errors::StorageError;

type StorageResult<T> = std::result::Result<T, StorageError>;

/// Async key/value store
#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> StorageResult<()>;
    async fn remove(&self, key: &str) -> StorageResult<()>;
    async fn clear(&self) -> StorageResult<()>;
}

/// Read and deserialize a key.
pub async fn load<T: DeserializeOwned>(
    storage: &dyn LocalStorage,
    key: &str,
) -> StorageResult<Option<T>> {
    match storage.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and write a key.
pub async fn store<T: Serialize + ?Sized>(
    storage: &dyn LocalStorage,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    storage.set(key, serde_json::to_value(value)?).await
}

/// Volatile storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.entries.write().clear();
        Ok(())
    }
}

/// One JSON file per key
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

const EXTENSION: &str = "json";

/// Escape a key into a portable file name (`DS:DS` -> `DS%3ADS`).
fn file_name(key: &str) -> StorageResult<String> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    let mut name = String::with_capacity(key.len() + EXTENSION.len() + 1);
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => name.push(byte as char),
            other => name.push_str(&format!("%{:02X}", other)),
        }
    }
    name.push('.');
    name.push_str(EXTENSION);
    Ok(name)
}

impl FileStorage {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "file storage opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> StorageResult<PathBuf> {
        Ok(self.dir.join(file_name(key)?))
    }
}

#[async_trait]
impl LocalStorage for FileStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        let path = self.path(key)?;
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec(&value)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(key, bytes = bytes.len(), "stored");
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == EXTENSION) {
                tokio::fs::remove_file(&path).await?;
            }
        }
        debug!(dir = %self.dir.display(), "file storage cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_file_name_escaping() {
        assert_eq!(file_name("DS:DS").unwrap(), "DS%3ADS.json");
        assert_eq!(file_name("lastUserLoggedIn").unwrap(), "lastUserLoggedIn.json");
        assert_eq!(file_name("a/b").unwrap(), "a%2Fb.json");
        assert!(matches!(file_name(""), Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert!(storage.get("k").await.unwrap().is_none());
        storage.set("k", json!(1)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(json!(1)));
        storage.remove("k").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_file_storage_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            store(&storage, "DS:maxChangeId", &42u64).await.unwrap();
        }
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let version: Option<u64> = load(&storage, "DS:maxChangeId").await.unwrap();
        assert_eq!(version, Some(42));
    }

    #[tokio::test]
    async fn test_file_storage_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path().join("cache")).await.unwrap();
        storage.set("a", json!("x")).await.unwrap();
        storage.set("b", json!("y")).await.unwrap();

        storage.remove("a").await.unwrap();
        storage.remove("a").await.unwrap();
        assert!(storage.get("a").await.unwrap().is_none());

        storage.clear().await.unwrap();
        assert!(storage.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("k.json"), b"{not json").await.unwrap();
        assert!(matches!(
            storage.get("k").await,
            Err(StorageError::Serialization(_))
        ));
    }
}
