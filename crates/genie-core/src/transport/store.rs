//! Object store capability contract.
//!
//! The object-store transport only ever reads, writes, lists, and probes
//! opaque keys, so that is the whole contract a store has to satisfy. Cloud
//! SDK bindings implement this trait from outside the crate; two stores ship
//! here: [`DirStore`], which uses a local directory as a flat bucket (the
//! deployment answer for network mounts without a usable file watcher), and
//! [`MemoryStore`] for tests and embedding.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{GenieError, Result};

/// Key/value blob storage with prefix listing.
///
/// Keys are `/`-separated relative paths. Writes replace the key's previous
/// value; there is no compare-and-swap in the contract.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Write an object, replacing any previous value.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read an object, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All keys starting with `prefix`, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether the key exists.
    async fn exists(&self, key: &str) -> bool;
}

/// A directory used as a flat bucket.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(GenieError::Io {
                message: format!("invalid object key: {key:?}"),
                path: None,
                source: None,
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        static SEQ: AtomicU64 = AtomicU64::new(0);

        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GenieError::io_with_path(e, parent))?;
        }

        // Stage under `.tmp/` and rename, so neither a prefix listing nor a
        // concurrent reader ever sees a partial object.
        let staging = self.root.join(".tmp");
        std::fs::create_dir_all(&staging).map_err(|e| GenieError::io_with_path(e, &staging))?;
        let tmp = staging.join(format!(
            "{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, data).map_err(|e| GenieError::io_with_path(e, &tmp))?;
        std::fs::rename(&tmp, &path).map_err(|e| GenieError::io_with_path(e, path))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GenieError::io_with_path(e, path)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| GenieError::Io {
                message: format!("cannot walk object root: {e}"),
                path: Some(self.root.clone()),
                source: e.into_io_error(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(".tmp/") {
                continue;
            }
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> bool {
        match self.resolve(key) {
            Ok(path) => path.is_file(),
            Err(_) => false,
        }
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), data.to_vec());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).cloned()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .map(|objects| {
                objects
                    .range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise_store(store: &dyn ObjectStore) {
        assert!(!store.exists("sessions/s1").await);
        assert_eq!(store.get("sessions/s1").await.unwrap(), None);

        store.put("sessions/s1", b"").await.unwrap();
        store.put("session/s1/1-req.yaml", b"req").await.unwrap();
        store.put("session/s1/1-res.yaml", b"res").await.unwrap();

        assert!(store.exists("sessions/s1").await);
        assert_eq!(
            store.get("session/s1/1-req.yaml").await.unwrap(),
            Some(b"req".to_vec())
        );

        let mut keys = store.list("session/s1/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["session/s1/1-req.yaml", "session/s1/1-res.yaml"]);

        // The marker prefix and the message prefix never overlap.
        assert_eq!(store.list("sessions/").await.unwrap(), vec!["sessions/s1"]);

        // Writes replace.
        store.put("session/s1/1-req.yaml", b"second").await.unwrap();
        assert_eq!(
            store.get("session/s1/1-req.yaml").await.unwrap(),
            Some(b"second".to_vec())
        );
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_dir_store() {
        let temp = TempDir::new().unwrap();
        exercise_store(&DirStore::new(temp.path())).await;
    }

    #[tokio::test]
    async fn test_dir_store_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path());
        assert!(store.put("../outside", b"x").await.is_err());
        assert!(store.put("", b"x").await.is_err());
        assert!(store.put("/absolute", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_dir_store_list_on_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::new(temp.path().join("never-created"));
        assert_eq!(store.list("").await.unwrap(), Vec::<String>::new());
    }
}
