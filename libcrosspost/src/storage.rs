//! Object storage
//!
//! A flat key space of byte blobs. Keys are `/`-separated relative paths
//! (`post/{root}/title`, `session/{key}`). Staged content and session buffers
//! both live here.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::{Result, StorageError};

const TEMP_PREFIX: &str = ".tmp-";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous value.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Fetch the value of `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Reject keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        || key
            .rsplit('/')
            .next()
            .is_some_and(|name| name.starts_with(TEMP_PREFIX));

    if bad {
        return Err(StorageError::InvalidKey(key.to_string()).into());
    }
    Ok(())
}

// ============================================================================
// Filesystem
// ============================================================================

/// Stores each key as a file below `root`.
///
/// Writes go to a temporary sibling and are renamed into place, so readers
/// never observe a partially written value.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open (and create) a store rooted at `root`; `~` is expanded.
    pub async fn new(root: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(root).to_string();
        let root = PathBuf::from(expanded);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(StorageError::Io)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    /// Remove empty directories between `dir` and the root.
    async fn prune_empty_dirs(&self, mut dir: Option<&Path>) {
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // Fails (and stops) as soon as a directory still has entries.
            if tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(StorageError::Io)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix = uuid::Uuid::new_v4().simple();
        let temp = parent.join(format!("{}{}-{}", TEMP_PREFIX, file_name, suffix));

        if let Err(e) = tokio::fs::write(&temp, &data).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(StorageError::Io(e).into());
            }
            // A concurrent delete pruned the directory; recreate once.
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::Io)?;
            tokio::fs::write(&temp, &data)
                .await
                .map_err(StorageError::Io)?;
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::Io(e).into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e).into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_dirs(path.parent()).await;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e).into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Start from the deepest directory the prefix fully names.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            validate_key(dir_part)?;
            dir_part.split('/').fold(self.root.clone(), |p, seg| p.join(seg))
        };

        let mut keys = Vec::new();
        let mut pending = vec![(start, dir_part.to_string())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e).into()),
            };

            while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let key = if key_prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", key_prefix, name)
                };

                let file_type = entry.file_type().await.map_err(StorageError::Io)?;
                if file_type.is_dir() {
                    if key.starts_with(prefix) || prefix.starts_with(&format!("{}/", key)) {
                        pending.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store for tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.objects.write().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise_store(store: &dyn ObjectStore) {
        store.put("post/abc/title", b"Hello".to_vec()).await.unwrap();
        store.put("post/abc/tags", b"[]".to_vec()).await.unwrap();
        store.put("post/abd/title", b"Other".to_vec()).await.unwrap();
        store.put("session/tg", b"state".to_vec()).await.unwrap();

        assert_eq!(
            store.get("post/abc/title").await.unwrap(),
            Some(b"Hello".to_vec())
        );
        assert_eq!(store.get("post/abc/missing").await.unwrap(), None);
        assert!(store.exists("session/tg").await.unwrap());

        assert_eq!(
            store.list("post/abc/").await.unwrap(),
            vec!["post/abc/tags".to_string(), "post/abc/title".to_string()]
        );
        assert_eq!(store.list("post/").await.unwrap().len(), 3);
        assert_eq!(store.list("post/ab").await.unwrap().len(), 3);
        assert!(store.list("nothing/").await.unwrap().is_empty());

        store.put("post/abc/title", b"Replaced".to_vec()).await.unwrap();
        assert_eq!(
            store.get("post/abc/title").await.unwrap(),
            Some(b"Replaced".to_vec())
        );

        assert!(store.delete("post/abc/title").await.unwrap());
        assert!(!store.delete("post/abc/title").await.unwrap());
        assert_eq!(store.list("post/abc/").await.unwrap(), vec!["post/abc/tags"]);
    }

    #[tokio::test]
    async fn test_memory_store_operations() {
        let store = MemoryObjectStore::new();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_fs_store_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(&temp_dir.path().to_string_lossy())
            .await
            .unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_fs_store_prunes_empty_directories() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(&temp_dir.path().to_string_lossy())
            .await
            .unwrap();

        store.put("post/xyz/title", b"t".to_vec()).await.unwrap();
        assert!(temp_dir.path().join("post").join("xyz").exists());

        store.delete("post/xyz/title").await.unwrap();
        assert!(!temp_dir.path().join("post").join("xyz").exists());
        assert!(temp_dir.path().exists());
    }

    #[tokio::test]
    async fn test_fs_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_string_lossy().to_string();

        let store = FsObjectStore::new(&root).await.unwrap();
        store.put("session/a", vec![1, 2, 3]).await.unwrap();
        drop(store);

        let reopened = FsObjectStore::new(&root).await.unwrap();
        assert_eq!(reopened.get("session/a").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let store = MemoryObjectStore::new();
        for key in ["", "/abs", "a/../b", "..", "a//b", "a\\b", "post/.tmp-x"] {
            let result = store.put(key, vec![]).await;
            assert!(
                matches!(
                    result,
                    Err(crate::error::CrosspostError::Storage(StorageError::InvalidKey(_)))
                ),
                "key {:?} should be rejected",
                key
            );
        }
    }
}
