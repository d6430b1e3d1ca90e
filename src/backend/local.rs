//! Local-filesystem object store.
//!
//! Objects are plain files under a root directory. Writes go to a temp file
//! in the same directory followed by a rename, which is what gives each
//! object write-then-visible semantics.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use super::ObjectStore;
use crate::error::{Result, TraceError};

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are forward-slash paths; refuse anything that escapes the root.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(TraceError::Backend(format!("invalid object key: {}", key)));
        }
        Ok(self.root.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|p| p.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/"))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) && !key.contains(".tmp-") {
                        out.push(key);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store
            .put("acme/blk/data.bin", Bytes::from(vec![1, 2, 3]))
            .await
            .unwrap();
        let got = store.get("acme/blk/data.bin").await.unwrap().unwrap();
        assert_eq!(&got[..], &[1, 2, 3]);

        let keys = store.list("acme/").await.unwrap();
        assert_eq!(keys, vec!["acme/blk/data.bin"]);

        store.delete("acme/blk/data.bin").await.unwrap();
        assert!(store.get("acme/blk/data.bin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put("a//b", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let store = LocalStore::new("/nonexistent-tracedb-test-root");
        assert!(store.list("x/").await.unwrap().is_empty());
    }
}
