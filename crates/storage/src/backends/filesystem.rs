//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key below the root, off the async runtime.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Map a key to a path, refusing anything that resolves outside the root.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        if !Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize()?;

        // The deepest existing ancestor (or the path itself) must stay inside
        // the root once symlinks are resolved.
        let mut probe = Some(path.as_path());
        while let Some(candidate) = probe {
            match std::fs::symlink_metadata(candidate) {
                Ok(_) => {
                    let canonical = candidate.canonicalize().map_err(|_| {
                        StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    return Ok(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    probe = candidate.parent();
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(path)
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        let suffix = format!(".tmp.{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{suffix}", n.to_string_lossy()))
                .unwrap_or(suffix),
        )
    }

    /// Write `data` to a fresh temp file next to `path` and fsync it.
    async fn write_temp(path: &Path, data: &[u8]) -> StorageResult<PathBuf> {
        let temp_path = Self::temp_path(path);
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(temp_path)
    }
}

fn not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(not_found(key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        let temp_path = Self::write_temp(&path, &data).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        if fs::try_exists(&path).await.map_err(StorageError::Io)? {
            return Ok(false);
        }
        self.ensure_parent(&path).await?;
        let temp_path = Self::write_temp(&path, &data).await?;

        // hard_link fails on an existing target, so two racing writers of
        // the same key cannot both win.
        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        let temp_path = Self::temp_path(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path).await.map_err(not_found(key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base_path = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.key_path(prefix).await?
        };
        let mut results = Vec::new();
        if !fs::try_exists(&base_path).await? {
            return Ok(results);
        }

        let mut stack = vec![base_path];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // Symlinks are skipped.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && !path.to_string_lossy().contains(".tmp.")
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    results.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn health_check(&self) -> StorageResult<()> {
        let probe = format!(".health.{}", Uuid::new_v4());
        self.put(&probe, Bytes::from_static(b"ok")).await?;
        self.delete(&probe).await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (FilesystemBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (backend, _dir) = backend().await;
        backend
            .put("carves/env/s1/0", Bytes::from("block zero"))
            .await
            .unwrap();
        assert!(backend.exists("carves/env/s1/0").await.unwrap());
        assert_eq!(
            backend.get("carves/env/s1/0").await.unwrap(),
            Bytes::from("block zero")
        );
    }

    #[tokio::test]
    async fn test_put_if_not_exists_keeps_first_write() {
        let (backend, _dir) = backend().await;
        assert!(
            backend
                .put_if_not_exists("k", Bytes::from("first"))
                .await
                .unwrap()
        );
        assert!(
            !backend
                .put_if_not_exists("k", Bytes::from("second"))
                .await
                .unwrap()
        );
        assert_eq!(backend.get("k").await.unwrap(), Bytes::from("first"));
        // temp files never show up in listings
        assert_eq!(backend.list("").await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (backend, _dir) = backend().await;
        for key in ["../escape", "/abs", "a/../../b", ""] {
            assert!(matches!(
                backend.get(key).await,
                Err(StorageError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (backend, _dir) = backend().await;
        assert!(matches!(
            backend.get("missing").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.delete("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_streaming_upload_visible_after_finish() {
        let (backend, _dir) = backend().await;
        let mut upload = backend.put_stream("archives/env/a.tar").await.unwrap();
        upload.write(Bytes::from("ab")).await.unwrap();
        upload.write(Bytes::from("cd")).await.unwrap();
        assert!(!backend.exists("archives/env/a.tar").await.unwrap());
        assert_eq!(upload.finish().await.unwrap(), 4);
        assert_eq!(
            backend.get("archives/env/a.tar").await.unwrap(),
            Bytes::from("abcd")
        );
    }

    #[tokio::test]
    async fn test_list_prefix_sorted() {
        let (backend, _dir) = backend().await;
        backend.put("carves/e/s/1", Bytes::from("b")).await.unwrap();
        backend.put("carves/e/s/0", Bytes::from("a")).await.unwrap();
        backend.put("archives/e/x.tar", Bytes::from("x")).await.unwrap();
        assert_eq!(
            backend.list("carves").await.unwrap(),
            vec!["carves/e/s/0".to_string(), "carves/e/s/1".to_string()]
        );
        assert!(backend.list("nothing-here").await.unwrap().is_empty());
        backend.health_check().await.unwrap();
    }
}
