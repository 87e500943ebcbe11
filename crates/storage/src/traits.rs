//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Object store for carve blocks and reassembled archives.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object atomically, replacing any previous content.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Put an object only if it doesn't exist. Returns true if written.
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool>;

    /// Start a streaming upload. The object becomes visible on `finish`.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List object keys under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Verify the backend is reachable and writable.
    async fn health_check(&self) -> StorageResult<()>;

    /// Static identifier of the backend, used for metrics and logging.
    fn backend_name(&self) -> &'static str;
}

/// Handle for a streaming upload.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Complete the upload. Returns the number of bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload and discard partial data.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Key prefix holding every block of a carve session.
pub fn block_prefix(env_id: &uuid::Uuid, session_id: &str) -> String {
    format!("carves/{env_id}/{session_id}")
}

/// Object key of one carved block.
pub fn block_key(env_id: &uuid::Uuid, session_id: &str, block_id: i64) -> String {
    format!("{}/{block_id}", block_prefix(env_id, session_id))
}

/// Object key of a reassembled carve archive.
pub fn archive_key(env_id: &uuid::Uuid, file_name: &str) -> String {
    format!("archives/{env_id}/{file_name}")
}
