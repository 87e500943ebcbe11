//! Carve repository.

use crate::error::MetadataResult;
use crate::models::{CarvedBlockRow, CarvedFileRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// A block to record against a carve session.
#[derive(Debug, Clone)]
pub struct BlockWrite {
    pub env_id: Uuid,
    pub session_id: String,
    pub request_id: String,
    pub block_id: i64,
    pub data: Option<Vec<u8>>,
    pub size: i64,
    pub storage_key: Option<String>,
    pub received_at: OffsetDateTime,
}

/// Outcome of [`CarveRepo::record_block`].
#[derive(Debug, Clone)]
pub enum BlockOutcome {
    /// No open session matches the (session, request) pair in this
    /// environment, or the block index is out of range.
    Rejected,
    /// The block was already stored; counters unchanged.
    Duplicate,
    /// The block was stored and counted. Carries the updated carve.
    Accepted(CarvedFileRow),
}

/// Repository for carve sessions and their blocks.
#[async_trait]
pub trait CarveRepo: Send + Sync {
    /// Record a scheduled carve. If the node already opened a session for the
    /// same (env_id, carve_id), its missing path and query name are filled in
    /// and its status is kept. Returns true if a row was inserted or filled.
    async fn create_carve(&self, carve: &CarvedFileRow) -> MetadataResult<bool>;

    /// Get a carve by its agent-assigned carve ID.
    async fn get_carve(&self, env_id: Uuid, carve_id: &str)
    -> MetadataResult<Option<CarvedFileRow>>;

    /// Get a carve by session ID.
    async fn get_carve_by_session(&self, session_id: &str)
    -> MetadataResult<Option<CarvedFileRow>>;

    /// List carves of an environment, newest first.
    async fn list_carves(&self, env_id: Uuid) -> MetadataResult<Vec<CarvedFileRow>>;

    /// Start a carve session.
    ///
    /// Promotes the node's `SCHEDULED` carve with the same carve ID to
    /// `INITIALIZED` with the session and geometry of `carve`, or inserts
    /// `carve` when no scheduled one exists. Returns the stored row.
    async fn initialize_carve(&self, carve: &CarvedFileRow) -> MetadataResult<CarvedFileRow>;

    /// Store one block and advance the session, in one transaction.
    ///
    /// The completed-block counter and status move together in a single
    /// guarded update, so concurrent blocks of one session can neither
    /// lose an increment nor overshoot `total_blocks`.
    async fn record_block(&self, block: &BlockWrite) -> MetadataResult<BlockOutcome>;

    /// Blocks of a session ordered by block ID.
    async fn list_blocks(&self, session_id: &str) -> MetadataResult<Vec<CarvedBlockRow>>;

    /// Record where the reassembled archive was written.
    async fn mark_carve_archived(
        &self,
        session_id: &str,
        archive_path: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Mark a carve completed without checking its blocks.
    async fn complete_carve(
        &self,
        env_id: Uuid,
        carve_id: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Mark a carve deleted.
    async fn delete_carve(&self, env_id: Uuid, carve_id: &str, at: OffsetDateTime)
    -> MetadataResult<bool>;

    /// Mark a carve expired.
    async fn expire_carve(&self, env_id: Uuid, carve_id: &str, at: OffsetDateTime)
    -> MetadataResult<bool>;

    /// Expire the unfinished carves created by a query. Returns the count.
    async fn expire_carves_for_query(
        &self,
        env_id: Uuid,
        query_name: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<u64>;
}
