//! File carving engine.
//!
//! Carves move through `SCHEDULED -> INITIALIZED -> IN PROGRESS -> COMPLETED`.
//! A carve query result schedules a carve, the agent's init call opens a
//! session and every block call stores one block. The (session, request)
//! pair is the only credential a block carries, so it is checked before any
//! bytes are written anywhere.

use crate::error::{ApiError, ApiResult};
use crate::tasks::TaskRegistry;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use fleet_core::carve::{archive_file_name, generate_session_id, is_zstd};
use fleet_core::config::CarverConfig;
use fleet_core::protocol::{CarveBlockRequest, CarveInitRequest, CarveScheduledRow};
use fleet_core::{CarveStatus, CarverBackend};
use fleet_metadata::MetadataStore;
use fleet_metadata::models::{CarvedBlockRow, CarvedFileRow, NodeRow};
use fleet_metadata::repos::{BlockOutcome, BlockWrite, CarveRepo};
use fleet_storage::{ObjectStore, archive_key, block_key, block_prefix};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// What happened to a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReceipt {
    /// Stored and counted. `completed` is true for the block that finished
    /// the carve.
    Accepted { node_id: Uuid, completed: bool },
    /// Already stored; nothing counted.
    Duplicate { node_id: Uuid },
    /// No open session matches, or the block is malformed.
    Rejected,
}

impl BlockReceipt {
    /// Whether the agent should treat the block as delivered.
    pub fn success(&self) -> bool {
        !matches!(self, Self::Rejected)
    }

    /// Node owning the session, for delivered blocks.
    pub fn node_id(&self) -> Option<Uuid> {
        match self {
            Self::Accepted { node_id, .. } | Self::Duplicate { node_id } => Some(*node_id),
            Self::Rejected => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Duplicate { .. } => "duplicate",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Clone)]
pub struct CarvingEngine {
    store: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    config: CarverConfig,
    tasks: Arc<TaskRegistry>,
}

impl CarvingEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        config: CarverConfig,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            store,
            storage,
            config,
            tasks,
        }
    }

    /// Record a carve the agent confirmed in a query result.
    ///
    /// Returns false when the carve was already known.
    pub async fn schedule_from_result(
        &self,
        node: &NodeRow,
        query_name: &str,
        row: &CarveScheduledRow,
    ) -> ApiResult<bool> {
        let now = OffsetDateTime::now_utc();
        let carve = CarvedFileRow {
            carve_file_id: Uuid::new_v4(),
            env_id: node.env_id,
            node_id: node.node_id,
            uuid: node.uuid.clone(),
            carve_id: row.carve_guid.clone(),
            request_id: row.request_id.trim().to_string(),
            session_id: None,
            query_name: Some(query_name.to_string()),
            path: row.path.clone(),
            carve_size: 0,
            block_size: 0,
            total_blocks: 0,
            completed_blocks: 0,
            status: CarveStatus::Scheduled.as_str().to_string(),
            carver: self.config.backend.as_str().to_string(),
            archived: false,
            archive_path: None,
            deleted: false,
            expired: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let created = self.store.create_carve(&carve).await?;
        if created {
            tracing::info!(
                env_id = %node.env_id,
                carve_id = %carve.carve_id,
                path = %carve.path,
                "Carve scheduled"
            );
        }
        Ok(created)
    }

    /// Open a carve session for an authenticated node. Returns the session ID.
    #[tracing::instrument(skip(self, node, request), fields(node_id = %node.node_id, carve_id = %request.carve_id))]
    pub async fn init_carve(&self, node: &NodeRow, request: &CarveInitRequest) -> ApiResult<String> {
        request.geometry().validate(self.config.max_block_size)?;
        if request.carve_id.trim().is_empty() {
            return Err(ApiError::BadRequest("carve_id must not be empty".to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let session_id = generate_session_id();
        let carve = CarvedFileRow {
            carve_file_id: Uuid::new_v4(),
            env_id: node.env_id,
            node_id: node.node_id,
            uuid: node.uuid.clone(),
            carve_id: request.carve_id.clone(),
            request_id: request.request_id.trim().to_string(),
            session_id: Some(session_id.clone()),
            query_name: None,
            path: String::new(),
            carve_size: request.carve_size,
            block_size: request.block_size,
            total_blocks: request.block_count,
            completed_blocks: 0,
            status: CarveStatus::Initialized.as_str().to_string(),
            carver: self.config.backend.as_str().to_string(),
            archived: false,
            archive_path: None,
            deleted: false,
            expired: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let stored = self.store.initialize_carve(&carve).await?;
        crate::metrics::CARVE_SESSIONS.inc();
        tracing::info!(
            session_id = %session_id,
            blocks = stored.total_blocks,
            scheduled = stored.query_name.is_some(),
            "Carve session initialized"
        );
        Ok(session_id)
    }

    /// Store one block.
    ///
    /// The session is checked before the block is written to object
    /// storage, so rejected blocks leave nothing behind.
    #[tracing::instrument(skip(self, request), fields(session_id = %request.session_id, block_id = request.block_id))]
    pub async fn process_block(
        &self,
        env_id: Uuid,
        request: &CarveBlockRequest,
    ) -> ApiResult<BlockReceipt> {
        let receipt = self.receive_block(env_id, request).await?;
        crate::metrics::CARVE_BLOCKS
            .with_label_values(&[receipt.label()])
            .inc();
        Ok(receipt)
    }

    async fn receive_block(
        &self,
        env_id: Uuid,
        request: &CarveBlockRequest,
    ) -> ApiResult<BlockReceipt> {
        let Some(carve) = self.store.get_carve_by_session(&request.session_id).await? else {
            tracing::debug!("Block for unknown session");
            return Ok(BlockReceipt::Rejected);
        };
        if !self.session_accepts(&carve, env_id, request) {
            tracing::debug!(status = %carve.status, "Block rejected for session");
            return Ok(BlockReceipt::Rejected);
        }

        let Ok(data) = STANDARD.decode(request.data.trim()) else {
            tracing::debug!("Block payload is not valid base64");
            return Ok(BlockReceipt::Rejected);
        };
        if data.len() as i64 > carve.block_size {
            tracing::debug!(size = data.len(), "Block larger than declared block size");
            return Ok(BlockReceipt::Rejected);
        }

        let size = data.len() as i64;
        let (data, storage_key) = if carve.carver == CarverBackend::Storage.as_str() {
            let key = block_key(&env_id, &request.session_id, request.block_id);
            self.storage.put_if_not_exists(&key, Bytes::from(data)).await?;
            (None, Some(key))
        } else {
            (Some(data), None)
        };

        let outcome = self
            .store
            .record_block(&BlockWrite {
                env_id,
                session_id: request.session_id.clone(),
                request_id: request.request_id.clone(),
                block_id: request.block_id,
                data,
                size,
                storage_key,
                received_at: OffsetDateTime::now_utc(),
            })
            .await?;

        Ok(match outcome {
            BlockOutcome::Rejected => BlockReceipt::Rejected,
            BlockOutcome::Duplicate => BlockReceipt::Duplicate {
                node_id: carve.node_id,
            },
            BlockOutcome::Accepted(updated) => {
                let completed = updated.is_completed();
                if completed {
                    self.on_completed(updated).await;
                }
                BlockReceipt::Accepted {
                    node_id: carve.node_id,
                    completed,
                }
            }
        })
    }

    fn session_accepts(&self, carve: &CarvedFileRow, env_id: Uuid, request: &CarveBlockRequest) -> bool {
        carve.env_id == env_id
            && carve.request_id.trim() == request.request_id.trim()
            && !carve.deleted
            && !carve.expired
            && carve.carve_status().is_some_and(|s| s.accepts_blocks())
            && (0..carve.total_blocks).contains(&request.block_id)
    }

    async fn on_completed(&self, carve: CarvedFileRow) {
        crate::metrics::CARVES_COMPLETED.inc();
        tracing::info!(
            env_id = %carve.env_id,
            carve_id = %carve.carve_id,
            blocks = carve.total_blocks,
            "Carve completed"
        );

        if !self.config.archive_on_complete {
            return;
        }
        let Some(session_id) = carve.session_id else {
            return;
        };
        let engine = self.clone();
        self.tasks
            .spawn("carve_archive", async move {
                if let Err(e) = engine.archive(&session_id).await {
                    tracing::error!(session_id = %session_id, error = %e, "Carve archival failed");
                }
            })
            .await;
    }

    /// Reassemble a completed carve into one archive object.
    ///
    /// Blocks are concatenated in block order. Returns the archive key.
    pub async fn archive(&self, session_id: &str) -> ApiResult<String> {
        let result = self.write_archive(session_id).await;
        let label = if result.is_ok() { "ok" } else { "failed" };
        crate::metrics::CARVES_ARCHIVED
            .with_label_values(&[label])
            .inc();
        result
    }

    async fn write_archive(&self, session_id: &str) -> ApiResult<String> {
        let carve = self
            .store
            .get_carve_by_session(session_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("carve session {session_id}")))?;
        if carve.carve_status() != Some(CarveStatus::Completed) {
            return Err(ApiError::BadRequest(format!(
                "carve session {session_id} is not completed"
            )));
        }

        let blocks = self.store.list_blocks(session_id).await?;
        if blocks.len() as i64 != carve.total_blocks {
            return Err(ApiError::Internal(format!(
                "carve session {session_id} has {} of {} blocks",
                blocks.len(),
                carve.total_blocks
            )));
        }
        let Some((first, rest)) = blocks.split_first() else {
            return Err(ApiError::Internal(format!(
                "carve session {session_id} has no blocks"
            )));
        };

        let first = self.block_bytes(first).await?;
        let name = archive_file_name(&carve.uuid, session_id, &carve.path, is_zstd(&first));
        let key = archive_key(&carve.env_id, &name);

        let mut upload = self.storage.put_stream(&key).await?;
        let mut written = first.len() as u64;
        if let Err(e) = upload.write(first).await {
            let _ = upload.abort().await;
            return Err(e.into());
        }
        for block in rest {
            let bytes = match self.block_bytes(block).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(e);
                }
            };
            written += bytes.len() as u64;
            if let Err(e) = upload.write(bytes).await {
                let _ = upload.abort().await;
                return Err(e.into());
            }
        }
        upload.finish().await?;

        self.store
            .mark_carve_archived(session_id, &key, OffsetDateTime::now_utc())
            .await?;
        tracing::info!(session_id, key = %key, bytes = written, "Carve archived");
        Ok(key)
    }

    async fn block_bytes(&self, block: &CarvedBlockRow) -> ApiResult<Bytes> {
        if let Some(data) = &block.data {
            return Ok(Bytes::from(data.clone()));
        }
        let key = block.storage_key.as_deref().ok_or_else(|| {
            ApiError::Internal(format!(
                "block {} of session {} has no data",
                block.block_id, block.session_id
            ))
        })?;
        Ok(self.storage.get(key).await?)
    }

    /// Look up a carve of `env_id` by its carve ID.
    pub async fn carve(&self, env_id: Uuid, carve_id: &str) -> ApiResult<CarvedFileRow> {
        self.store
            .get_carve(env_id, carve_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("carve {carve_id}")))
    }

    /// Carves of an environment, newest first.
    pub async fn list_carves(&self, env_id: Uuid) -> ApiResult<Vec<CarvedFileRow>> {
        Ok(self.store.list_carves(env_id).await?)
    }

    /// Mark a carve completed without checking its blocks.
    pub async fn complete_carve(&self, env_id: Uuid, carve_id: &str) -> ApiResult<()> {
        let at = OffsetDateTime::now_utc();
        if !self.store.complete_carve(env_id, carve_id, at).await? {
            return Err(ApiError::NotFound(format!("carve {carve_id}")));
        }
        Ok(())
    }

    /// Mark a carve expired; its session stops accepting blocks.
    pub async fn expire_carve(&self, env_id: Uuid, carve_id: &str) -> ApiResult<()> {
        let at = OffsetDateTime::now_utc();
        if !self.store.expire_carve(env_id, carve_id, at).await? {
            return Err(ApiError::NotFound(format!("carve {carve_id}")));
        }
        Ok(())
    }

    /// Mark a carve deleted; its session stops accepting blocks.
    ///
    /// Blocks and the archive held in object storage are removed as well.
    /// Removal failures are logged; the carve stays deleted.
    pub async fn delete_carve(&self, env_id: Uuid, carve_id: &str) -> ApiResult<()> {
        let carve = self.carve(env_id, carve_id).await?;
        let at = OffsetDateTime::now_utc();
        if !self.store.delete_carve(env_id, carve_id, at).await? {
            return Err(ApiError::NotFound(format!("carve {carve_id}")));
        }

        let mut keys = Vec::new();
        if let Some(session_id) = &carve.session_id
            && carve.carver == CarverBackend::Storage.as_str()
        {
            match self.storage.list(&block_prefix(&env_id, session_id)).await {
                Ok(found) => keys.extend(found),
                Err(e) => tracing::warn!(carve_id, error = %e, "Failed to list carve blocks"),
            }
        }
        keys.extend(carve.archive_path);

        for key in &keys {
            if let Err(e) = self.storage.delete(key).await {
                tracing::warn!(carve_id, key = %key, error = %e, "Failed to remove carve object");
            }
        }
        tracing::info!(carve_id, objects = keys.len(), "Carve deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_success() {
        let node_id = Uuid::from_u128(7);
        let accepted = BlockReceipt::Accepted {
            node_id,
            completed: false,
        };
        assert!(accepted.success());
        assert_eq!(accepted.node_id(), Some(node_id));
        assert!(BlockReceipt::Duplicate { node_id }.success());
        assert!(!BlockReceipt::Rejected.success());
        assert_eq!(BlockReceipt::Rejected.node_id(), None);
    }
}
