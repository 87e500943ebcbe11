//! Node log repository (database log sink).

use crate::error::MetadataResult;
use crate::models::NodeLogRow;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait LogRepo: Send + Sync {
    /// Store a batch of log entries.
    async fn insert_node_logs(&self, logs: &[NodeLogRow]) -> MetadataResult<()>;

    /// Logs of one device and type, oldest first.
    async fn list_node_logs(
        &self,
        env_id: Uuid,
        uuid: &str,
        log_type: &str,
    ) -> MetadataResult<Vec<NodeLogRow>>;
}
