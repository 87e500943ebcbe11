//! Node repository.

use crate::error::MetadataResult;
use crate::models::{ArchivedNodeRow, NodeRow, NodeSeenUpdate};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for enrolled nodes.
#[async_trait]
pub trait NodeRepo: Send + Sync {
    /// Insert a newly enrolled node.
    async fn create_node(&self, node: &NodeRow) -> MetadataResult<()>;

    /// Get a node by ID.
    async fn get_node(&self, node_id: Uuid) -> MetadataResult<Option<NodeRow>>;

    /// Get a node by its session key.
    async fn get_node_by_key(&self, node_key: &str) -> MetadataResult<Option<NodeRow>>;

    /// Get the live node for a device UUID within an environment.
    async fn get_node_by_uuid(&self, env_id: Uuid, uuid: &str) -> MetadataResult<Option<NodeRow>>;

    /// List the nodes of an environment.
    async fn list_nodes(&self, env_id: Uuid) -> MetadataResult<Vec<NodeRow>>;

    /// Re-enroll an existing node.
    ///
    /// In one transaction, the current row for `node.node_id` is copied to
    /// the archive with `trigger`, then replaced in place by `node`
    /// (keeping its ID and enrollment time).
    async fn reenroll_node(
        &self,
        node: &NodeRow,
        trigger: &str,
        archived_at: OffsetDateTime,
    ) -> MetadataResult<ArchivedNodeRow>;

    /// List archived snapshots of a device, newest first.
    async fn list_archived_nodes(
        &self,
        env_id: Uuid,
        uuid: &str,
    ) -> MetadataResult<Vec<ArchivedNodeRow>>;

    /// Apply coalesced check-ins in bulk. Returns the number of rows updated.
    async fn refresh_last_seen_batch(
        &self,
        updates: &[NodeSeenUpdate],
        seen_at: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Nodes of an environment seen since `since`.
    async fn active_node_ids(&self, env_id: Uuid, since: OffsetDateTime)
    -> MetadataResult<Vec<Uuid>>;

    /// Nodes of an environment with `platform` seen since `since`.
    async fn active_node_ids_by_platform(
        &self,
        env_id: Uuid,
        platform: &str,
        since: OffsetDateTime,
    ) -> MetadataResult<Vec<Uuid>>;

    /// Nodes matching `identifier` as UUID, host name or local name.
    async fn node_ids_by_identifier(
        &self,
        env_id: Uuid,
        identifier: &str,
    ) -> MetadataResult<Vec<Uuid>>;
}
