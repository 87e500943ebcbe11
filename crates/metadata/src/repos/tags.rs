//! Tag repository.

use crate::error::MetadataResult;
use crate::models::TagRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for node tags.
#[async_trait]
pub trait TagRepo: Send + Sync {
    /// Create a tag in an environment.
    async fn create_tag(&self, tag: &TagRow) -> MetadataResult<()>;

    /// Get a tag by name within an environment.
    async fn get_tag_by_name(&self, env_id: Uuid, name: &str) -> MetadataResult<Option<TagRow>>;

    /// Attach a tag to a node. Attaching twice is a no-op.
    async fn tag_node(
        &self,
        tag_id: Uuid,
        node_id: Uuid,
        tagged_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Nodes carrying a tag.
    async fn tagged_node_ids(&self, tag_id: Uuid) -> MetadataResult<Vec<Uuid>>;
}
