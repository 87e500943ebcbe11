//! Environment repository.

use crate::error::MetadataResult;
use crate::models::EnvironmentRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for tenant environments.
#[async_trait]
pub trait EnvironmentRepo: Send + Sync {
    /// Create a new environment.
    async fn create_environment(&self, env: &EnvironmentRow) -> MetadataResult<()>;

    /// Get an environment by ID.
    async fn get_environment(&self, env_id: Uuid) -> MetadataResult<Option<EnvironmentRow>>;

    /// Get an environment by name.
    async fn get_environment_by_name(&self, name: &str) -> MetadataResult<Option<EnvironmentRow>>;

    /// List all environments.
    async fn list_environments(&self) -> MetadataResult<Vec<EnvironmentRow>>;

    /// Replace the mutable fields of an environment.
    async fn update_environment(&self, env: &EnvironmentRow) -> MetadataResult<()>;

    /// Ask agents to check in every `seconds` until `until`.
    async fn set_acceleration(
        &self,
        env_id: Uuid,
        until: Option<OffsetDateTime>,
        seconds: i64,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;
}
