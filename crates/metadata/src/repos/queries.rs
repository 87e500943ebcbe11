//! Distributed query repository.

use crate::error::MetadataResult;
use crate::models::{DistributedQueryRow, NodeQueryRow, PendingQueryRow, QueryExecutionRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// A result reported by a node for one query.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub query_id: Uuid,
    pub node_id: Uuid,
    pub uuid: String,
    /// Agent status code; non-zero is an error.
    pub status: i64,
    pub message: Option<String>,
    pub recorded_at: OffsetDateTime,
}

/// Outcome of [`QueryRepo::record_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The node had no pending delivery of this query; nothing changed.
    NotPending,
    /// The result was counted. `completed` is true when it completed the query.
    Recorded { completed: bool },
}

/// Repository for distributed queries and their per-node state.
#[async_trait]
pub trait QueryRepo: Send + Sync {
    /// Insert a query with `expected = 0` and no targets.
    async fn create_query(&self, query: &DistributedQueryRow) -> MetadataResult<()>;

    /// Get a query by ID.
    async fn get_query(&self, query_id: Uuid) -> MetadataResult<Option<DistributedQueryRow>>;

    /// Get a query by name within an environment.
    async fn get_query_by_name(
        &self,
        env_id: Uuid,
        name: &str,
    ) -> MetadataResult<Option<DistributedQueryRow>>;

    /// List queries of an environment, newest first.
    async fn list_queries(&self, env_id: Uuid) -> MetadataResult<Vec<DistributedQueryRow>>;

    /// Insert pending node queries for every target and set `expected` to
    /// their count, in one transaction. Returns `expected`.
    async fn assign_targets(
        &self,
        query_id: Uuid,
        node_ids: &[Uuid],
        assigned_at: OffsetDateTime,
    ) -> MetadataResult<i64>;

    /// Get the delivery state of a query for one node.
    async fn get_node_query(
        &self,
        query_id: Uuid,
        node_id: Uuid,
    ) -> MetadataResult<Option<NodeQueryRow>>;

    /// Queries a node should run now.
    async fn pending_queries(
        &self,
        node_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<PendingQueryRow>>;

    /// Record a node's result.
    ///
    /// In one transaction: move the node query out of `pending`, bump
    /// `executions` or `errors`, append an execution record and mark the
    /// query completed once `executions + errors >= expected > 0`. A result
    /// without a pending node query changes nothing.
    async fn record_result(&self, record: &ResultRecord) -> MetadataResult<RecordOutcome>;

    /// Execution records of a query, oldest first.
    async fn list_executions(&self, query_id: Uuid) -> MetadataResult<Vec<QueryExecutionRow>>;

    /// Mark a query completed and inactive. Returns false if not found.
    async fn complete_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool>;

    /// Mark a query deleted and inactive. Returns false if not found.
    async fn delete_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool>;

    /// Mark a query expired and inactive. Returns false if not found.
    async fn expire_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool>;

    /// Expire every active query whose expiration has passed.
    /// Returns the queries that were expired.
    async fn expire_due_queries(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<DistributedQueryRow>>;
}
