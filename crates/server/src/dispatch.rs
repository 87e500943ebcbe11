//! Distributed query targeting and dispatch.
//!
//! A dispatch resolves every supplied target category to a node set inside
//! the dispatching environment, intersects the categories and assigns the
//! query to the survivors. Node queries and `expected` become visible in a
//! single commit, so no node can report before `expected` is final.

use crate::carving::CarvingEngine;
use crate::error::{ApiError, ApiResult};
use fleet_core::config::DispatchConfig;
use fleet_core::node::normalize_uuid;
use fleet_core::protocol::{CarveScheduledRow, QueryReadResponse, QueryWriteRequest};
use fleet_core::query::generate_query_name;
use fleet_core::{EnvId, QueryType, TargetSet, TargetSpec};
use fleet_metadata::MetadataStore;
use fleet_metadata::models::{DistributedQueryRow, EnvironmentRow, NodeRow};
use fleet_metadata::repos::{
    CarveRepo, EnvironmentRepo, NodeRepo, QueryRepo, RecordOutcome, ResultRecord, TagRepo,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A query to dispatch.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub creator: String,
    pub query: String,
    pub targets: TargetSpec,
    pub expiration: Option<OffsetDateTime>,
    pub hidden: bool,
}

/// A file carve to dispatch.
#[derive(Debug, Clone, Default)]
pub struct CarveRequest {
    pub creator: String,
    pub path: String,
    pub targets: TargetSpec,
    pub expiration: Option<OffsetDateTime>,
}

/// Result of a dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub query: DistributedQueryRow,
    pub targets: BTreeSet<Uuid>,
}

/// Summary of one query-write from a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Results that moved a pending node query.
    pub recorded: usize,
    /// Results for unknown or non-pending queries.
    pub ignored: usize,
    /// Queries completed by this write.
    pub completed: usize,
    /// Carves scheduled from carve results.
    pub carves_scheduled: usize,
}

pub struct Dispatcher {
    store: Arc<dyn MetadataStore>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn MetadataStore>, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    /// Resolve a target spec to a deduplicated node set within `env`.
    ///
    /// Categories are intersected. Names that resolve to nothing are
    /// skipped; an environment name belonging to another tenant is an error.
    #[tracing::instrument(skip(self, env, spec), fields(env_id = %env.env_id))]
    pub async fn resolve_targets(
        &self,
        env: &EnvironmentRow,
        spec: &TargetSpec,
        now: OffsetDateTime,
    ) -> ApiResult<BTreeSet<Uuid>> {
        let since = now - self.config.inactive_window();
        let mut set = TargetSet::new();

        if !spec.environments.is_empty() {
            let mut nodes = HashSet::new();
            for name in &spec.environments {
                let Some(target) = self.lookup_environment(name).await? else {
                    tracing::info!(environment = %name, "Skipping unknown target environment");
                    continue;
                };
                if target.env_id != env.env_id {
                    return Err(ApiError::BadRequest(format!(
                        "environment target {name} belongs to another tenant"
                    )));
                }
                nodes.extend(self.store.active_node_ids(env.env_id, since).await?);
            }
            set.constrain(nodes);
        }

        if !spec.platforms.is_empty() {
            let mut nodes = HashSet::new();
            for platform in &spec.platforms {
                let found = self
                    .store
                    .active_node_ids_by_platform(env.env_id, platform, since)
                    .await?;
                if found.is_empty() {
                    tracing::info!(platform = %platform, "No active nodes for target platform");
                }
                nodes.extend(found);
            }
            set.constrain(nodes);
        }

        if !spec.uuids.is_empty() {
            let mut nodes = HashSet::new();
            for uuid in &spec.uuids {
                match self
                    .store
                    .get_node_by_uuid(env.env_id, &normalize_uuid(uuid))
                    .await?
                {
                    Some(node) => {
                        nodes.insert(node.node_id);
                    }
                    None => tracing::info!(uuid = %uuid, "Skipping unknown target node"),
                }
            }
            set.constrain(nodes);
        }

        if !spec.hosts.is_empty() {
            let mut nodes = HashSet::new();
            for host in &spec.hosts {
                let found = self.store.node_ids_by_identifier(env.env_id, host).await?;
                if found.is_empty() {
                    tracing::info!(host = %host, "Skipping unknown target host");
                }
                nodes.extend(found);
            }
            set.constrain(nodes);
        }

        if !spec.tags.is_empty() {
            let mut nodes = HashSet::new();
            for name in &spec.tags {
                let Some(tag) = self.store.get_tag_by_name(env.env_id, name).await? else {
                    tracing::info!(tag = %name, "Skipping unknown target tag");
                    continue;
                };
                nodes.extend(self.store.tagged_node_ids(tag.tag_id).await?);
            }
            set.constrain(nodes);
        }

        Ok(set.into_nodes())
    }

    /// Environments may be named by UUID or by name.
    async fn lookup_environment(&self, name: &str) -> ApiResult<Option<EnvironmentRow>> {
        if let Ok(env_id) = EnvId::parse(name) {
            return Ok(self.store.get_environment(*env_id.as_uuid()).await?);
        }
        Ok(self.store.get_environment_by_name(name).await?)
    }

    /// Create an on-demand query and assign it to its targets.
    pub async fn dispatch_query(
        &self,
        env: &EnvironmentRow,
        request: QueryRequest,
    ) -> ApiResult<Dispatched> {
        if request.query.trim().is_empty() {
            return Err(ApiError::BadRequest("query must not be empty".to_string()));
        }
        self.dispatch(
            env,
            QueryType::Query,
            request.creator,
            request.query,
            None,
            &request.targets,
            request.expiration,
            request.hidden,
        )
        .await
    }

    /// Create a carve query for `path` and assign it to its targets.
    pub async fn dispatch_carve(
        &self,
        env: &EnvironmentRow,
        request: CarveRequest,
    ) -> ApiResult<Dispatched> {
        if request.path.trim().is_empty() {
            return Err(ApiError::BadRequest("carve path must not be empty".to_string()));
        }
        let query = fleet_core::carve::carve_query(&request.path);
        self.dispatch(
            env,
            QueryType::Carve,
            request.creator,
            query,
            Some(request.path),
            &request.targets,
            request.expiration,
            false,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        env: &EnvironmentRow,
        query_type: QueryType,
        creator: String,
        query: String,
        path: Option<String>,
        targets: &TargetSpec,
        expiration: Option<OffsetDateTime>,
        hidden: bool,
    ) -> ApiResult<Dispatched> {
        let now = OffsetDateTime::now_utc();
        let nodes = self.resolve_targets(env, targets, now).await?;

        let mut row = DistributedQueryRow {
            query_id: Uuid::new_v4(),
            env_id: env.env_id,
            name: generate_query_name(query_type),
            creator,
            query,
            query_type: query_type.as_str().to_string(),
            path,
            expected: 0,
            executions: 0,
            errors: 0,
            active: true,
            hidden,
            completed: false,
            deleted: false,
            expired: false,
            expiration,
            created_at: now,
            updated_at: now,
        };
        self.store.create_query(&row).await?;

        let node_ids: Vec<Uuid> = nodes.iter().copied().collect();
        row.expected = self.store.assign_targets(row.query_id, &node_ids, now).await?;

        crate::metrics::QUERIES_DISPATCHED
            .with_label_values(&[query_type.as_str()])
            .inc();
        tracing::info!(
            env_id = %env.env_id,
            query = %row.name,
            query_type = query_type.as_str(),
            expected = row.expected,
            "Dispatched distributed query"
        );

        Ok(Dispatched {
            query: row,
            targets: nodes,
        })
    }

    /// Pending queries for an authenticated node.
    pub async fn node_queries(
        &self,
        env: &EnvironmentRow,
        node: &NodeRow,
    ) -> ApiResult<QueryReadResponse> {
        let now = OffsetDateTime::now_utc();
        let queries = self
            .store
            .pending_queries(node.node_id, now)
            .await?
            .into_iter()
            .map(|q| (q.name, q.query))
            .collect();
        Ok(QueryReadResponse {
            queries,
            node_invalid: false,
            accelerate: env
                .is_accelerated(now)
                .then_some(env.accelerated_seconds),
        })
    }

    /// Record the results of one query-write.
    ///
    /// Names are resolved within the node's environment. Only a result for
    /// a pending node query is counted; anything else is ignored. Carve
    /// rows in any resolved result are handed to the carving engine, which
    /// schedules each carve once.
    #[tracing::instrument(skip(self, carving, node, request), fields(node_id = %node.node_id))]
    pub async fn record_results(
        &self,
        carving: &CarvingEngine,
        node: &NodeRow,
        request: &QueryWriteRequest,
    ) -> ApiResult<WriteSummary> {
        let mut summary = WriteSummary::default();
        let now = OffsetDateTime::now_utc();

        for name in request.query_names() {
            let Some(query) = self.store.get_query_by_name(node.env_id, &name).await? else {
                tracing::debug!(query = %name, "Result for unknown query");
                summary.ignored += 1;
                crate::metrics::QUERY_RESULTS
                    .with_label_values(&["unknown"])
                    .inc();
                continue;
            };

            let status = request.status_of(&name);
            let outcome = self
                .store
                .record_result(&ResultRecord {
                    query_id: query.query_id,
                    node_id: node.node_id,
                    uuid: node.uuid.clone(),
                    status,
                    message: request.messages.get(&name).cloned(),
                    recorded_at: now,
                })
                .await?;

            match outcome {
                RecordOutcome::NotPending => {
                    summary.ignored += 1;
                    crate::metrics::QUERY_RESULTS
                        .with_label_values(&["ignored"])
                        .inc();
                }
                RecordOutcome::Recorded { completed } => {
                    summary.recorded += 1;
                    let label = if status == 0 { "executed" } else { "error" };
                    crate::metrics::QUERY_RESULTS
                        .with_label_values(&[label])
                        .inc();
                    if completed {
                        summary.completed += 1;
                        tracing::info!(query = %name, "Distributed query completed");
                    }
                }
            }

            if let Some(result) = request.queries.get(&name) {
                for row in CarveScheduledRow::extract(result) {
                    if carving.schedule_from_result(node, &name, &row).await? {
                        summary.carves_scheduled += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Find a query of `env` by name.
    pub async fn query_by_name(
        &self,
        env_id: Uuid,
        name: &str,
    ) -> ApiResult<DistributedQueryRow> {
        self.store
            .get_query_by_name(env_id, name)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("query {name}")))
    }

    /// Queries of an environment, newest first.
    pub async fn list_queries(&self, env_id: Uuid) -> ApiResult<Vec<DistributedQueryRow>> {
        Ok(self.store.list_queries(env_id).await?)
    }

    /// Mark a query completed regardless of its counters.
    pub async fn complete_query(&self, env_id: Uuid, name: &str) -> ApiResult<()> {
        let query = self.query_by_name(env_id, name).await?;
        self.store
            .complete_query(query.query_id, OffsetDateTime::now_utc())
            .await?;
        Ok(())
    }

    /// Expire a query; for carves, unfinished carves created by it too.
    pub async fn expire_query(&self, env_id: Uuid, name: &str) -> ApiResult<()> {
        let query = self.query_by_name(env_id, name).await?;
        let now = OffsetDateTime::now_utc();
        self.store.expire_query(query.query_id, now).await?;
        if query.query_type == QueryType::Carve.as_str() {
            self.store
                .expire_carves_for_query(env_id, &query.name, now)
                .await?;
        }
        Ok(())
    }

    /// Delete a query.
    pub async fn delete_query(&self, env_id: Uuid, name: &str) -> ApiResult<()> {
        let query = self.query_by_name(env_id, name).await?;
        self.store
            .delete_query(query.query_id, OffsetDateTime::now_utc())
            .await?;
        Ok(())
    }

    /// Ask the agents of an environment to check in every `seconds` for the
    /// next `window`. Nodes see the change after the environment cache refresh.
    pub async fn accelerate(
        &self,
        env_id: Uuid,
        seconds: i64,
        window: time::Duration,
    ) -> ApiResult<()> {
        if seconds <= 0 || window <= time::Duration::ZERO {
            return Err(ApiError::BadRequest(
                "acceleration needs a positive interval and window".to_string(),
            ));
        }
        let now = OffsetDateTime::now_utc();
        self.store
            .set_acceleration(env_id, Some(now + window), seconds, now)
            .await?;
        tracing::info!(%env_id, seconds, until = %(now + window), "Environment accelerated");
        Ok(())
    }

    /// End an acceleration window early.
    pub async fn stop_acceleration(&self, env_id: Uuid) -> ApiResult<()> {
        let now = OffsetDateTime::now_utc();
        self.store.set_acceleration(env_id, None, 0, now).await?;
        Ok(())
    }

    /// Expire queries past their expiration, and the unfinished carves of
    /// expired carve queries. Returns the number of queries expired.
    pub async fn expire_due(&self, now: OffsetDateTime) -> ApiResult<usize> {
        let expired = self.store.expire_due_queries(now).await?;
        for query in &expired {
            crate::metrics::QUERIES_EXPIRED.inc();
            if query.query_type == QueryType::Carve.as_str() {
                let carves = self
                    .store
                    .expire_carves_for_query(query.env_id, &query.name, now)
                    .await?;
                tracing::debug!(query = %query.name, carves, "Expired carves of query");
            }
        }
        Ok(expired.len())
    }

    /// Spawn the periodic expiration sweep.
    pub fn spawn_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        let interval: Duration = self.config.maintenance_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.expire_due(OffsetDateTime::now_utc()).await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "Expired distributed queries"),
                    Err(e) => tracing::warn!(error = %e, "Query expiration sweep failed"),
                }
            }
        })
    }
}
