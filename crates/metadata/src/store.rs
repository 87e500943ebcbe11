//! Metadata store trait and the SQLite implementation.

use crate::batch::{Placeholder, SEEN_CHUNK_SIZE, SeenBind, seen_update_sql};
use crate::error::{MetadataError, MetadataResult};
use crate::repos::{CarveRepo, EnvironmentRepo, LogRepo, NodeRepo, QueryRepo, TagRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    EnvironmentRepo + NodeRepo + TagRepo + QueryRepo + CarveRepo + LogRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Create a new SQLite store and apply the schema.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(30));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MetadataError::Config(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers; concurrent carve blocks and
            // query results queue here instead of failing with SQLITE_BUSY.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout,
        };
        store.migrate().await?;

        tracing::info!(
            path = %path.display(),
            query_timeout_secs = query_timeout.as_secs(),
            "SQLite metadata store ready (query timeout is advisory only)"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn warn_if_slow(&self, operation: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.query_timeout {
            tracing::warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_secs = self.query_timeout.as_secs(),
                "SQLite operation exceeded query timeout"
            );
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{BlockOutcome, BlockWrite, RecordOutcome, ResultRecord};
    use fleet_core::{CarveStatus, NodeQueryStatus};
    use time::OffsetDateTime;
    use uuid::Uuid;

    // =========================================================================
    // Environments
    // =========================================================================

    #[async_trait]
    impl EnvironmentRepo for SqliteStore {
        async fn create_environment(&self, env: &EnvironmentRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO environments (
                    env_id, name, secret, enroll_secret_path, enroll_expire,
                    remove_secret_path, remove_expire, accept_enrolls, debug_http,
                    configuration, accelerate_until, accelerated_seconds, hostname,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(env.env_id)
            .bind(&env.name)
            .bind(&env.secret)
            .bind(&env.enroll_secret_path)
            .bind(env.enroll_expire)
            .bind(&env.remove_secret_path)
            .bind(env.remove_expire)
            .bind(env.accept_enrolls)
            .bind(env.debug_http)
            .bind(&env.configuration)
            .bind(env.accelerate_until)
            .bind(env.accelerated_seconds)
            .bind(&env.hostname)
            .bind(env.created_at)
            .bind(env.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MetadataError::from_insert(e, || format!("environment '{}' already exists", env.name))
            })?;
            Ok(())
        }

        async fn get_environment(&self, env_id: Uuid) -> MetadataResult<Option<EnvironmentRow>> {
            let row =
                sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments WHERE env_id = ?")
                    .bind(env_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn get_environment_by_name(
            &self,
            name: &str,
        ) -> MetadataResult<Option<EnvironmentRow>> {
            let row =
                sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_environments(&self) -> MetadataResult<Vec<EnvironmentRow>> {
            let rows =
                sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows)
        }

        async fn update_environment(&self, env: &EnvironmentRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE environments SET
                    name = ?, secret = ?, enroll_secret_path = ?, enroll_expire = ?,
                    remove_secret_path = ?, remove_expire = ?, accept_enrolls = ?,
                    debug_http = ?, configuration = ?, accelerate_until = ?,
                    accelerated_seconds = ?, hostname = ?, updated_at = ?
                WHERE env_id = ?
                "#,
            )
            .bind(&env.name)
            .bind(&env.secret)
            .bind(&env.enroll_secret_path)
            .bind(env.enroll_expire)
            .bind(&env.remove_secret_path)
            .bind(env.remove_expire)
            .bind(env.accept_enrolls)
            .bind(env.debug_http)
            .bind(&env.configuration)
            .bind(env.accelerate_until)
            .bind(env.accelerated_seconds)
            .bind(&env.hostname)
            .bind(env.updated_at)
            .bind(env.env_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "environment {} not found",
                    env.env_id
                )));
            }
            Ok(())
        }

        async fn set_acceleration(
            &self,
            env_id: Uuid,
            until: Option<OffsetDateTime>,
            seconds: i64,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE environments SET accelerate_until = ?, accelerated_seconds = ?, updated_at = ? WHERE env_id = ?",
            )
            .bind(until)
            .bind(seconds)
            .bind(updated_at)
            .bind(env_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "environment {env_id} not found"
                )));
            }
            Ok(())
        }
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    #[async_trait]
    impl NodeRepo for SqliteStore {
        async fn create_node(&self, node: &NodeRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO nodes (
                    node_id, env_id, uuid, node_key, platform, platform_version,
                    osquery_version, hostname, localname, ip_address, username, cpu,
                    memory, hardware_serial, config_hash, bytes_received, raw_enrollment,
                    last_seen, last_config, last_log, last_query_read, last_query_write,
                    last_carve, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(node.node_id)
            .bind(node.env_id)
            .bind(&node.uuid)
            .bind(&node.node_key)
            .bind(&node.platform)
            .bind(&node.platform_version)
            .bind(&node.osquery_version)
            .bind(&node.hostname)
            .bind(&node.localname)
            .bind(&node.ip_address)
            .bind(&node.username)
            .bind(&node.cpu)
            .bind(&node.memory)
            .bind(&node.hardware_serial)
            .bind(&node.config_hash)
            .bind(node.bytes_received)
            .bind(&node.raw_enrollment)
            .bind(node.last_seen)
            .bind(node.last_config)
            .bind(node.last_log)
            .bind(node.last_query_read)
            .bind(node.last_query_write)
            .bind(node.last_carve)
            .bind(node.created_at)
            .bind(node.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MetadataError::from_insert(e, || {
                    format!("node {} already enrolled in {}", node.uuid, node.env_id)
                })
            })?;
            Ok(())
        }

        async fn get_node(&self, node_id: Uuid) -> MetadataResult<Option<NodeRow>> {
            let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE node_id = ?")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_node_by_key(&self, node_key: &str) -> MetadataResult<Option<NodeRow>> {
            let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE node_key = ?")
                .bind(node_key)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_node_by_uuid(
            &self,
            env_id: Uuid,
            uuid: &str,
        ) -> MetadataResult<Option<NodeRow>> {
            let row =
                sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE env_id = ? AND uuid = ?")
                    .bind(env_id)
                    .bind(uuid)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_nodes(&self, env_id: Uuid) -> MetadataResult<Vec<NodeRow>> {
            let rows = sqlx::query_as::<_, NodeRow>(
                "SELECT * FROM nodes WHERE env_id = ? ORDER BY hostname, uuid",
            )
            .bind(env_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn reenroll_node(
            &self,
            node: &NodeRow,
            trigger: &str,
            archived_at: OffsetDateTime,
        ) -> MetadataResult<ArchivedNodeRow> {
            let mut tx = self.pool.begin().await?;

            let current = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE node_id = ?")
                .bind(node.node_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("node {} not found", node.node_id)))?;

            let archived = ArchivedNodeRow::snapshot(&current, trigger, archived_at);
            sqlx::query(
                r#"
                INSERT INTO archived_nodes (
                    archive_id, node_id, env_id, uuid, node_key, platform, platform_version,
                    osquery_version, hostname, localname, ip_address, hardware_serial,
                    raw_enrollment, archive_trigger, last_seen, enrolled_at, archived_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(archived.archive_id)
            .bind(archived.node_id)
            .bind(archived.env_id)
            .bind(&archived.uuid)
            .bind(&archived.node_key)
            .bind(&archived.platform)
            .bind(&archived.platform_version)
            .bind(&archived.osquery_version)
            .bind(&archived.hostname)
            .bind(&archived.localname)
            .bind(&archived.ip_address)
            .bind(&archived.hardware_serial)
            .bind(&archived.raw_enrollment)
            .bind(&archived.archive_trigger)
            .bind(archived.last_seen)
            .bind(archived.enrolled_at)
            .bind(archived.archived_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE nodes SET
                    node_key = ?, platform = ?, platform_version = ?, osquery_version = ?,
                    hostname = ?, localname = ?, ip_address = ?, username = ?, cpu = ?,
                    memory = ?, hardware_serial = ?, config_hash = ?, raw_enrollment = ?,
                    last_seen = ?, updated_at = ?
                WHERE node_id = ?
                "#,
            )
            .bind(&node.node_key)
            .bind(&node.platform)
            .bind(&node.platform_version)
            .bind(&node.osquery_version)
            .bind(&node.hostname)
            .bind(&node.localname)
            .bind(&node.ip_address)
            .bind(&node.username)
            .bind(&node.cpu)
            .bind(&node.memory)
            .bind(&node.hardware_serial)
            .bind(&node.config_hash)
            .bind(&node.raw_enrollment)
            .bind(node.last_seen)
            .bind(node.updated_at)
            .bind(node.node_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(archived)
        }

        async fn list_archived_nodes(
            &self,
            env_id: Uuid,
            uuid: &str,
        ) -> MetadataResult<Vec<ArchivedNodeRow>> {
            let rows = sqlx::query_as::<_, ArchivedNodeRow>(
                "SELECT * FROM archived_nodes WHERE env_id = ? AND uuid = ? ORDER BY archived_at DESC",
            )
            .bind(env_id)
            .bind(uuid)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn refresh_last_seen_batch(
            &self,
            updates: &[NodeSeenUpdate],
            seen_at: OffsetDateTime,
        ) -> MetadataResult<u64> {
            if updates.is_empty() {
                return Ok(0);
            }
            let started = Instant::now();
            let mut tx = self.pool.begin().await?;
            let mut updated = 0;

            for chunk in updates.chunks(SEEN_CHUNK_SIZE) {
                let built = seen_update_sql(chunk, seen_at, Placeholder::Question);
                let mut query = sqlx::query(&built.sql);
                for bind in built.binds {
                    query = match bind {
                        SeenBind::Time(t) => query.bind(t),
                        SeenBind::Id(id) => query.bind(id),
                        SeenBind::Text(s) => query.bind(s),
                        SeenBind::Int(n) => query.bind(n),
                    };
                }
                updated += query.execute(&mut *tx).await?.rows_affected();
            }

            tx.commit().await?;
            self.warn_if_slow("refresh_last_seen_batch", started);
            Ok(updated)
        }

        async fn active_node_ids(
            &self,
            env_id: Uuid,
            since: OffsetDateTime,
        ) -> MetadataResult<Vec<Uuid>> {
            let ids = sqlx::query_scalar::<_, Uuid>(
                "SELECT node_id FROM nodes WHERE env_id = ? AND last_seen >= ?",
            )
            .bind(env_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
            Ok(ids)
        }

        async fn active_node_ids_by_platform(
            &self,
            env_id: Uuid,
            platform: &str,
            since: OffsetDateTime,
        ) -> MetadataResult<Vec<Uuid>> {
            let ids = sqlx::query_scalar::<_, Uuid>(
                "SELECT node_id FROM nodes WHERE env_id = ? AND platform = ? AND last_seen >= ?",
            )
            .bind(env_id)
            .bind(platform)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
            Ok(ids)
        }

        async fn node_ids_by_identifier(
            &self,
            env_id: Uuid,
            identifier: &str,
        ) -> MetadataResult<Vec<Uuid>> {
            let ids = sqlx::query_scalar::<_, Uuid>(
                "SELECT node_id FROM nodes WHERE env_id = ? AND (uuid = ? OR hostname = ? OR localname = ?)",
            )
            .bind(env_id)
            .bind(fleet_core::node::normalize_uuid(identifier))
            .bind(identifier)
            .bind(identifier)
            .fetch_all(&self.pool)
            .await?;
            Ok(ids)
        }
    }

    // =========================================================================
    // Tags
    // =========================================================================

    #[async_trait]
    impl TagRepo for SqliteStore {
        async fn create_tag(&self, tag: &TagRow) -> MetadataResult<()> {
            sqlx::query("INSERT INTO tags (tag_id, env_id, name, created_at) VALUES (?, ?, ?, ?)")
                .bind(tag.tag_id)
                .bind(tag.env_id)
                .bind(&tag.name)
                .bind(tag.created_at)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    MetadataError::from_insert(e, || format!("tag '{}' already exists", tag.name))
                })?;
            Ok(())
        }

        async fn get_tag_by_name(&self, env_id: Uuid, name: &str) -> MetadataResult<Option<TagRow>> {
            let row = sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE env_id = ? AND name = ?")
                .bind(env_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn tag_node(
            &self,
            tag_id: Uuid,
            node_id: Uuid,
            tagged_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO tagged_nodes (tag_id, node_id, created_at) VALUES (?, ?, ?) ON CONFLICT(tag_id, node_id) DO NOTHING",
            )
            .bind(tag_id)
            .bind(node_id)
            .bind(tagged_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn tagged_node_ids(&self, tag_id: Uuid) -> MetadataResult<Vec<Uuid>> {
            let ids =
                sqlx::query_scalar::<_, Uuid>("SELECT node_id FROM tagged_nodes WHERE tag_id = ?")
                    .bind(tag_id)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(ids)
        }
    }

    // =========================================================================
    // Distributed queries
    // =========================================================================

    #[async_trait]
    impl QueryRepo for SqliteStore {
        async fn create_query(&self, query: &DistributedQueryRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO distributed_queries (
                    query_id, env_id, name, creator, query, query_type, path, expected,
                    executions, errors, active, hidden, completed, deleted, expired,
                    expiration, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(query.query_id)
            .bind(query.env_id)
            .bind(&query.name)
            .bind(&query.creator)
            .bind(&query.query)
            .bind(&query.query_type)
            .bind(&query.path)
            .bind(query.expected)
            .bind(query.executions)
            .bind(query.errors)
            .bind(query.active)
            .bind(query.hidden)
            .bind(query.completed)
            .bind(query.deleted)
            .bind(query.expired)
            .bind(query.expiration)
            .bind(query.created_at)
            .bind(query.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MetadataError::from_insert(e, || format!("query '{}' already exists", query.name))
            })?;
            Ok(())
        }

        async fn get_query(&self, query_id: Uuid) -> MetadataResult<Option<DistributedQueryRow>> {
            let row = sqlx::query_as::<_, DistributedQueryRow>(
                "SELECT * FROM distributed_queries WHERE query_id = ?",
            )
            .bind(query_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_query_by_name(
            &self,
            env_id: Uuid,
            name: &str,
        ) -> MetadataResult<Option<DistributedQueryRow>> {
            let row = sqlx::query_as::<_, DistributedQueryRow>(
                "SELECT * FROM distributed_queries WHERE env_id = ? AND name = ?",
            )
            .bind(env_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_queries(&self, env_id: Uuid) -> MetadataResult<Vec<DistributedQueryRow>> {
            let rows = sqlx::query_as::<_, DistributedQueryRow>(
                "SELECT * FROM distributed_queries WHERE env_id = ? ORDER BY created_at DESC",
            )
            .bind(env_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn assign_targets(
            &self,
            query_id: Uuid,
            node_ids: &[Uuid],
            assigned_at: OffsetDateTime,
        ) -> MetadataResult<i64> {
            let mut tx = self.pool.begin().await?;

            for node_id in node_ids {
                sqlx::query(
                    r#"
                    INSERT INTO node_queries (query_id, node_id, status, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(query_id, node_id) DO NOTHING
                    "#,
                )
                .bind(query_id)
                .bind(node_id)
                .bind(NodeQueryStatus::Pending.as_str())
                .bind(assigned_at)
                .bind(assigned_at)
                .execute(&mut *tx)
                .await?;
            }

            let expected: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM node_queries WHERE query_id = ?")
                    .bind(query_id)
                    .fetch_one(&mut *tx)
                    .await?;

            let result = sqlx::query(
                "UPDATE distributed_queries SET expected = ?, updated_at = ? WHERE query_id = ?",
            )
            .bind(expected)
            .bind(assigned_at)
            .bind(query_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "query {query_id} not found"
                )));
            }

            tx.commit().await?;
            Ok(expected)
        }

        async fn get_node_query(
            &self,
            query_id: Uuid,
            node_id: Uuid,
        ) -> MetadataResult<Option<NodeQueryRow>> {
            let row = sqlx::query_as::<_, NodeQueryRow>(
                "SELECT * FROM node_queries WHERE query_id = ? AND node_id = ?",
            )
            .bind(query_id)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn pending_queries(
            &self,
            node_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<PendingQueryRow>> {
            let rows = sqlx::query_as::<_, PendingQueryRow>(
                r#"
                SELECT q.name, q.query
                FROM node_queries nq
                JOIN distributed_queries q ON q.query_id = nq.query_id
                WHERE nq.node_id = ?
                  AND nq.status = ?
                  AND q.active = 1
                  AND q.completed = 0
                  AND q.deleted = 0
                  AND q.expired = 0
                  AND (q.expiration IS NULL OR q.expiration > ?)
                ORDER BY q.created_at
                "#,
            )
            .bind(node_id)
            .bind(NodeQueryStatus::Pending.as_str())
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn record_result(&self, record: &ResultRecord) -> MetadataResult<RecordOutcome> {
            let status = NodeQueryStatus::from_result_code(record.status);
            let mut tx = self.pool.begin().await?;

            let moved = sqlx::query(
                "UPDATE node_queries SET status = ?, updated_at = ? WHERE query_id = ? AND node_id = ? AND status = ?",
            )
            .bind(status.as_str())
            .bind(record.recorded_at)
            .bind(record.query_id)
            .bind(record.node_id)
            .bind(NodeQueryStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;

            if moved.rows_affected() == 0 {
                return Ok(RecordOutcome::NotPending);
            }

            let (executions, errors) = match status {
                NodeQueryStatus::Error => (0i64, 1i64),
                _ => (1, 0),
            };
            sqlx::query(
                "UPDATE distributed_queries SET executions = executions + ?, errors = errors + ?, updated_at = ? WHERE query_id = ?",
            )
            .bind(executions)
            .bind(errors)
            .bind(record.recorded_at)
            .bind(record.query_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO query_executions (execution_id, query_id, node_id, uuid, status, message, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(record.query_id)
            .bind(record.node_id)
            .bind(&record.uuid)
            .bind(record.status)
            .bind(&record.message)
            .bind(record.recorded_at)
            .execute(&mut *tx)
            .await?;

            let completed = sqlx::query(
                r#"
                UPDATE distributed_queries SET completed = 1, active = 0, updated_at = ?
                WHERE query_id = ? AND completed = 0 AND expected > 0
                  AND executions + errors >= expected
                "#,
            )
            .bind(record.recorded_at)
            .bind(record.query_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(RecordOutcome::Recorded {
                completed: completed.rows_affected() > 0,
            })
        }

        async fn list_executions(&self, query_id: Uuid) -> MetadataResult<Vec<QueryExecutionRow>> {
            let rows = sqlx::query_as::<_, QueryExecutionRow>(
                "SELECT * FROM query_executions WHERE query_id = ? ORDER BY created_at",
            )
            .bind(query_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn complete_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE distributed_queries SET completed = 1, active = 0, updated_at = ? WHERE query_id = ?",
            )
            .bind(at)
            .bind(query_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE distributed_queries SET deleted = 1, active = 0, updated_at = ? WHERE query_id = ?",
            )
            .bind(at)
            .bind(query_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn expire_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE distributed_queries SET expired = 1, active = 0, updated_at = ? WHERE query_id = ?",
            )
            .bind(at)
            .bind(query_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn expire_due_queries(
            &self,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<DistributedQueryRow>> {
            let mut tx = self.pool.begin().await?;

            let due = sqlx::query_as::<_, DistributedQueryRow>(
                "SELECT * FROM distributed_queries WHERE active = 1 AND expiration IS NOT NULL AND expiration <= ?",
            )
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

            if !due.is_empty() {
                sqlx::query(
                    "UPDATE distributed_queries SET expired = 1, active = 0, updated_at = ? WHERE active = 1 AND expiration IS NOT NULL AND expiration <= ?",
                )
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(due)
        }
    }

    // =========================================================================
    // Carves
    // =========================================================================

    #[async_trait]
    impl CarveRepo for SqliteStore {
        async fn create_carve(&self, carve: &CarvedFileRow) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO carved_files (
                    carve_file_id, env_id, node_id, uuid, carve_id, request_id, session_id,
                    query_name, path, carve_size, block_size, total_blocks, completed_blocks,
                    status, carver, archived, archive_path, deleted, expired, created_at,
                    updated_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(env_id, carve_id) DO UPDATE SET
                    path = CASE WHEN carved_files.path = '' THEN excluded.path ELSE carved_files.path END,
                    query_name = COALESCE(carved_files.query_name, excluded.query_name),
                    updated_at = excluded.updated_at
                WHERE carved_files.node_id = excluded.node_id
                    AND (carved_files.path = '' OR carved_files.query_name IS NULL)
                "#,
            )
            .bind(carve.carve_file_id)
            .bind(carve.env_id)
            .bind(carve.node_id)
            .bind(&carve.uuid)
            .bind(&carve.carve_id)
            .bind(&carve.request_id)
            .bind(&carve.session_id)
            .bind(&carve.query_name)
            .bind(&carve.path)
            .bind(carve.carve_size)
            .bind(carve.block_size)
            .bind(carve.total_blocks)
            .bind(carve.completed_blocks)
            .bind(&carve.status)
            .bind(&carve.carver)
            .bind(carve.archived)
            .bind(&carve.archive_path)
            .bind(carve.deleted)
            .bind(carve.expired)
            .bind(carve.created_at)
            .bind(carve.updated_at)
            .bind(carve.completed_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_carve(
            &self,
            env_id: Uuid,
            carve_id: &str,
        ) -> MetadataResult<Option<CarvedFileRow>> {
            let row = sqlx::query_as::<_, CarvedFileRow>(
                "SELECT * FROM carved_files WHERE env_id = ? AND carve_id = ?",
            )
            .bind(env_id)
            .bind(carve_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_carve_by_session(
            &self,
            session_id: &str,
        ) -> MetadataResult<Option<CarvedFileRow>> {
            let row = sqlx::query_as::<_, CarvedFileRow>(
                "SELECT * FROM carved_files WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_carves(&self, env_id: Uuid) -> MetadataResult<Vec<CarvedFileRow>> {
            let rows = sqlx::query_as::<_, CarvedFileRow>(
                "SELECT * FROM carved_files WHERE env_id = ? ORDER BY created_at DESC",
            )
            .bind(env_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn initialize_carve(&self, carve: &CarvedFileRow) -> MetadataResult<CarvedFileRow> {
            let session_id = carve.session_id.as_deref().ok_or_else(|| {
                MetadataError::Constraint("carve initialization requires a session_id".to_string())
            })?;
            let mut tx = self.pool.begin().await?;

            let promoted = sqlx::query(
                r#"
                UPDATE carved_files SET
                    session_id = ?, request_id = ?, carve_size = ?, block_size = ?,
                    total_blocks = ?, completed_blocks = 0, status = ?, carver = ?, updated_at = ?
                WHERE env_id = ? AND carve_id = ? AND node_id = ? AND status = ?
                  AND deleted = 0 AND expired = 0
                "#,
            )
            .bind(session_id)
            .bind(&carve.request_id)
            .bind(carve.carve_size)
            .bind(carve.block_size)
            .bind(carve.total_blocks)
            .bind(CarveStatus::Initialized.as_str())
            .bind(&carve.carver)
            .bind(carve.updated_at)
            .bind(carve.env_id)
            .bind(&carve.carve_id)
            .bind(carve.node_id)
            .bind(CarveStatus::Scheduled.as_str())
            .execute(&mut *tx)
            .await?;

            if promoted.rows_affected() == 0 {
                sqlx::query(
                    r#"
                    INSERT INTO carved_files (
                        carve_file_id, env_id, node_id, uuid, carve_id, request_id, session_id,
                        query_name, path, carve_size, block_size, total_blocks, completed_blocks,
                        status, carver, archived, archive_path, deleted, expired, created_at,
                        updated_at, completed_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(carve.carve_file_id)
                .bind(carve.env_id)
                .bind(carve.node_id)
                .bind(&carve.uuid)
                .bind(&carve.carve_id)
                .bind(&carve.request_id)
                .bind(session_id)
                .bind(&carve.query_name)
                .bind(&carve.path)
                .bind(carve.carve_size)
                .bind(carve.block_size)
                .bind(carve.total_blocks)
                .bind(0i64)
                .bind(CarveStatus::Initialized.as_str())
                .bind(&carve.carver)
                .bind(false)
                .bind(None::<String>)
                .bind(false)
                .bind(false)
                .bind(carve.created_at)
                .bind(carve.updated_at)
                .bind(None::<OffsetDateTime>)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    MetadataError::from_insert(e, || {
                        format!("carve {} already initialized", carve.carve_id)
                    })
                })?;
            }

            let row = sqlx::query_as::<_, CarvedFileRow>(
                "SELECT * FROM carved_files WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }

        async fn record_block(&self, block: &BlockWrite) -> MetadataResult<BlockOutcome> {
            let started = Instant::now();
            let mut tx = self.pool.begin().await?;

            let Some(carve) = sqlx::query_as::<_, CarvedFileRow>(
                "SELECT * FROM carved_files WHERE session_id = ?",
            )
            .bind(&block.session_id)
            .fetch_optional(&mut *tx)
            .await?
            else {
                return Ok(BlockOutcome::Rejected);
            };

            let open = carve.carve_status().is_some_and(|s| s.accepts_blocks());
            if carve.env_id != block.env_id
                || carve.request_id.trim() != block.request_id.trim()
                || carve.deleted
                || carve.expired
                || !open
                || block.block_id < 0
                || block.block_id >= carve.total_blocks
            {
                return Ok(BlockOutcome::Rejected);
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO carved_blocks (session_id, block_id, env_id, data, size, storage_key, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(session_id, block_id) DO NOTHING
                "#,
            )
            .bind(&block.session_id)
            .bind(block.block_id)
            .bind(block.env_id)
            .bind(&block.data)
            .bind(block.size)
            .bind(&block.storage_key)
            .bind(block.received_at)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                return Ok(BlockOutcome::Duplicate);
            }

            let advanced = sqlx::query(
                r#"
                UPDATE carved_files SET
                    completed_blocks = completed_blocks + 1,
                    status = CASE WHEN completed_blocks + 1 >= total_blocks THEN ? ELSE ? END,
                    completed_at = CASE WHEN completed_blocks + 1 >= total_blocks THEN ? ELSE completed_at END,
                    updated_at = ?
                WHERE carve_file_id = ? AND completed_blocks < total_blocks
                "#,
            )
            .bind(CarveStatus::Completed.as_str())
            .bind(CarveStatus::InProgress.as_str())
            .bind(block.received_at)
            .bind(block.received_at)
            .bind(carve.carve_file_id)
            .execute(&mut *tx)
            .await?;

            if advanced.rows_affected() == 0 {
                return Err(MetadataError::Internal(format!(
                    "carve session {} accepted a new block past its total",
                    block.session_id
                )));
            }

            let updated = sqlx::query_as::<_, CarvedFileRow>(
                "SELECT * FROM carved_files WHERE carve_file_id = ?",
            )
            .bind(carve.carve_file_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            self.warn_if_slow("record_block", started);
            Ok(BlockOutcome::Accepted(updated))
        }

        async fn list_blocks(&self, session_id: &str) -> MetadataResult<Vec<CarvedBlockRow>> {
            let rows = sqlx::query_as::<_, CarvedBlockRow>(
                "SELECT * FROM carved_blocks WHERE session_id = ? ORDER BY block_id",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn mark_carve_archived(
            &self,
            session_id: &str,
            archive_path: &str,
            at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE carved_files SET archived = 1, archive_path = ?, updated_at = ? WHERE session_id = ?",
            )
            .bind(archive_path)
            .bind(at)
            .bind(session_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "carve session {session_id} not found"
                )));
            }
            Ok(())
        }

        async fn complete_carve(
            &self,
            env_id: Uuid,
            carve_id: &str,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE carved_files SET status = ?, completed_at = COALESCE(completed_at, ?), updated_at = ? WHERE env_id = ? AND carve_id = ?",
            )
            .bind(CarveStatus::Completed.as_str())
            .bind(at)
            .bind(at)
            .bind(env_id)
            .bind(carve_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_carve(
            &self,
            env_id: Uuid,
            carve_id: &str,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE carved_files SET deleted = 1, updated_at = ? WHERE env_id = ? AND carve_id = ?",
            )
            .bind(at)
            .bind(env_id)
            .bind(carve_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn expire_carve(
            &self,
            env_id: Uuid,
            carve_id: &str,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE carved_files SET expired = 1, updated_at = ? WHERE env_id = ? AND carve_id = ?",
            )
            .bind(at)
            .bind(env_id)
            .bind(carve_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn expire_carves_for_query(
            &self,
            env_id: Uuid,
            query_name: &str,
            at: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE carved_files SET expired = 1, updated_at = ? WHERE env_id = ? AND query_name = ? AND status != ? AND expired = 0",
            )
            .bind(at)
            .bind(env_id)
            .bind(query_name)
            .bind(CarveStatus::Completed.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    // =========================================================================
    // Node logs
    // =========================================================================

    #[async_trait]
    impl LogRepo for SqliteStore {
        async fn insert_node_logs(&self, logs: &[NodeLogRow]) -> MetadataResult<()> {
            if logs.is_empty() {
                return Ok(());
            }
            let mut tx = self.pool.begin().await?;
            for log in logs {
                sqlx::query(
                    "INSERT INTO node_logs (log_id, env_id, uuid, log_type, payload, created_at) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(log.log_id)
                .bind(log.env_id)
                .bind(&log.uuid)
                .bind(&log.log_type)
                .bind(&log.payload)
                .bind(log.created_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn list_node_logs(
            &self,
            env_id: Uuid,
            uuid: &str,
            log_type: &str,
        ) -> MetadataResult<Vec<NodeLogRow>> {
            let rows = sqlx::query_as::<_, NodeLogRow>(
                "SELECT * FROM node_logs WHERE env_id = ? AND uuid = ? AND log_type = ? ORDER BY created_at",
            )
            .bind(env_id)
            .bind(uuid)
            .bind(log_type)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Tenant environments
CREATE TABLE IF NOT EXISTS environments (
    env_id BLOB PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    secret TEXT NOT NULL,
    enroll_secret_path TEXT NOT NULL DEFAULT '',
    enroll_expire TEXT,
    remove_secret_path TEXT NOT NULL DEFAULT '',
    remove_expire TEXT,
    accept_enrolls INTEGER NOT NULL DEFAULT 1,
    debug_http INTEGER NOT NULL DEFAULT 0,
    configuration TEXT NOT NULL DEFAULT '{}',
    accelerate_until TEXT,
    accelerated_seconds INTEGER NOT NULL DEFAULT 0,
    hostname TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Enrolled nodes
CREATE TABLE IF NOT EXISTS nodes (
    node_id BLOB PRIMARY KEY,
    env_id BLOB NOT NULL REFERENCES environments(env_id),
    uuid TEXT NOT NULL,
    node_key TEXT NOT NULL UNIQUE,
    platform TEXT NOT NULL DEFAULT '',
    platform_version TEXT NOT NULL DEFAULT '',
    osquery_version TEXT NOT NULL DEFAULT '',
    hostname TEXT NOT NULL DEFAULT '',
    localname TEXT NOT NULL DEFAULT '',
    ip_address TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT '',
    cpu TEXT NOT NULL DEFAULT '',
    memory TEXT NOT NULL DEFAULT '',
    hardware_serial TEXT NOT NULL DEFAULT '',
    config_hash TEXT NOT NULL DEFAULT '',
    bytes_received INTEGER NOT NULL DEFAULT 0,
    raw_enrollment TEXT NOT NULL DEFAULT '',
    last_seen TEXT NOT NULL,
    last_config TEXT,
    last_log TEXT,
    last_query_read TEXT,
    last_query_write TEXT,
    last_carve TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
-- At most one live row per device and environment
CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_env_uuid ON nodes(env_id, uuid);
CREATE INDEX IF NOT EXISTS idx_nodes_env_platform ON nodes(env_id, platform, last_seen);
CREATE INDEX IF NOT EXISTS idx_nodes_env_hostname ON nodes(env_id, hostname);
CREATE INDEX IF NOT EXISTS idx_nodes_env_last_seen ON nodes(env_id, last_seen);

-- Snapshots of replaced node rows
CREATE TABLE IF NOT EXISTS archived_nodes (
    archive_id BLOB PRIMARY KEY,
    node_id BLOB NOT NULL,
    env_id BLOB NOT NULL,
    uuid TEXT NOT NULL,
    node_key TEXT NOT NULL,
    platform TEXT NOT NULL,
    platform_version TEXT NOT NULL,
    osquery_version TEXT NOT NULL,
    hostname TEXT NOT NULL,
    localname TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    hardware_serial TEXT NOT NULL,
    raw_enrollment TEXT NOT NULL,
    archive_trigger TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    enrolled_at TEXT NOT NULL,
    archived_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_archived_nodes_env_uuid ON archived_nodes(env_id, uuid);

-- Tags
CREATE TABLE IF NOT EXISTS tags (
    tag_id BLOB PRIMARY KEY,
    env_id BLOB NOT NULL REFERENCES environments(env_id),
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tags_env_name ON tags(env_id, name);

CREATE TABLE IF NOT EXISTS tagged_nodes (
    tag_id BLOB NOT NULL REFERENCES tags(tag_id) ON DELETE CASCADE,
    node_id BLOB NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    PRIMARY KEY (tag_id, node_id)
);

-- Distributed queries
CREATE TABLE IF NOT EXISTS distributed_queries (
    query_id BLOB PRIMARY KEY,
    env_id BLOB NOT NULL REFERENCES environments(env_id),
    name TEXT NOT NULL UNIQUE,
    creator TEXT NOT NULL,
    query TEXT NOT NULL,
    query_type TEXT NOT NULL,
    path TEXT,
    expected INTEGER NOT NULL DEFAULT 0,
    executions INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    hidden INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    expired INTEGER NOT NULL DEFAULT 0,
    expiration TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_distributed_queries_env ON distributed_queries(env_id, created_at);
CREATE INDEX IF NOT EXISTS idx_distributed_queries_expiration ON distributed_queries(active, expiration);

CREATE TABLE IF NOT EXISTS node_queries (
    query_id BLOB NOT NULL REFERENCES distributed_queries(query_id) ON DELETE CASCADE,
    node_id BLOB NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (query_id, node_id)
);
CREATE INDEX IF NOT EXISTS idx_node_queries_node_status ON node_queries(node_id, status);

CREATE TABLE IF NOT EXISTS query_executions (
    execution_id BLOB PRIMARY KEY,
    query_id BLOB NOT NULL REFERENCES distributed_queries(query_id) ON DELETE CASCADE,
    node_id BLOB NOT NULL,
    uuid TEXT NOT NULL,
    status INTEGER NOT NULL,
    message TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_query_executions_query ON query_executions(query_id, created_at);

-- File carves
CREATE TABLE IF NOT EXISTS carved_files (
    carve_file_id BLOB PRIMARY KEY,
    env_id BLOB NOT NULL REFERENCES environments(env_id),
    node_id BLOB NOT NULL,
    uuid TEXT NOT NULL,
    carve_id TEXT NOT NULL,
    request_id TEXT NOT NULL,
    session_id TEXT,
    query_name TEXT,
    path TEXT NOT NULL DEFAULT '',
    carve_size INTEGER NOT NULL DEFAULT 0,
    block_size INTEGER NOT NULL DEFAULT 0,
    total_blocks INTEGER NOT NULL DEFAULT 0,
    completed_blocks INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    carver TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    archive_path TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    expired INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_carved_files_env_carve ON carved_files(env_id, carve_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_carved_files_session ON carved_files(session_id);
CREATE INDEX IF NOT EXISTS idx_carved_files_query ON carved_files(env_id, query_name);

CREATE TABLE IF NOT EXISTS carved_blocks (
    session_id TEXT NOT NULL,
    block_id INTEGER NOT NULL,
    env_id BLOB NOT NULL,
    data BLOB,
    size INTEGER NOT NULL,
    storage_key TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (session_id, block_id)
);

-- Logs stored by the database log sink
CREATE TABLE IF NOT EXISTS node_logs (
    log_id BLOB PRIMARY KEY,
    env_id BLOB NOT NULL,
    uuid TEXT NOT NULL,
    log_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_node_logs_env_uuid ON node_logs(env_id, uuid, log_type, created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use crate::repos::{BlockOutcome, BlockWrite, RecordOutcome, ResultRecord};
    use fleet_core::{CarveStatus, ChannelSet, NodeChannel};
    use time::OffsetDateTime;
    use uuid::Uuid;

    async fn store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"), None)
            .await
            .unwrap();
        (store, dir)
    }

    fn env_row() -> EnvironmentRow {
        let now = OffsetDateTime::now_utc();
        EnvironmentRow {
            env_id: Uuid::new_v4(),
            name: format!("env-{}", Uuid::new_v4()),
            secret: "secret".to_string(),
            enroll_secret_path: "enroll".to_string(),
            enroll_expire: None,
            remove_secret_path: "remove".to_string(),
            remove_expire: None,
            accept_enrolls: true,
            debug_http: false,
            configuration: "{}".to_string(),
            accelerate_until: None,
            accelerated_seconds: 0,
            hostname: "localhost".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn node_row(env_id: Uuid, uuid: &str) -> NodeRow {
        let now = OffsetDateTime::now_utc();
        NodeRow {
            node_id: Uuid::new_v4(),
            env_id,
            uuid: uuid.to_string(),
            node_key: Uuid::new_v4().simple().to_string(),
            platform: "linux".to_string(),
            platform_version: String::new(),
            osquery_version: "5.0.0".to_string(),
            hostname: format!("host-{uuid}"),
            localname: String::new(),
            ip_address: "10.0.0.1".to_string(),
            username: String::new(),
            cpu: String::new(),
            memory: String::new(),
            hardware_serial: String::new(),
            config_hash: String::new(),
            bytes_received: 0,
            raw_enrollment: "{}".to_string(),
            last_seen: now,
            last_config: None,
            last_log: None,
            last_query_read: None,
            last_query_write: None,
            last_carve: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn carve_row(env_id: Uuid, node_id: Uuid, session: &str, total: i64) -> CarvedFileRow {
        let now = OffsetDateTime::now_utc();
        CarvedFileRow {
            carve_file_id: Uuid::new_v4(),
            env_id,
            node_id,
            uuid: "NODE".to_string(),
            carve_id: format!("guid-{session}"),
            request_id: "req".to_string(),
            session_id: Some(session.to_string()),
            query_name: None,
            path: "/etc/hosts".to_string(),
            carve_size: total * 4,
            block_size: 4,
            total_blocks: total,
            completed_blocks: 0,
            status: CarveStatus::Initialized.as_str().to_string(),
            carver: "db".to_string(),
            archived: false,
            archive_path: None,
            deleted: false,
            expired: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn block(env_id: Uuid, session: &str, block_id: i64) -> BlockWrite {
        BlockWrite {
            env_id,
            session_id: session.to_string(),
            request_id: "req".to_string(),
            block_id,
            data: Some(vec![block_id as u8; 4]),
            size: 4,
            storage_key: None,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_uuid_in_environment_rejected() {
        let (store, _dir) = store().await;
        let env = env_row();
        store.create_environment(&env).await.unwrap();

        store.create_node(&node_row(env.env_id, "A")).await.unwrap();
        let err = store
            .create_node(&node_row(env.env_id, "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_reenroll_archives_previous_row() {
        let (store, _dir) = store().await;
        let env = env_row();
        store.create_environment(&env).await.unwrap();
        let node = node_row(env.env_id, "A");
        store.create_node(&node).await.unwrap();

        let mut replacement = node.clone();
        replacement.node_key = "new-key".to_string();
        let archived = store
            .reenroll_node(&replacement, "exists", OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(archived.node_key, node.node_key);
        assert_eq!(archived.archive_trigger, "exists");

        let live = store.get_node_by_uuid(env.env_id, "A").await.unwrap().unwrap();
        assert_eq!(live.node_id, node.node_id);
        assert_eq!(live.node_key, "new-key");
        assert!(store.get_node_by_key(&node.node_key).await.unwrap().is_none());
        assert_eq!(
            store.list_archived_nodes(env.env_id, "A").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_refresh_last_seen_batch() {
        let (store, _dir) = store().await;
        let env = env_row();
        store.create_environment(&env).await.unwrap();
        let a = node_row(env.env_id, "A");
        let b = node_row(env.env_id, "B");
        store.create_node(&a).await.unwrap();
        store.create_node(&b).await.unwrap();

        let mut channels = ChannelSet::from(NodeChannel::Log);
        channels.insert(NodeChannel::Config);
        let seen_at = OffsetDateTime::now_utc() + time::Duration::minutes(1);
        let updated = store
            .refresh_last_seen_batch(
                &[
                    NodeSeenUpdate {
                        node_id: a.node_id,
                        ip_address: Some("192.168.1.5".to_string()),
                        channels,
                        bytes_received: 512,
                    },
                    NodeSeenUpdate {
                        node_id: b.node_id,
                        ip_address: None,
                        channels: ChannelSet::from(NodeChannel::QueryRead),
                        bytes_received: 0,
                    },
                ],
                seen_at,
            )
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let a = store.get_node(a.node_id).await.unwrap().unwrap();
        assert_eq!(a.ip_address, "192.168.1.5");
        assert_eq!(a.bytes_received, 512);
        assert_eq!(a.last_seen, seen_at);
        assert_eq!(a.last_log, Some(seen_at));
        assert_eq!(a.last_config, Some(seen_at));
        assert!(a.last_query_read.is_none());

        let b = store.get_node(b.node_id).await.unwrap().unwrap();
        assert_eq!(b.ip_address, "10.0.0.1");
        assert_eq!(b.last_query_read, Some(seen_at));
        assert!(b.last_log.is_none());
    }

    #[tokio::test]
    async fn test_record_result_counts_once() {
        let (store, _dir) = store().await;
        let env = env_row();
        store.create_environment(&env).await.unwrap();
        let node = node_row(env.env_id, "A");
        store.create_node(&node).await.unwrap();

        let now = OffsetDateTime::now_utc();
        let query = DistributedQueryRow {
            query_id: Uuid::new_v4(),
            env_id: env.env_id,
            name: "query_test".to_string(),
            creator: "admin".to_string(),
            query: "SELECT 1;".to_string(),
            query_type: "query".to_string(),
            path: None,
            expected: 0,
            executions: 0,
            errors: 0,
            active: true,
            hidden: false,
            completed: false,
            deleted: false,
            expired: false,
            expiration: None,
            created_at: now,
            updated_at: now,
        };
        store.create_query(&query).await.unwrap();
        let expected = store
            .assign_targets(query.query_id, &[node.node_id], now)
            .await
            .unwrap();
        assert_eq!(expected, 1);
        assert_eq!(store.pending_queries(node.node_id, now).await.unwrap().len(), 1);

        let record = ResultRecord {
            query_id: query.query_id,
            node_id: node.node_id,
            uuid: "A".to_string(),
            status: 0,
            message: None,
            recorded_at: now,
        };
        assert_eq!(
            store.record_result(&record).await.unwrap(),
            RecordOutcome::Recorded { completed: true }
        );
        assert_eq!(
            store.record_result(&record).await.unwrap(),
            RecordOutcome::NotPending
        );

        let stored = store.get_query(query.query_id).await.unwrap().unwrap();
        assert_eq!(stored.executions, 1);
        assert_eq!(stored.errors, 0);
        assert!(stored.completed);
        assert!(!stored.active);
        assert_eq!(store.list_executions(query.query_id).await.unwrap().len(), 1);
        assert!(store.pending_queries(node.node_id, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_block_lifecycle() {
        let (store, _dir) = store().await;
        let env = env_row();
        store.create_environment(&env).await.unwrap();
        let node = node_row(env.env_id, "A");
        store.create_node(&node).await.unwrap();

        let carve = carve_row(env.env_id, node.node_id, "s1", 2);
        store.initialize_carve(&carve).await.unwrap();

        let first = store.record_block(&block(env.env_id, "s1", 1)).await.unwrap();
        match first {
            BlockOutcome::Accepted(row) => {
                assert_eq!(row.completed_blocks, 1);
                assert_eq!(row.status, "IN PROGRESS");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let dup = store.record_block(&block(env.env_id, "s1", 1)).await.unwrap();
        assert!(matches!(dup, BlockOutcome::Duplicate));

        let out_of_range = store.record_block(&block(env.env_id, "s1", 2)).await.unwrap();
        assert!(matches!(out_of_range, BlockOutcome::Rejected));

        let mut wrong_request = block(env.env_id, "s1", 0);
        wrong_request.request_id = "other".to_string();
        assert!(matches!(
            store.record_block(&wrong_request).await.unwrap(),
            BlockOutcome::Rejected
        ));

        let last = store.record_block(&block(env.env_id, "s1", 0)).await.unwrap();
        match last {
            BlockOutcome::Accepted(row) => {
                assert_eq!(row.completed_blocks, 2);
                assert_eq!(row.status, "COMPLETED");
                assert!(row.completed_at.is_some());
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let blocks = store.list_blocks("s1").await.unwrap();
        assert_eq!(
            blocks.iter().map(|b| b.block_id).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn test_initialize_promotes_scheduled_carve() {
        let (store, _dir) = store().await;
        let env = env_row();
        store.create_environment(&env).await.unwrap();
        let node = node_row(env.env_id, "A");
        store.create_node(&node).await.unwrap();

        let mut scheduled = carve_row(env.env_id, node.node_id, "unused", 0);
        scheduled.session_id = None;
        scheduled.status = CarveStatus::Scheduled.as_str().to_string();
        scheduled.query_name = Some("carve_abc".to_string());
        assert!(store.create_carve(&scheduled).await.unwrap());
        assert!(!store.create_carve(&scheduled).await.unwrap());

        let mut init = carve_row(env.env_id, node.node_id, "s9", 3);
        init.carve_id = scheduled.carve_id.clone();
        init.path = String::new();
        let row = store.initialize_carve(&init).await.unwrap();
        assert_eq!(row.carve_file_id, scheduled.carve_file_id);
        assert_eq!(row.status, "INITIALIZED");
        assert_eq!(row.total_blocks, 3);
        assert_eq!(row.path, "/etc/hosts");
        assert_eq!(row.query_name.as_deref(), Some("carve_abc"));
    }

    #[tokio::test]
    async fn test_schedule_after_initialize_fills_in_origin() {
        let (store, _dir) = store().await;
        let env = env_row();
        store.create_environment(&env).await.unwrap();
        let node = node_row(env.env_id, "A");
        store.create_node(&node).await.unwrap();

        let mut init = carve_row(env.env_id, node.node_id, "s4", 2);
        init.path = String::new();
        init.query_name = None;
        let opened = store.initialize_carve(&init).await.unwrap();

        let mut scheduled = carve_row(env.env_id, node.node_id, "unused", 0);
        scheduled.carve_id = init.carve_id.clone();
        scheduled.session_id = None;
        scheduled.status = CarveStatus::Scheduled.as_str().to_string();
        scheduled.query_name = Some("carve_late".to_string());
        assert!(store.create_carve(&scheduled).await.unwrap());
        // Nothing left to fill in.
        assert!(!store.create_carve(&scheduled).await.unwrap());

        let row = store.get_carve(env.env_id, &init.carve_id).await.unwrap().unwrap();
        assert_eq!(row.carve_file_id, opened.carve_file_id);
        assert_eq!(row.status, "INITIALIZED");
        assert_eq!(row.session_id.as_deref(), Some("s4"));
        assert_eq!(row.total_blocks, 2);
        assert_eq!(row.path, "/etc/hosts");
        assert_eq!(row.query_name.as_deref(), Some("carve_late"));

        // Another node reusing the carve ID changes nothing.
        let other = node_row(env.env_id, "B");
        store.create_node(&other).await.unwrap();
        let mut foreign = scheduled.clone();
        foreign.node_id = other.node_id;
        foreign.carve_file_id = Uuid::new_v4();
        assert!(!store.create_carve(&foreign).await.unwrap());
    }
}
