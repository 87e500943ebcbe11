//! PostgreSQL-based metadata store implementation.

use crate::batch::{Placeholder, SEEN_CHUNK_SIZE, SeenBind, seen_update_sql};
use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{
    BlockOutcome, BlockWrite, CarveRepo, EnvironmentRepo, LogRepo, NodeRepo, QueryRepo,
    RecordOutcome, ResultRecord, TagRepo,
};
use crate::store::MetadataStore;
use async_trait::async_trait;
use fleet_core::config::PgSslMode;
use fleet_core::{CarveStatus, NodeQueryStatus};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password arrive separately, e.g. through `FLEET_METADATA__PASSWORD`.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements hold one command each.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EnvironmentRepo for PostgresStore {
    async fn create_environment(&self, env: &EnvironmentRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO environments (
                env_id, name, secret, enroll_secret_path, enroll_expire,
                remove_secret_path, remove_expire, accept_enrolls, debug_http,
                configuration, accelerate_until, accelerated_seconds, hostname,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
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
        let row = sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments WHERE env_id = $1")
            .bind(env_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_environment_by_name(&self, name: &str) -> MetadataResult<Option<EnvironmentRow>> {
        let row = sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_environments(&self) -> MetadataResult<Vec<EnvironmentRow>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn update_environment(&self, env: &EnvironmentRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE environments SET
                name = $1, secret = $2, enroll_secret_path = $3, enroll_expire = $4,
                remove_secret_path = $5, remove_expire = $6, accept_enrolls = $7,
                debug_http = $8, configuration = $9, accelerate_until = $10,
                accelerated_seconds = $11, hostname = $12, updated_at = $13
            WHERE env_id = $14
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
            "UPDATE environments SET accelerate_until = $1, accelerated_seconds = $2, updated_at = $3 WHERE env_id = $4",
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

#[async_trait]
impl NodeRepo for PostgresStore {
    async fn create_node(&self, node: &NodeRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                node_id, env_id, uuid, node_key, platform, platform_version,
                osquery_version, hostname, localname, ip_address, username, cpu,
                memory, hardware_serial, config_hash, bytes_received, raw_enrollment,
                last_seen, last_config, last_log, last_query_read, last_query_write,
                last_carve, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
            )
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
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_node_by_key(&self, node_key: &str) -> MetadataResult<Option<NodeRow>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE node_key = $1")
            .bind(node_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_node_by_uuid(&self, env_id: Uuid, uuid: &str) -> MetadataResult<Option<NodeRow>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE env_id = $1 AND uuid = $2")
            .bind(env_id)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_nodes(&self, env_id: Uuid) -> MetadataResult<Vec<NodeRow>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM nodes WHERE env_id = $1 ORDER BY hostname, uuid",
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

        let current =
            sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE node_id = $1 FOR UPDATE")
                .bind(node.node_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    MetadataError::NotFound(format!("node {} not found", node.node_id))
                })?;

        let archived = ArchivedNodeRow::snapshot(&current, trigger, archived_at);
        sqlx::query(
            r#"
            INSERT INTO archived_nodes (
                archive_id, node_id, env_id, uuid, node_key, platform, platform_version,
                osquery_version, hostname, localname, ip_address, hardware_serial,
                raw_enrollment, archive_trigger, last_seen, enrolled_at, archived_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
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
                node_key = $1, platform = $2, platform_version = $3, osquery_version = $4,
                hostname = $5, localname = $6, ip_address = $7, username = $8, cpu = $9,
                memory = $10, hardware_serial = $11, config_hash = $12, raw_enrollment = $13,
                last_seen = $14, updated_at = $15
            WHERE node_id = $16
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
            "SELECT * FROM archived_nodes WHERE env_id = $1 AND uuid = $2 ORDER BY archived_at DESC",
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
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for chunk in updates.chunks(SEEN_CHUNK_SIZE) {
            let built = seen_update_sql(chunk, seen_at, Placeholder::Numbered);
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
        Ok(updated)
    }

    async fn active_node_ids(&self, env_id: Uuid, since: OffsetDateTime) -> MetadataResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT node_id FROM nodes WHERE env_id = $1 AND last_seen >= $2",
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
            "SELECT node_id FROM nodes WHERE env_id = $1 AND platform = $2 AND last_seen >= $3",
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
            "SELECT node_id FROM nodes WHERE env_id = $1 AND (uuid = $2 OR hostname = $3 OR localname = $3)",
        )
        .bind(env_id)
        .bind(fleet_core::node::normalize_uuid(identifier))
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl TagRepo for PostgresStore {
    async fn create_tag(&self, tag: &TagRow) -> MetadataResult<()> {
        sqlx::query("INSERT INTO tags (tag_id, env_id, name, created_at) VALUES ($1, $2, $3, $4)")
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
        let row = sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE env_id = $1 AND name = $2")
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
            "INSERT INTO tagged_nodes (tag_id, node_id, created_at) VALUES ($1, $2, $3) ON CONFLICT (tag_id, node_id) DO NOTHING",
        )
        .bind(tag_id)
        .bind(node_id)
        .bind(tagged_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tagged_node_ids(&self, tag_id: Uuid) -> MetadataResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT node_id FROM tagged_nodes WHERE tag_id = $1")
            .bind(tag_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl QueryRepo for PostgresStore {
    async fn create_query(&self, query: &DistributedQueryRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO distributed_queries (
                query_id, env_id, name, creator, query, query_type, path, expected,
                executions, errors, active, hidden, completed, deleted, expired,
                expiration, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
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
            "SELECT * FROM distributed_queries WHERE query_id = $1",
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
            "SELECT * FROM distributed_queries WHERE env_id = $1 AND name = $2",
        )
        .bind(env_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_queries(&self, env_id: Uuid) -> MetadataResult<Vec<DistributedQueryRow>> {
        let rows = sqlx::query_as::<_, DistributedQueryRow>(
            "SELECT * FROM distributed_queries WHERE env_id = $1 ORDER BY created_at DESC",
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

        if !node_ids.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO node_queries (query_id, node_id, status, created_at, updated_at)
                SELECT $1, target, $3, $4, $4 FROM unnest($2::uuid[]) AS target
                ON CONFLICT (query_id, node_id) DO NOTHING
                "#,
            )
            .bind(query_id)
            .bind(node_ids)
            .bind(NodeQueryStatus::Pending.as_str())
            .bind(assigned_at)
            .execute(&mut *tx)
            .await?;
        }

        let expected: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM node_queries WHERE query_id = $1")
                .bind(query_id)
                .fetch_one(&mut *tx)
                .await?;

        let result = sqlx::query(
            "UPDATE distributed_queries SET expected = $1, updated_at = $2 WHERE query_id = $3",
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
            "SELECT * FROM node_queries WHERE query_id = $1 AND node_id = $2",
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
            WHERE nq.node_id = $1
              AND nq.status = $2
              AND q.active AND NOT q.completed AND NOT q.deleted AND NOT q.expired
              AND (q.expiration IS NULL OR q.expiration > $3)
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
            "UPDATE node_queries SET status = $1, updated_at = $2 WHERE query_id = $3 AND node_id = $4 AND status = $5",
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
            "UPDATE distributed_queries SET executions = executions + $1, errors = errors + $2, updated_at = $3 WHERE query_id = $4",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            UPDATE distributed_queries SET completed = TRUE, active = FALSE, updated_at = $1
            WHERE query_id = $2 AND NOT completed AND expected > 0
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
            "SELECT * FROM query_executions WHERE query_id = $1 ORDER BY created_at",
        )
        .bind(query_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn complete_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE distributed_queries SET completed = TRUE, active = FALSE, updated_at = $1 WHERE query_id = $2",
        )
        .bind(at)
        .bind(query_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE distributed_queries SET deleted = TRUE, active = FALSE, updated_at = $1 WHERE query_id = $2",
        )
        .bind(at)
        .bind(query_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_query(&self, query_id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE distributed_queries SET expired = TRUE, active = FALSE, updated_at = $1 WHERE query_id = $2",
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
        let rows = sqlx::query_as::<_, DistributedQueryRow>(
            r#"
            UPDATE distributed_queries SET expired = TRUE, active = FALSE, updated_at = $1
            WHERE active AND expiration IS NOT NULL AND expiration <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl CarveRepo for PostgresStore {
    async fn create_carve(&self, carve: &CarvedFileRow) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO carved_files (
                carve_file_id, env_id, node_id, uuid, carve_id, request_id, session_id,
                query_name, path, carve_size, block_size, total_blocks, completed_blocks,
                status, carver, archived, archive_path, deleted, expired, created_at,
                updated_at, completed_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22
            )
            ON CONFLICT (env_id, carve_id) DO UPDATE SET
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

    async fn get_carve(&self, env_id: Uuid, carve_id: &str) -> MetadataResult<Option<CarvedFileRow>> {
        let row = sqlx::query_as::<_, CarvedFileRow>(
            "SELECT * FROM carved_files WHERE env_id = $1 AND carve_id = $2",
        )
        .bind(env_id)
        .bind(carve_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_carve_by_session(&self, session_id: &str) -> MetadataResult<Option<CarvedFileRow>> {
        let row = sqlx::query_as::<_, CarvedFileRow>("SELECT * FROM carved_files WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_carves(&self, env_id: Uuid) -> MetadataResult<Vec<CarvedFileRow>> {
        let rows = sqlx::query_as::<_, CarvedFileRow>(
            "SELECT * FROM carved_files WHERE env_id = $1 ORDER BY created_at DESC",
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
                session_id = $1, request_id = $2, carve_size = $3, block_size = $4,
                total_blocks = $5, completed_blocks = 0, status = $6, carver = $7, updated_at = $8
            WHERE env_id = $9 AND carve_id = $10 AND node_id = $11 AND status = $12
              AND NOT deleted AND NOT expired
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
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, $13, $14,
                    FALSE, NULL, FALSE, FALSE, $15, $16, NULL
                )
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
            .bind(CarveStatus::Initialized.as_str())
            .bind(&carve.carver)
            .bind(carve.created_at)
            .bind(carve.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                MetadataError::from_insert(e, || {
                    format!("carve {} already initialized", carve.carve_id)
                })
            })?;
        }

        let row = sqlx::query_as::<_, CarvedFileRow>("SELECT * FROM carved_files WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn record_block(&self, block: &BlockWrite) -> MetadataResult<BlockOutcome> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes blocks of the same session.
        let Some(carve) = sqlx::query_as::<_, CarvedFileRow>(
            "SELECT * FROM carved_files WHERE session_id = $1 FOR UPDATE",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (session_id, block_id) DO NOTHING
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

        let updated = sqlx::query_as::<_, CarvedFileRow>(
            r#"
            UPDATE carved_files SET
                completed_blocks = completed_blocks + 1,
                status = CASE WHEN completed_blocks + 1 >= total_blocks THEN $1 ELSE $2 END,
                completed_at = CASE WHEN completed_blocks + 1 >= total_blocks THEN $3 ELSE completed_at END,
                updated_at = $3
            WHERE carve_file_id = $4 AND completed_blocks < total_blocks
            RETURNING *
            "#,
        )
        .bind(CarveStatus::Completed.as_str())
        .bind(CarveStatus::InProgress.as_str())
        .bind(block.received_at)
        .bind(carve.carve_file_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            MetadataError::Internal(format!(
                "carve session {} accepted a new block past its total",
                block.session_id
            ))
        })?;

        tx.commit().await?;
        Ok(BlockOutcome::Accepted(updated))
    }

    async fn list_blocks(&self, session_id: &str) -> MetadataResult<Vec<CarvedBlockRow>> {
        let rows = sqlx::query_as::<_, CarvedBlockRow>(
            "SELECT * FROM carved_blocks WHERE session_id = $1 ORDER BY block_id",
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
            "UPDATE carved_files SET archived = TRUE, archive_path = $1, updated_at = $2 WHERE session_id = $3",
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
            "UPDATE carved_files SET status = $1, completed_at = COALESCE(completed_at, $2), updated_at = $2 WHERE env_id = $3 AND carve_id = $4",
        )
        .bind(CarveStatus::Completed.as_str())
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
            "UPDATE carved_files SET deleted = TRUE, updated_at = $1 WHERE env_id = $2 AND carve_id = $3",
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
            "UPDATE carved_files SET expired = TRUE, updated_at = $1 WHERE env_id = $2 AND carve_id = $3",
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
            "UPDATE carved_files SET expired = TRUE, updated_at = $1 WHERE env_id = $2 AND query_name = $3 AND status <> $4 AND NOT expired",
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

#[async_trait]
impl LogRepo for PostgresStore {
    async fn insert_node_logs(&self, logs: &[NodeLogRow]) -> MetadataResult<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for log in logs {
            sqlx::query(
                "INSERT INTO node_logs (log_id, env_id, uuid, log_type, payload, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
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
            "SELECT * FROM node_logs WHERE env_id = $1 AND uuid = $2 AND log_type = $3 ORDER BY created_at",
        )
        .bind(env_id)
        .bind(uuid)
        .bind(log_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
