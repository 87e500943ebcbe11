//! Database models mapping to the metadata schema.

use fleet_core::{CarveStatus, ChannelSet};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Environments
// =============================================================================

/// Tenant environment record.
#[derive(Debug, Clone, FromRow)]
pub struct EnvironmentRow {
    pub env_id: Uuid,
    pub name: String,
    /// Enrollment secret presented by agents.
    pub secret: String,
    pub enroll_secret_path: String,
    pub enroll_expire: Option<OffsetDateTime>,
    pub remove_secret_path: String,
    pub remove_expire: Option<OffsetDateTime>,
    pub accept_enrolls: bool,
    pub debug_http: bool,
    /// Raw JSON configuration served to agents.
    pub configuration: String,
    pub accelerate_until: Option<OffsetDateTime>,
    pub accelerated_seconds: i64,
    /// Public host name agents use to reach this server.
    pub hostname: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl EnvironmentRow {
    /// Whether agents should currently check in faster.
    pub fn is_accelerated(&self, now: OffsetDateTime) -> bool {
        self.accelerated_seconds > 0 && self.accelerate_until.is_some_and(|until| until > now)
    }

    /// Check a quick-enroll path segment; expired links are refused.
    pub fn enroll_path_valid(&self, path: &str, now: OffsetDateTime) -> bool {
        secret_path_valid(&self.enroll_secret_path, self.enroll_expire, path, now)
    }

    /// Check a quick-remove path segment; expired links are refused.
    pub fn remove_path_valid(&self, path: &str, now: OffsetDateTime) -> bool {
        secret_path_valid(&self.remove_secret_path, self.remove_expire, path, now)
    }
}

fn secret_path_valid(
    expected: &str,
    expire: Option<OffsetDateTime>,
    path: &str,
    now: OffsetDateTime,
) -> bool {
    !expected.is_empty()
        && fleet_core::node::secrets_match(path, expected)
        && expire.is_none_or(|at| at > now)
}

// =============================================================================
// Nodes
// =============================================================================

/// Enrolled node record. At most one per (env_id, uuid).
#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub node_id: Uuid,
    pub env_id: Uuid,
    pub uuid: String,
    pub node_key: String,
    pub platform: String,
    pub platform_version: String,
    pub osquery_version: String,
    pub hostname: String,
    pub localname: String,
    pub ip_address: String,
    pub username: String,
    pub cpu: String,
    pub memory: String,
    pub hardware_serial: String,
    pub config_hash: String,
    pub bytes_received: i64,
    pub raw_enrollment: String,
    pub last_seen: OffsetDateTime,
    pub last_config: Option<OffsetDateTime>,
    pub last_log: Option<OffsetDateTime>,
    pub last_query_read: Option<OffsetDateTime>,
    pub last_query_write: Option<OffsetDateTime>,
    pub last_carve: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Snapshot of a node row taken before it was replaced or removed.
#[derive(Debug, Clone, FromRow)]
pub struct ArchivedNodeRow {
    pub archive_id: Uuid,
    pub node_id: Uuid,
    pub env_id: Uuid,
    pub uuid: String,
    pub node_key: String,
    pub platform: String,
    pub platform_version: String,
    pub osquery_version: String,
    pub hostname: String,
    pub localname: String,
    pub ip_address: String,
    pub hardware_serial: String,
    pub raw_enrollment: String,
    /// Why the row was archived ("exists" on re-enrollment).
    pub archive_trigger: String,
    pub last_seen: OffsetDateTime,
    pub enrolled_at: OffsetDateTime,
    pub archived_at: OffsetDateTime,
}

impl ArchivedNodeRow {
    /// Copy the identity columns of a live node.
    pub fn snapshot(node: &NodeRow, trigger: &str, archived_at: OffsetDateTime) -> Self {
        Self {
            archive_id: Uuid::new_v4(),
            node_id: node.node_id,
            env_id: node.env_id,
            uuid: node.uuid.clone(),
            node_key: node.node_key.clone(),
            platform: node.platform.clone(),
            platform_version: node.platform_version.clone(),
            osquery_version: node.osquery_version.clone(),
            hostname: node.hostname.clone(),
            localname: node.localname.clone(),
            ip_address: node.ip_address.clone(),
            hardware_serial: node.hardware_serial.clone(),
            raw_enrollment: node.raw_enrollment.clone(),
            archive_trigger: trigger.to_string(),
            last_seen: node.last_seen,
            enrolled_at: node.created_at,
            archived_at,
        }
    }
}

/// Coalesced check-in for one node, written by the batched writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSeenUpdate {
    pub node_id: Uuid,
    /// New address; `None` leaves the stored one untouched.
    pub ip_address: Option<String>,
    /// Channels whose last-contact timestamp is refreshed.
    pub channels: ChannelSet,
    /// Bytes to add to the node's received counter.
    pub bytes_received: i64,
}

// =============================================================================
// Tags
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct TagRow {
    pub tag_id: Uuid,
    pub env_id: Uuid,
    pub name: String,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Distributed queries
// =============================================================================

/// Distributed query record.
///
/// `expected` is written once, together with the node query rows.
#[derive(Debug, Clone, FromRow)]
pub struct DistributedQueryRow {
    pub query_id: Uuid,
    pub env_id: Uuid,
    pub name: String,
    pub creator: String,
    pub query: String,
    pub query_type: String,
    pub path: Option<String>,
    pub expected: i64,
    pub executions: i64,
    pub errors: i64,
    pub active: bool,
    pub hidden: bool,
    pub completed: bool,
    pub deleted: bool,
    pub expired: bool,
    pub expiration: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Per-node delivery state of a distributed query.
#[derive(Debug, Clone, FromRow)]
pub struct NodeQueryRow {
    pub query_id: Uuid,
    pub node_id: Uuid,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Query handed to a node on query-read.
#[derive(Debug, Clone, FromRow)]
pub struct PendingQueryRow {
    pub name: String,
    pub query: String,
}

/// Audit record of one result reported by a node.
#[derive(Debug, Clone, FromRow)]
pub struct QueryExecutionRow {
    pub execution_id: Uuid,
    pub query_id: Uuid,
    pub node_id: Uuid,
    pub uuid: String,
    pub status: i64,
    pub message: Option<String>,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Carves
// =============================================================================

/// File carve session record.
#[derive(Debug, Clone, FromRow)]
pub struct CarvedFileRow {
    pub carve_file_id: Uuid,
    pub env_id: Uuid,
    pub node_id: Uuid,
    pub uuid: String,
    /// Carve GUID assigned by the agent.
    pub carve_id: String,
    pub request_id: String,
    /// Set on init; the only handle agents use for blocks.
    pub session_id: Option<String>,
    pub query_name: Option<String>,
    pub path: String,
    pub carve_size: i64,
    pub block_size: i64,
    pub total_blocks: i64,
    pub completed_blocks: i64,
    pub status: String,
    pub carver: String,
    pub archived: bool,
    pub archive_path: Option<String>,
    pub deleted: bool,
    pub expired: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl CarvedFileRow {
    /// Parsed status; unknown strings are treated as not accepting blocks.
    pub fn carve_status(&self) -> Option<CarveStatus> {
        CarveStatus::parse(&self.status).ok()
    }

    pub fn is_completed(&self) -> bool {
        self.total_blocks > 0 && self.completed_blocks >= self.total_blocks
    }
}

/// One received block. Written once per (session_id, block_id).
#[derive(Debug, Clone, FromRow)]
pub struct CarvedBlockRow {
    pub session_id: String,
    pub block_id: i64,
    pub env_id: Uuid,
    /// Block bytes when kept in the database.
    pub data: Option<Vec<u8>>,
    pub size: i64,
    /// Object store key when kept in object storage.
    pub storage_key: Option<String>,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Node logs
// =============================================================================

/// Log entry stored by the database log sink.
#[derive(Debug, Clone, FromRow)]
pub struct NodeLogRow {
    pub log_id: Uuid,
    pub env_id: Uuid,
    pub uuid: String,
    pub log_type: String,
    pub payload: String,
    pub created_at: OffsetDateTime,
}
