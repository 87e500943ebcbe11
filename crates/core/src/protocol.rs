//! Request and response bodies of the agent-facing protocol.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Accept an integer sent either as a JSON number or as a numeric string.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Body carrying only the session key (config and query-read requests).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeKeyRequest {
    #[serde(default)]
    pub node_key: String,
}

/// Response whose only field tells the agent to re-enroll.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct NodeInvalidResponse {
    pub node_invalid: bool,
}

/// `os_version` table reported at enrollment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OsVersionInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub platform_like: String,
    pub codename: String,
}

/// `osquery_info` table reported at enrollment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInfo {
    pub version: String,
    pub config_hash: String,
    pub uuid: String,
    pub instance_id: String,
}

/// `system_info` table reported at enrollment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub hostname: String,
    pub local_hostname: String,
    pub computer_name: String,
    pub cpu_brand: String,
    pub physical_memory: String,
    pub hardware_serial: String,
    pub uuid: String,
}

/// Host details sent with an enrollment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDetails {
    pub os_version: OsVersionInfo,
    pub osquery_info: AgentInfo,
    pub system_info: SystemInfo,
}

/// Enrollment request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnrollRequest {
    #[serde(default)]
    pub enroll_secret: String,
    #[serde(default)]
    pub host_identifier: String,
    #[serde(default)]
    pub platform_type: String,
    #[serde(default)]
    pub host_details: HostDetails,
}

/// Enrollment response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub node_key: String,
    pub node_invalid: bool,
}

/// Log push request. `data` is an array of log entries.
#[derive(Clone, Debug, Deserialize)]
pub struct LogRequest {
    #[serde(default)]
    pub node_key: String,
    pub log_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Query-read response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryReadResponse {
    /// Query name to query text.
    pub queries: BTreeMap<String, String>,
    pub node_invalid: bool,
    /// Requested check-in interval in seconds, only while acceleration is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerate: Option<i64>,
}

impl QueryReadResponse {
    /// Response telling the agent its key is not valid.
    pub fn invalid() -> Self {
        Self {
            queries: BTreeMap::new(),
            node_invalid: true,
            accelerate: None,
        }
    }
}

/// Query-write request: results, status codes and messages by query name.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryWriteRequest {
    #[serde(default)]
    pub node_key: String,
    #[serde(default)]
    pub queries: HashMap<String, Value>,
    #[serde(default)]
    pub statuses: HashMap<String, i64>,
    #[serde(default)]
    pub messages: HashMap<String, String>,
}

impl QueryWriteRequest {
    /// Status code reported for `name`; missing means success.
    pub fn status_of(&self, name: &str) -> i64 {
        self.statuses.get(name).copied().unwrap_or(0)
    }

    /// All query names mentioned in any of the three maps.
    pub fn query_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queries
            .keys()
            .chain(self.statuses.keys())
            .chain(self.messages.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Result row of a carve query, confirming the agent scheduled a carve.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CarveScheduledRow {
    pub carve: String,
    pub carve_guid: String,
    pub request_id: String,
    pub path: String,
    pub status: String,
    pub size: String,
    pub sha256: String,
    pub time: String,
}

impl CarveScheduledRow {
    /// Extract scheduled-carve rows from a query result payload.
    ///
    /// Rows that are not objects or do not request a carve are skipped.
    pub fn extract(result: &Value) -> Vec<CarveScheduledRow> {
        let Some(rows) = result.as_array() else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| serde_json::from_value::<CarveScheduledRow>(row.clone()).ok())
            .filter(|row| row.carve == crate::carve::CARVE_REQUESTED && !row.carve_guid.is_empty())
            .collect()
    }
}

/// Carve session initialization request.
#[derive(Clone, Debug, Deserialize)]
pub struct CarveInitRequest {
    #[serde(deserialize_with = "lenient_i64")]
    pub block_count: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub block_size: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub carve_size: i64,
    #[serde(default)]
    pub carve_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub node_key: String,
}

impl CarveInitRequest {
    pub fn geometry(&self) -> crate::carve::CarveGeometry {
        crate::carve::CarveGeometry {
            block_count: self.block_count,
            block_size: self.block_size,
            carve_size: self.carve_size,
        }
    }
}

/// Carve session initialization response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CarveInitResponse {
    pub success: bool,
    pub session_id: String,
}

/// One block of carved data, base64 encoded.
#[derive(Clone, Debug, Deserialize)]
pub struct CarveBlockRequest {
    #[serde(deserialize_with = "lenient_i64")]
    pub block_id: i64,
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub data: String,
}

/// Carve block response.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CarveBlockResponse {
    pub success: bool,
}
