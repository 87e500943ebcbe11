//! Test fixtures for environments, enrollments and carve blocks.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fleet_metadata::models::EnvironmentRow;
use serde_json::{Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

/// Enroll secret used by every fixture environment.
#[allow(dead_code)]
pub const ENROLL_SECRET: &str = "enroll-secret-for-tests";

/// Quick-enroll and quick-remove path segments of fixture environments.
#[allow(dead_code)]
pub const ENROLL_PATH: &str = "enroll-path-0123456789";
#[allow(dead_code)]
pub const REMOVE_PATH: &str = "remove-path-0123456789";

/// Build an environment row that accepts enrollments.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn environment_row(name: &str) -> EnvironmentRow {
    let now = OffsetDateTime::now_utc();
    EnvironmentRow {
        env_id: Uuid::new_v4(),
        name: name.to_string(),
        secret: ENROLL_SECRET.to_string(),
        enroll_secret_path: ENROLL_PATH.to_string(),
        enroll_expire: None,
        remove_secret_path: REMOVE_PATH.to_string(),
        remove_expire: None,
        accept_enrolls: true,
        debug_http: false,
        configuration: r#"{"options":{"logger_plugin":"tls"},"schedule":{}}"#.to_string(),
        accelerate_until: None,
        accelerated_seconds: 0,
        hostname: "fleet.example.com".to_string(),
        created_at: now,
        updated_at: now,
    }
}

/// Enrollment body for a host.
#[allow(dead_code)]
pub fn enroll_body(secret: &str, host_identifier: &str, platform: &str, hostname: &str) -> Value {
    json!({
        "enroll_secret": secret,
        "host_identifier": host_identifier,
        "platform_type": "9",
        "host_details": {
            "os_version": {
                "name": platform,
                "version": "1.0",
                "platform": platform,
                "platform_like": platform
            },
            "osquery_info": {
                "version": "5.12.1",
                "config_hash": "",
                "uuid": host_identifier
            },
            "system_info": {
                "hostname": hostname,
                "local_hostname": hostname,
                "cpu_brand": "Test CPU",
                "physical_memory": "8589934592",
                "hardware_serial": "SERIAL-1",
                "uuid": host_identifier
            }
        }
    })
}

/// Deterministic block payload.
#[allow(dead_code)]
pub fn block_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}

/// Base64 encode a block the way agents send it.
#[allow(dead_code)]
pub fn encode_block(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Result row confirming a scheduled carve.
#[allow(dead_code)]
pub fn carve_result_row(carve_guid: &str, request_id: &str, path: &str) -> Value {
    json!({
        "carve": "1",
        "carve_guid": carve_guid,
        "request_id": request_id,
        "path": path,
        "status": "SCHEDULED",
        "size": "-1",
        "sha256": "",
        "time": "1700000000"
    })
}

/// Gzip compress a request body.
#[allow(dead_code)]
pub async fn gzip(data: &[u8]) -> Vec<u8> {
    use async_compression::tokio::bufread::GzipEncoder;
    use tokio::io::AsyncReadExt;

    let mut encoder = GzipEncoder::new(data);
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .await
        .expect("Failed to gzip body");
    out
}
