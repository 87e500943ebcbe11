//! Node enrollment.

use super::common::{parse_json, read_body, resolve_environment};
use crate::error::{ApiError, ApiResult};
use crate::ratelimit::ClientIp;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use bytes::Bytes;
use fleet_core::node::{normalize_uuid, secrets_match};
use fleet_core::protocol::{EnrollRequest, EnrollResponse};
use fleet_metadata::models::{EnvironmentRow, NodeRow};
use fleet_metadata::repos::NodeRepo;
use std::time::Instant;
use time::OffsetDateTime;
use uuid::Uuid;

/// Archive trigger recorded when a device enrolls again.
const REENROLL_TRIGGER: &str = "exists";

/// POST /{env}/enroll
///
/// Issues a fresh node key. A device that is already enrolled keeps its
/// node ID; its previous row is archived first.
#[tracing::instrument(skip(state, client_ip, headers, body), fields(uuid))]
pub async fn enroll(
    State(state): State<AppState>,
    Path(env): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<EnrollResponse>> {
    let started = Instant::now();
    let env = resolve_environment(&state, &env).await?;
    let received = body.len();
    let body = read_body(&state, &headers, body).await?;
    let request: EnrollRequest = parse_json(&body)?;

    if !env.accept_enrolls {
        crate::metrics::ENROLLMENTS.with_label_values(&["closed"]).inc();
        return Err(ApiError::Unavailable(format!(
            "environment {} is not accepting enrollments",
            env.name
        )));
    }
    if !secrets_match(&request.enroll_secret, &env.secret) {
        crate::metrics::ENROLLMENTS.with_label_values(&["denied"]).inc();
        tracing::warn!(env_id = %env.env_id, "Enrollment with invalid secret");
        return Err(ApiError::Forbidden("invalid enroll secret".to_string()));
    }
    let uuid = normalize_uuid(&request.host_identifier);
    if uuid.is_empty() {
        return Err(ApiError::BadRequest("host_identifier is required".to_string()));
    }
    tracing::Span::current().record("uuid", uuid.as_str());

    let now = OffsetDateTime::now_utc();
    let node_key = state.node_keys.generate(&uuid);
    let mut node = node_from_request(&env, &request, &uuid, &node_key, client_ip.0, received, now)?;

    match state.metadata.get_node_by_uuid(env.env_id, &uuid).await? {
        Some(existing) => {
            node.node_id = existing.node_id;
            node.created_at = existing.created_at;
            state
                .metadata
                .reenroll_node(&node, REENROLL_TRIGGER, now)
                .await?;
            crate::metrics::ENROLLMENTS
                .with_label_values(&["reenrolled"])
                .inc();
            tracing::info!(env_id = %env.env_id, node_id = %node.node_id, "Node re-enrolled");
        }
        None => {
            state.metadata.create_node(&node).await?;
            crate::metrics::ENROLLMENTS
                .with_label_values(&["enrolled"])
                .inc();
            tracing::info!(env_id = %env.env_id, node_id = %node.node_id, "Node enrolled");
        }
    }

    crate::metrics::record_request("enroll", started, received);
    Ok(Json(EnrollResponse {
        node_key,
        node_invalid: false,
    }))
}

fn node_from_request(
    env: &EnvironmentRow,
    request: &EnrollRequest,
    uuid: &str,
    node_key: &str,
    ip_address: Option<String>,
    received: usize,
    now: OffsetDateTime,
) -> ApiResult<NodeRow> {
    let details = &request.host_details;
    let platform = if details.os_version.platform.is_empty() {
        request.platform_type.clone()
    } else {
        details.os_version.platform.clone()
    };
    let raw_enrollment = serde_json::to_string(request)
        .map_err(|e| ApiError::Internal(format!("failed to encode enrollment: {e}")))?;

    Ok(NodeRow {
        node_id: Uuid::new_v4(),
        env_id: env.env_id,
        uuid: uuid.to_string(),
        node_key: node_key.to_string(),
        platform,
        platform_version: details.os_version.version.clone(),
        osquery_version: details.osquery_info.version.clone(),
        hostname: details.system_info.hostname.clone(),
        localname: details.system_info.local_hostname.clone(),
        ip_address: ip_address.unwrap_or_default(),
        username: String::new(),
        cpu: details.system_info.cpu_brand.clone(),
        memory: details.system_info.physical_memory.clone(),
        hardware_serial: details.system_info.hardware_serial.clone(),
        config_hash: details.osquery_info.config_hash.clone(),
        bytes_received: i64::try_from(received).unwrap_or(i64::MAX),
        raw_enrollment,
        last_seen: now,
        last_config: None,
        last_log: None,
        last_query_read: None,
        last_query_write: None,
        last_carve: None,
        created_at: now,
        updated_at: now,
    })
}
