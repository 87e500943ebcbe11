//! Shared handler helpers.

use crate::compression::{ContentEncoding, DecodeError, decode_body};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::writer::CheckIn;
use axum::http::HeaderMap;
use bytes::Bytes;
use fleet_core::node::normalize_node_key;
use fleet_core::{EnvId, NodeChannel};
use fleet_metadata::models::{EnvironmentRow, NodeRow};
use fleet_metadata::repos::NodeRepo;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

/// Resolve the environment named in the URL.
///
/// The identifier must be a canonical UUID; it is checked before the store
/// is consulted.
pub async fn resolve_environment(state: &AppState, env: &str) -> ApiResult<Arc<EnvironmentRow>> {
    let env_id = EnvId::parse(env)?;
    state
        .environments
        .get(*env_id.as_uuid())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("environment {env_id}")))
}

/// Decompress a request body according to its `Content-Encoding`.
pub async fn read_body(state: &AppState, headers: &HeaderMap, body: Bytes) -> ApiResult<Bytes> {
    let encoding = ContentEncoding::from_headers(headers)
        .ok_or_else(|| ApiError::BadRequest(DecodeError::Unsupported.to_string()))?;
    decode_body(encoding, body, state.config.server.max_body_size)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Parse a JSON request body.
pub fn parse_json<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

/// Find the node owning `node_key` within `env`.
///
/// A key belonging to another environment does not authenticate.
pub async fn authenticate(
    state: &AppState,
    env: &EnvironmentRow,
    node_key: &str,
) -> ApiResult<Option<NodeRow>> {
    let key = normalize_node_key(node_key);
    if key.is_empty() {
        return Ok(None);
    }
    let Some(node) = state.metadata.get_node_by_key(&key).await? else {
        tracing::debug!(env_id = %env.env_id, "Unknown node key");
        return Ok(None);
    };
    if node.env_id != env.env_id {
        tracing::warn!(
            env_id = %env.env_id,
            node_env_id = %node.env_id,
            uuid = %node.uuid,
            "Node key presented for another environment"
        );
        return Ok(None);
    }
    Ok(Some(node))
}

/// Queue a check-in for an authenticated request.
///
/// The observed address is always sent when known; the writer keeps the
/// latest one per flush window.
pub fn check_in(
    state: &AppState,
    node_id: Uuid,
    client_ip: Option<String>,
    channel: NodeChannel,
    bytes: usize,
) {
    state.writer.submit(CheckIn {
        node_id,
        ip_address: client_ip,
        channel,
        bytes: i64::try_from(bytes).unwrap_or(i64::MAX),
    });
}
