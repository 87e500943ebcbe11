//! Distributed query read and write.

use super::common::{authenticate, check_in, parse_json, read_body, resolve_environment};
use super::logs::forward_to_sink;
use crate::error::{ApiError, ApiResult};
use crate::ratelimit::ClientIp;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use bytes::Bytes;
use fleet_core::protocol::{
    NodeInvalidResponse, NodeKeyRequest, QueryReadResponse, QueryWriteRequest,
};
use fleet_core::{LogType, NodeChannel};
use std::time::Instant;

/// POST /{env}/read
#[tracing::instrument(skip(state, client_ip, headers, body))]
pub async fn query_read(
    State(state): State<AppState>,
    Path(env): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<QueryReadResponse>> {
    let started = Instant::now();
    let env = resolve_environment(&state, &env).await?;
    let received = body.len();
    let body = read_body(&state, &headers, body).await?;
    let request: NodeKeyRequest = parse_json(&body)?;

    let Some(node) = authenticate(&state, &env, &request.node_key).await? else {
        crate::metrics::record_node_invalid("read");
        return Ok(Json(QueryReadResponse::invalid()));
    };

    let response = state.dispatcher.node_queries(&env, &node).await?;
    if !response.queries.is_empty() {
        tracing::debug!(node_id = %node.node_id, queries = response.queries.len(), "Queries handed out");
    }

    check_in(&state, node.node_id, client_ip.0, NodeChannel::QueryRead, received);
    crate::metrics::record_request("read", started, received);
    Ok(Json(response))
}

/// POST /{env}/write
///
/// Counts each result against its query, then forwards the results to the
/// log sink in the background.
#[tracing::instrument(skip(state, client_ip, headers, body))]
pub async fn query_write(
    State(state): State<AppState>,
    Path(env): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<NodeInvalidResponse>> {
    let started = Instant::now();
    let env = resolve_environment(&state, &env).await?;
    let received = body.len();
    let body = read_body(&state, &headers, body).await?;
    let request: QueryWriteRequest = parse_json(&body)?;

    let Some(node) = authenticate(&state, &env, &request.node_key).await? else {
        crate::metrics::record_node_invalid("write");
        return Ok(Json(NodeInvalidResponse { node_invalid: true }));
    };

    let summary = state
        .dispatcher
        .record_results(&state.carving, &node, &request)
        .await?;
    tracing::debug!(
        node_id = %node.node_id,
        recorded = summary.recorded,
        ignored = summary.ignored,
        completed = summary.completed,
        carves = summary.carves_scheduled,
        "Query results recorded"
    );

    if !request.queries.is_empty() {
        let payload = serde_json::to_value(&request.queries)
            .map_err(|e| ApiError::Internal(format!("failed to encode results: {e}")))?;
        forward_to_sink(&state, LogType::Query, payload, env.env_id, node.uuid.clone()).await;
    }

    check_in(&state, node.node_id, client_ip.0, NodeChannel::QueryWrite, received);
    crate::metrics::record_request("write", started, received);
    Ok(Json(NodeInvalidResponse {
        node_invalid: false,
    }))
}
