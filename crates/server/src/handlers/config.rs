//! Configuration fetch.

use super::common::{authenticate, check_in, parse_json, read_body, resolve_environment};
use crate::error::ApiResult;
use crate::ratelimit::ClientIp;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use fleet_core::NodeChannel;
use fleet_core::protocol::{NodeInvalidResponse, NodeKeyRequest};
use std::time::Instant;

/// POST /{env}/config
///
/// Returns the environment's configuration document as stored.
#[tracing::instrument(skip(state, client_ip, headers, body))]
pub async fn node_config(
    State(state): State<AppState>,
    Path(env): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let started = Instant::now();
    let env = resolve_environment(&state, &env).await?;
    let received = body.len();
    let body = read_body(&state, &headers, body).await?;
    let request: NodeKeyRequest = parse_json(&body)?;

    let Some(node) = authenticate(&state, &env, &request.node_key).await? else {
        crate::metrics::record_node_invalid("config");
        return Ok(Json(NodeInvalidResponse { node_invalid: true }).into_response());
    };

    check_in(&state, node.node_id, client_ip.0, NodeChannel::Config, received);
    crate::metrics::record_request("config", started, received);
    Ok(([(CONTENT_TYPE, "application/json")], env.configuration.clone()).into_response())
}
