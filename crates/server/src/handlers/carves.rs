//! Carve session init and block upload.

use super::common::{authenticate, check_in, parse_json, read_body, resolve_environment};
use crate::carving::BlockReceipt;
use crate::error::ApiResult;
use crate::ratelimit::ClientIp;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use bytes::Bytes;
use fleet_core::NodeChannel;
use fleet_core::protocol::{
    CarveBlockRequest, CarveBlockResponse, CarveInitRequest, CarveInitResponse,
};
use std::time::Instant;

/// POST /{env}/init
#[tracing::instrument(skip(state, client_ip, headers, body))]
pub async fn carve_init(
    State(state): State<AppState>,
    Path(env): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<CarveInitResponse>> {
    let started = Instant::now();
    let env = resolve_environment(&state, &env).await?;
    let received = body.len();
    let body = read_body(&state, &headers, body).await?;
    let request: CarveInitRequest = parse_json(&body)?;

    let Some(node) = authenticate(&state, &env, &request.node_key).await? else {
        crate::metrics::record_node_invalid("init");
        return Ok(Json(CarveInitResponse::default()));
    };

    let session_id = state.carving.init_carve(&node, &request).await?;

    check_in(&state, node.node_id, client_ip.0, NodeChannel::Carve, received);
    crate::metrics::record_request("init", started, received);
    Ok(Json(CarveInitResponse {
        success: true,
        session_id,
    }))
}

/// POST /{env}/block
///
/// Blocks carry no node key; the session and request IDs authorize them.
/// A delivered block checks in the node owning the session. Storage
/// failures are logged and answered with `success: false` so the agent
/// retries the block.
#[tracing::instrument(skip(state, client_ip, headers, body))]
pub async fn carve_block(
    State(state): State<AppState>,
    Path(env): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<CarveBlockResponse>> {
    let started = Instant::now();
    let env = resolve_environment(&state, &env).await?;
    let received = body.len();
    let body = read_body(&state, &headers, body).await?;
    let request: CarveBlockRequest = parse_json(&body)?;

    let receipt = match state.carving.process_block(env.env_id, &request).await {
        Ok(receipt) => receipt,
        Err(e) => {
            tracing::error!(
                session_id = %request.session_id,
                block_id = request.block_id,
                error = %e,
                "Failed to store carve block"
            );
            BlockReceipt::Rejected
        }
    };
    if let Some(node_id) = receipt.node_id() {
        check_in(&state, node_id, client_ip.0, NodeChannel::Carve, received);
    }

    crate::metrics::record_request("block", started, received);
    Ok(Json(CarveBlockResponse {
        success: receipt.success(),
    }))
}
