//! Log pushes.

use super::common::{authenticate, check_in, parse_json, read_body, resolve_environment};
use crate::error::{ApiError, ApiResult};
use crate::logsink::LogSink;
use crate::ratelimit::ClientIp;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use bytes::Bytes;
use fleet_core::protocol::{LogRequest, NodeInvalidResponse};
use fleet_core::{LogType, NodeChannel};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// POST /{env}/log
///
/// Bodies may be gzip compressed. Entries are handed to the log sink in
/// the background; the agent gets its answer without waiting for it.
#[tracing::instrument(skip(state, client_ip, headers, body))]
pub async fn node_log(
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
    let request: LogRequest = parse_json(&body)?;
    let log_type = LogType::parse(&request.log_type)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let Some(node) = authenticate(&state, &env, &request.node_key).await? else {
        crate::metrics::record_node_invalid("log");
        return Ok(Json(NodeInvalidResponse { node_invalid: true }));
    };

    crate::metrics::LOGS_RECEIVED
        .with_label_values(&[log_type.as_str()])
        .inc();
    forward_to_sink(&state, log_type, request.data, env.env_id, node.uuid.clone()).await;

    check_in(&state, node.node_id, client_ip.0, NodeChannel::Log, received);
    crate::metrics::record_request("log", started, received);
    Ok(Json(NodeInvalidResponse {
        node_invalid: false,
    }))
}

/// Deliver a payload to the log sink in a tracked background task.
/// Failures are logged and counted.
pub(crate) async fn forward_to_sink(
    state: &AppState,
    log_type: LogType,
    payload: Value,
    env_id: Uuid,
    uuid: String,
) {
    let sink: Arc<dyn LogSink> = state.log_sink.clone();
    state
        .tasks
        .spawn("log_sink", async move {
            if let Err(e) = sink.send(log_type, &payload, env_id, &uuid).await {
                crate::metrics::LOG_SINK_FAILURES.inc();
                tracing::error!(
                    sink = sink.name(),
                    log_type = log_type.as_str(),
                    uuid = %uuid,
                    error = %e,
                    "Failed to deliver logs"
                );
            }
        })
        .await;
}
