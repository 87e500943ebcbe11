//! Quick enroll and remove scripts.

use super::common::resolve_environment;
use crate::error::{ApiError, ApiResult};
use crate::scripts::{ScriptKind, render};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use time::OffsetDateTime;

/// GET /{env}/{secret_path}/{script}
///
/// The secret path must match the environment's enroll or remove path,
/// depending on the script, and must not have expired.
pub async fn quick_script(
    State(state): State<AppState>,
    Path((env, secret_path, script)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let env = resolve_environment(&state, &env).await?;
    let kind = ScriptKind::parse(&script)
        .ok_or_else(|| ApiError::NotFound(format!("script {script}")))?;

    let now = OffsetDateTime::now_utc();
    let valid = if kind.is_enroll() {
        env.enroll_path_valid(&secret_path, now)
    } else {
        env.remove_path_valid(&secret_path, now)
    };
    if !valid {
        tracing::warn!(env_id = %env.env_id, script = %script, "Invalid or expired script path");
        return Err(ApiError::Forbidden("invalid or expired path".to_string()));
    }

    tracing::info!(env_id = %env.env_id, script = %script, "Serving quick script");
    Ok((
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        render(kind, &env),
    ))
}
