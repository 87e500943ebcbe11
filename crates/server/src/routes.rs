//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::ratelimit::client_ip_middleware;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let node_routes = Router::new()
        .route("/{env}/enroll", post(handlers::enroll))
        .route("/{env}/config", post(handlers::node_config))
        .route("/{env}/log", post(handlers::node_log))
        .route("/{env}/read", post(handlers::query_read))
        .route("/{env}/write", post(handlers::query_write))
        .route("/{env}/init", post(handlers::carve_init))
        .route("/{env}/block", post(handlers::carve_block))
        .route(
            "/{env}/{secret_path}/{script}",
            get(handlers::quick_script),
        );

    // Unauthenticated for load balancers and probes.
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(node_routes);

    // When enabled, restrict /metrics to scraper addresses at the network level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let rate_limit_state = state.rate_limit.clone();
    let body_limit = state.config.server.max_body_size;

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            rate_limit_state,
            client_ip_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
