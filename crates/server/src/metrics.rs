//! Prometheus metrics for the fleet server.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no node identifiers or tenant names, only aggregate counts.
//! Restrict the endpoint to scraper addresses at the network level, or turn
//! it off with `server.metrics_enabled = false`.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Protocol endpoints
pub static REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "fleet_request_duration_seconds",
            "Node protocol request duration by endpoint",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["endpoint"],
    )
    .expect("metric creation failed")
});

pub static REQUEST_BYTES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleet_request_bytes_total",
            "Request body bytes received by endpoint, before decompression",
        ),
        &["endpoint"],
    )
    .expect("metric creation failed")
});

pub static NODE_INVALID: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleet_node_invalid_total",
            "Requests answered with node_invalid by endpoint",
        ),
        &["endpoint"],
    )
    .expect("metric creation failed")
});

pub static ENROLLMENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("fleet_enrollments_total", "Enrollment attempts by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static LOGS_RECEIVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("fleet_logs_received_total", "Log pushes accepted by log type"),
        &["log_type"],
    )
    .expect("metric creation failed")
});

pub static LOG_SINK_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "fleet_log_sink_failures_total",
        "Log batches the sink failed to deliver",
    )
    .expect("metric creation failed")
});

// Distributed queries
pub static QUERIES_DISPATCHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleet_queries_dispatched_total",
            "Distributed queries created by type",
        ),
        &["query_type"],
    )
    .expect("metric creation failed")
});

pub static QUERY_RESULTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleet_query_results_total",
            "Query results reported by nodes, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static QUERIES_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "fleet_queries_expired_total",
        "Queries expired by the maintenance sweep",
    )
    .expect("metric creation failed")
});

// Carving
pub static CARVE_SESSIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "fleet_carve_sessions_total",
        "Carve sessions initialized",
    )
    .expect("metric creation failed")
});

pub static CARVE_BLOCKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("fleet_carve_blocks_total", "Carve blocks received by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static CARVES_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "fleet_carves_completed_total",
        "Carves that received all their blocks",
    )
    .expect("metric creation failed")
});

pub static CARVES_ARCHIVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleet_carves_archived_total",
            "Carve archive reassembly attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

// Batched writer
pub static WRITER_FLUSH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "fleet_writer_flush_duration_seconds",
            "Time taken to flush a batch of node check-ins",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
    )
    .expect("metric creation failed")
});

pub static WRITER_BATCH_SIZE: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "fleet_writer_batch_nodes",
            "Distinct nodes per flushed batch",
        )
        .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
    )
    .expect("metric creation failed")
});

pub static WRITER_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "fleet_writer_dropped_events_total",
        "Check-in events dropped because the writer queue was full",
    )
    .expect("metric creation failed")
});

pub static WRITER_FLUSH_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "fleet_writer_flush_failures_total",
        "Check-in batches that failed to write",
    )
    .expect("metric creation failed")
});

// Background work
pub static BACKGROUND_TASKS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "fleet_background_tasks_active",
        "Tracked background tasks not yet reaped",
    )
    .expect("metric creation failed")
});

pub static BACKGROUND_TASKS_PANICKED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleet_background_tasks_panicked_total",
            "Background tasks that panicked, by kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static ENV_CACHE_MISSES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "fleet_env_cache_misses_total",
        "Environment lookups that fell through to the metadata store",
    )
    .expect("metric creation failed")
});

pub static RATE_LIMITED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "fleet_rate_limited_total",
        "Requests rejected by the per-IP rate limiter",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so integration tests can build many routers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(REQUEST_DURATION.clone()),
            Box::new(REQUEST_BYTES.clone()),
            Box::new(NODE_INVALID.clone()),
            Box::new(ENROLLMENTS.clone()),
            Box::new(LOGS_RECEIVED.clone()),
            Box::new(LOG_SINK_FAILURES.clone()),
            Box::new(QUERIES_DISPATCHED.clone()),
            Box::new(QUERY_RESULTS.clone()),
            Box::new(QUERIES_EXPIRED.clone()),
            Box::new(CARVE_SESSIONS.clone()),
            Box::new(CARVE_BLOCKS.clone()),
            Box::new(CARVES_COMPLETED.clone()),
            Box::new(CARVES_ARCHIVED.clone()),
            Box::new(WRITER_FLUSH_DURATION.clone()),
            Box::new(WRITER_BATCH_SIZE.clone()),
            Box::new(WRITER_DROPPED.clone()),
            Box::new(WRITER_FLUSH_FAILURES.clone()),
            Box::new(BACKGROUND_TASKS_ACTIVE.clone()),
            Box::new(BACKGROUND_TASKS_PANICKED.clone()),
            Box::new(ENV_CACHE_MISSES.clone()),
            Box::new(RATE_LIMITED.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record the duration and body size of one protocol request.
pub fn record_request(endpoint: &str, started: std::time::Instant, body_bytes: usize) {
    REQUEST_DURATION
        .with_label_values(&[endpoint])
        .observe(started.elapsed().as_secs_f64());
    REQUEST_BYTES
        .with_label_values(&[endpoint])
        .inc_by(body_bytes as u64);
}

/// Count a request answered with `node_invalid`.
pub fn record_node_invalid(endpoint: &str) {
    NODE_INVALID.with_label_values(&[endpoint]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
        ENROLLMENTS.with_label_values(&["new"]).inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"fleet_enrollments_total".to_string()));
    }
}
