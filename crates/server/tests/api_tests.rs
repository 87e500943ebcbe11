//! Integration tests for the node session endpoints.

mod common;

use axum::http::StatusCode;
use common::fixtures::{ENROLL_PATH, ENROLL_SECRET, REMOVE_PATH, enroll_body, gzip};
use common::TestServer;
use fleet_metadata::repos::{LogRepo, NodeRepo};
use serde_json::json;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

const HOST_UUID: &str = "4c4c4544-0042-4b10-8048-b2c04f4e4d31";

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_metrics_endpoint_toggle() {
    fleet_server::metrics::register_metrics();

    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    server.enroll(&env, HOST_UUID, "ubuntu").await;

    let (status, body) = server.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("fleet_enrollments_total"));

    let server = TestServer::with_config(|c| c.server.metrics_enabled = false).await;
    let (status, _) = server.get("/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_enroll_creates_node() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;

    let node_key = server.enroll(&env, HOST_UUID, "ubuntu").await;
    assert_eq!(node_key.len(), 64);
    assert!(node_key.chars().all(|c| c.is_ascii_hexdigit()));

    let node = server.node(&env, HOST_UUID).await;
    assert_eq!(node.uuid, HOST_UUID.to_uppercase());
    assert_eq!(node.node_key, node_key);
    assert_eq!(node.platform, "ubuntu");
    assert_eq!(node.osquery_version, "5.12.1");
    assert_eq!(node.hostname, format!("host-{HOST_UUID}"));
    assert!(node.bytes_received > 0);
    assert!(node.raw_enrollment.contains("host_details"));
}

#[tokio::test]
async fn test_reenroll_keeps_node_id_and_archives_previous() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;

    let first_key = server.enroll(&env, HOST_UUID, "ubuntu").await;
    let first = server.node(&env, HOST_UUID).await;

    // Same device, different case: still the same node.
    let second_key = server
        .enroll(&env, &HOST_UUID.to_uppercase(), "debian")
        .await;
    assert_ne!(first_key, second_key);

    let second = server.node(&env, HOST_UUID).await;
    assert_eq!(second.node_id, first.node_id);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.platform, "debian");
    assert_eq!(second.node_key, second_key);

    let nodes = server.metadata().list_nodes(env.env_id).await.unwrap();
    assert_eq!(nodes.len(), 1);

    let archived = server
        .metadata()
        .list_archived_nodes(env.env_id, &HOST_UUID.to_uppercase())
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].node_key, first_key);
    assert_eq!(archived[0].platform, "ubuntu");
    assert_eq!(archived[0].archive_trigger, "exists");

    // The old key no longer authenticates.
    let (status, body) = server
        .post_json(
            &format!("/{}/config", env.env_id),
            json!({"node_key": first_key}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_invalid"], true);
}

#[tokio::test]
async fn test_enroll_rejections() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    let closed = server
        .create_environment_with("closed", |e| e.accept_enrolls = false)
        .await;

    // Wrong secret.
    let (status, _) = server
        .post_json(
            &format!("/{}/enroll", env.env_id),
            enroll_body("not-the-secret", HOST_UUID, "ubuntu", "host"),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Missing host identifier.
    let (status, _) = server
        .post_json(
            &format!("/{}/enroll", env.env_id),
            enroll_body(ENROLL_SECRET, "  ", "ubuntu", "host"),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Environment not accepting enrollments.
    let (status, _) = server
        .post_json(
            &format!("/{}/enroll", closed.env_id),
            enroll_body(ENROLL_SECRET, HOST_UUID, "ubuntu", "host"),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Unknown environment.
    let (status, _) = server
        .post_json(
            &format!("/{}/enroll", Uuid::new_v4()),
            enroll_body(ENROLL_SECRET, HOST_UUID, "ubuntu", "host"),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Malformed environment identifier.
    let (status, _) = server
        .post_json(
            &format!("/{}/enroll", env.env_id.simple()),
            enroll_body(ENROLL_SECRET, HOST_UUID, "ubuntu", "host"),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(
        server
            .metadata()
            .list_nodes(env.env_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_config_returns_environment_configuration() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    let node_key = server.enroll(&env, HOST_UUID, "ubuntu").await;

    let (status, body) = server
        .post_json(
            &format!("/{}/config", env.env_id),
            json!({"node_key": format!("  {}  ", node_key.to_uppercase())}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["options"]["logger_plugin"], "tls");

    let (status, body) = server
        .post_json(
            &format!("/{}/config", env.env_id),
            json!({"node_key": "unknown-key"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"node_invalid": true}));
}

#[tokio::test]
async fn test_node_key_from_other_environment_is_invalid() {
    let server = TestServer::new().await;
    let dev = server.create_environment("dev").await;
    let prod = server.create_environment("prod").await;
    let node_key = server.enroll(&dev, HOST_UUID, "ubuntu").await;

    for endpoint in ["config", "read", "write"] {
        let (status, body) = server
            .post_json(
                &format!("/{}/{endpoint}", prod.env_id),
                json!({"node_key": node_key}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{endpoint}");
        assert_eq!(body["node_invalid"], true, "{endpoint}");
    }

    let (status, body) = server
        .post_json(
            &format!("/{}/log", prod.env_id),
            json!({"node_key": node_key, "log_type": "status", "data": []}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_invalid"], true);
}

#[tokio::test]
async fn test_gzip_log_is_stored_by_db_sink() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    let node_key = server.enroll(&env, HOST_UUID, "ubuntu").await;

    let body = json!({
        "node_key": node_key,
        "log_type": "result",
        "data": [
            {"name": "pack_processes", "action": "added", "columns": {"pid": "1"}},
            {"name": "pack_processes", "action": "removed", "columns": {"pid": "2"}}
        ]
    });
    let compressed = gzip(&serde_json::to_vec(&body).unwrap()).await;
    let (status, response) = server
        .post_raw(&format!("/{}/log", env.env_id), compressed, Some("gzip"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["node_invalid"], false);

    // Delivery runs in the background.
    server.state.tasks.drain(Duration::from_secs(5)).await;

    let logs = server
        .metadata()
        .list_node_logs(env.env_id, &HOST_UUID.to_uppercase(), "result")
        .await
        .unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().any(|l| l.payload.contains("\"removed\"")));
}

#[tokio::test]
async fn test_log_rejects_bad_input() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    let node_key = server.enroll(&env, HOST_UUID, "ubuntu").await;

    let (status, _) = server
        .post_json(
            &format!("/{}/log", env.env_id),
            json!({"node_key": node_key, "log_type": "bogus", "data": []}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .post_raw(
            &format!("/{}/log", env.env_id),
            b"{not json".to_vec(),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .post_raw(
            &format!("/{}/log", env.env_id),
            b"{}".to_vec(),
            Some("br"),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_check_ins_are_written_on_flush() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    let node_key = server.enroll(&env, HOST_UUID, "ubuntu").await;
    let enrolled = server.node(&env, HOST_UUID).await;
    assert!(enrolled.last_config.is_none());

    for _ in 0..3 {
        let (status, _) = server
            .post_json(
                &format!("/{}/config", env.env_id),
                json!({"node_key": node_key}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = server
        .post_json(
            &format!("/{}/read", env.env_id),
            json!({"node_key": node_key}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    server.state.writer.flush().await;

    let node = server.node(&env, HOST_UUID).await;
    assert!(node.last_config.is_some());
    assert!(node.last_query_read.is_some());
    assert!(node.last_log.is_none());
    assert!(node.last_seen >= enrolled.last_seen);
    assert!(node.bytes_received > enrolled.bytes_received);
}

#[tokio::test]
async fn test_query_read_reports_acceleration() {
    let server = TestServer::new().await;
    let env = server
        .create_environment_with("dev", |e| {
            e.accelerated_seconds = 5;
            e.accelerate_until = Some(OffsetDateTime::now_utc() + time::Duration::minutes(10));
        })
        .await;
    let node_key = server.enroll(&env, HOST_UUID, "ubuntu").await;

    let (status, body) = server
        .post_json(
            &format!("/{}/read", env.env_id),
            json!({"node_key": node_key}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_invalid"], false);
    assert_eq!(body["accelerate"], 5);
    assert_eq!(body["queries"], json!({}));

    let plain = server.create_environment("plain").await;
    let node_key = server.enroll(&plain, HOST_UUID, "ubuntu").await;
    let (_, body) = server
        .post_json(
            &format!("/{}/read", plain.env_id),
            json!({"node_key": node_key}),
        )
        .await;
    assert!(body.get("accelerate").is_none());
}

#[tokio::test]
async fn test_quick_scripts() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;

    let (status, body) = server
        .get(&format!("/{}/{ENROLL_PATH}/enroll.sh", env.env_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(ENROLL_SECRET));
    assert!(body.contains(&env.env_id.to_string()));
    assert!(body.contains("fleet.example.com"));

    let (status, _) = server
        .get(&format!("/{}/{REMOVE_PATH}/remove.ps1", env.env_id))
        .await;
    assert_eq!(status, StatusCode::OK);

    // Paths are not interchangeable.
    let (status, _) = server
        .get(&format!("/{}/{REMOVE_PATH}/enroll.sh", env.env_id))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = server
        .get(&format!("/{}/{ENROLL_PATH}/install.bat", env.env_id))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let expired = server
        .create_environment_with("expired", |e| {
            e.enroll_expire = Some(OffsetDateTime::now_utc() - time::Duration::hours(1));
        })
        .await;
    let (status, _) = server
        .get(&format!("/{}/{ENROLL_PATH}/enroll.sh", expired.env_id))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
