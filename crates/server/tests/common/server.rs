//! Server test utilities.

use super::fixtures::{ENROLL_SECRET, enroll_body, environment_row};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleet_core::config::{AppConfig, MetadataConfig, StorageConfig};
use fleet_metadata::models::{EnvironmentRow, NodeRow};
use fleet_metadata::repos::{EnvironmentRepo, NodeRepo};
use fleet_metadata::{MetadataStore, SqliteStore};
use fleet_server::{AppState, create_router};
use fleet_storage::{FilesystemBackend, ObjectStore};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig {
            storage: StorageConfig::Filesystem { path: storage_path },
            metadata: MetadataConfig::Sqlite {
                path: db_path,
                query_timeout_secs: None,
            },
            ..AppConfig::for_testing()
        };
        modifier(&mut config);

        let state =
            AppState::new(config, storage, metadata).expect("Failed to create app state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Create an environment that accepts enrollments.
    pub async fn create_environment(&self, name: &str) -> EnvironmentRow {
        self.create_environment_with(name, |_| {}).await
    }

    /// Create an environment after applying `modifier` to the fixture row.
    pub async fn create_environment_with<F>(&self, name: &str, modifier: F) -> EnvironmentRow
    where
        F: FnOnce(&mut EnvironmentRow),
    {
        let mut env = environment_row(name);
        modifier(&mut env);
        self.metadata()
            .create_environment(&env)
            .await
            .expect("Failed to create environment");
        env
    }

    /// Enroll a host and return its node key.
    pub async fn enroll(&self, env: &EnvironmentRow, uuid: &str, platform: &str) -> String {
        let hostname = format!("host-{}", uuid.to_lowercase());
        let (status, body) = self
            .post_json(
                &format!("/{}/enroll", env.env_id),
                enroll_body(ENROLL_SECRET, uuid, platform, &hostname),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "enroll failed: {body}");
        assert_eq!(body["node_invalid"], false);
        body["node_key"]
            .as_str()
            .expect("node_key missing from enroll response")
            .to_string()
    }

    /// Look up an enrolled node by its UUID.
    pub async fn node(&self, env: &EnvironmentRow, uuid: &str) -> NodeRow {
        self.metadata()
            .get_node_by_uuid(env.env_id, &uuid.to_uppercase())
            .await
            .expect("Failed to query node")
            .expect("node not enrolled")
    }

    /// POST a JSON body.
    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let body = serde_json::to_vec(&body).expect("Failed to encode body");
        self.post_raw(uri, body, None).await
    }

    /// POST raw bytes with an optional `Content-Encoding`.
    pub async fn post_raw(
        &self,
        uri: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(encoding) = content_encoding {
            builder = builder.header("Content-Encoding", encoding);
        }
        let request = builder.body(Body::from(body)).unwrap();
        let (status, bytes) = self.send(request).await;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// GET a path and return the body as text.
    pub async fn get(&self, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let (status, bytes) = self.send(request).await;
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }
}
