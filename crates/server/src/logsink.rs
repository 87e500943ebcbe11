//! Destinations for logs pushed by agents.

use async_trait::async_trait;
use fleet_core::LogType;
use fleet_core::config::LogSinkConfig;
use fleet_metadata::models::NodeLogRow;
use fleet_metadata::repos::LogRepo;
use fleet_metadata::{MetadataError, MetadataStore};
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Log sink errors.
#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receives authenticated agent logs.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver one pushed payload. Arrays are delivered entry by entry.
    async fn send(
        &self,
        log_type: LogType,
        payload: &Value,
        env_id: Uuid,
        uuid: &str,
    ) -> Result<(), LogSinkError>;

    fn name(&self) -> &'static str;
}

/// Split a payload into its entries.
fn entries(payload: &Value) -> Vec<&Value> {
    match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Accepts and discards.
pub struct NoopSink;

#[async_trait]
impl LogSink for NoopSink {
    async fn send(&self, _: LogType, _: &Value, _: Uuid, _: &str) -> Result<(), LogSinkError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// One JSON line per entry on standard output.
pub struct StdoutSink;

#[async_trait]
impl LogSink for StdoutSink {
    async fn send(
        &self,
        log_type: LogType,
        payload: &Value,
        env_id: Uuid,
        uuid: &str,
    ) -> Result<(), LogSinkError> {
        let mut out = Vec::new();
        for entry in entries(payload) {
            let line = serde_json::json!({
                "environment": env_id,
                "uuid": uuid,
                "log_type": log_type.as_str(),
                "entry": entry,
            });
            serde_json::to_writer(&mut out, &line)?;
            out.push(b'\n');
        }
        if out.is_empty() {
            return Ok(());
        }
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&out).await?;
        stdout.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdout"
    }
}

/// Stores entries in the metadata database.
pub struct DbSink {
    store: Arc<dyn MetadataStore>,
}

impl DbSink {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LogSink for DbSink {
    async fn send(
        &self,
        log_type: LogType,
        payload: &Value,
        env_id: Uuid,
        uuid: &str,
    ) -> Result<(), LogSinkError> {
        let now = OffsetDateTime::now_utc();
        let rows = entries(payload)
            .into_iter()
            .map(|entry| {
                Ok(NodeLogRow {
                    log_id: Uuid::new_v4(),
                    env_id,
                    uuid: uuid.to_string(),
                    log_type: log_type.as_str().to_string(),
                    payload: serde_json::to_string(entry)?,
                    created_at: now,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        if rows.is_empty() {
            return Ok(());
        }
        self.store.insert_node_logs(&rows).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "db"
    }
}

/// Create the configured log sink.
pub fn from_config(config: &LogSinkConfig, store: Arc<dyn MetadataStore>) -> Arc<dyn LogSink> {
    match config {
        LogSinkConfig::None => Arc::new(NoopSink),
        LogSinkConfig::Stdout => Arc::new(StdoutSink),
        LogSinkConfig::Db => Arc::new(DbSink::new(store)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_metadata::SqliteStore;
    use serde_json::json;

    #[test]
    fn test_entries_split() {
        assert_eq!(entries(&json!([1, 2, 3])).len(), 3);
        assert_eq!(entries(&json!({"q": []})).len(), 1);
        assert!(entries(&Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_db_sink_stores_each_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(dir.path().join("m.db"), None).await.unwrap());
        let sink = from_config(&LogSinkConfig::Db, store.clone());
        assert_eq!(sink.name(), "db");

        let env_id = Uuid::new_v4();
        sink.send(
            LogType::Status,
            &json!([{"line": 1}, {"line": 2}]),
            env_id,
            "NODE-1",
        )
        .await
        .unwrap();

        let logs = store.list_node_logs(env_id, "NODE-1", "status").await.unwrap();
        let mut payloads: Vec<_> = logs.iter().map(|l| l.payload.as_str()).collect();
        payloads.sort();
        assert_eq!(payloads, vec![r#"{"line":1}"#, r#"{"line":2}"#]);
    }

    #[tokio::test]
    async fn test_none_sink_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(dir.path().join("m.db"), None).await.unwrap());
        let sink = from_config(&LogSinkConfig::None, store);
        sink.send(LogType::Result, &json!([1]), Uuid::new_v4(), "X")
            .await
            .unwrap();
    }
}
