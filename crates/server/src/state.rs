//! Application state shared across handlers.

use crate::carving::CarvingEngine;
use crate::dispatch::Dispatcher;
use crate::envcache::EnvironmentCache;
use crate::logsink::{self, LogSink};
use crate::ratelimit::RateLimitState;
use crate::tasks::TaskRegistry;
use crate::writer::MetadataWriter;
use fleet_core::NodeKeyGenerator;
use fleet_core::config::AppConfig;
use fleet_metadata::MetadataStore;
use fleet_storage::ObjectStore;
use std::sync::Arc;
use std::time::Duration;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage for carve blocks and archives.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Rate limiting and client address resolution.
    pub rate_limit: RateLimitState,
    /// Snapshot of tenant environments.
    pub environments: Arc<EnvironmentCache>,
    /// Batched node check-in writer.
    pub writer: MetadataWriter,
    /// Background tasks spawned by requests.
    pub tasks: Arc<TaskRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub carving: Arc<CarvingEngine>,
    pub log_sink: Arc<dyn LogSink>,
    pub node_keys: NodeKeyGenerator,
}

impl AppState {
    /// Create a new application state and start the metadata writer.
    ///
    /// Fails if the configuration is invalid. Warnings are logged.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self, String> {
        for warning in config.validate()? {
            tracing::warn!("Configuration warning: {}", warning);
        }

        let node_keys = match &config.server.node_key_secret {
            Some(secret) => NodeKeyGenerator::new(secret.as_bytes()),
            None => {
                tracing::warn!(
                    "server.node_key_secret is not set; using a random secret for this process"
                );
                NodeKeyGenerator::random()
            }
        }
        .map_err(|e| e.to_string())?;

        let tasks = Arc::new(TaskRegistry::new());
        let rate_limit = RateLimitState::new(&config.rate_limit);
        let environments = Arc::new(EnvironmentCache::new(metadata.clone()));
        let writer = MetadataWriter::spawn(metadata.clone(), &config.writer);
        let dispatcher = Arc::new(Dispatcher::new(metadata.clone(), config.dispatch.clone()));
        let carving = Arc::new(CarvingEngine::new(
            metadata.clone(),
            storage.clone(),
            config.carver.clone(),
            tasks.clone(),
        ));
        let log_sink = logsink::from_config(&config.log_sink, metadata.clone());
        tracing::info!(sink = log_sink.name(), "Log sink ready");

        Ok(Self {
            config: Arc::new(config),
            storage,
            metadata,
            rate_limit,
            environments,
            writer,
            tasks,
            dispatcher,
            carving,
            log_sink,
            node_keys,
        })
    }

    /// Get the cleanup interval for rate limiter, if enabled.
    /// A zero interval falls back to 60 seconds.
    pub fn rate_limit_cleanup_interval(&self) -> Option<Duration> {
        if !self.rate_limit.is_enabled() {
            return None;
        }
        let interval_secs = self.config.rate_limit.cleanup_interval_secs;
        if interval_secs == 0 {
            tracing::warn!("rate_limit.cleanup_interval_secs is 0, using default of 60 seconds");
            Some(Duration::from_secs(60))
        } else {
            Some(Duration::from_secs(interval_secs))
        }
    }
}
