//! In-memory snapshot of tenant environments.
//!
//! Every agent request needs its environment. Readers clone an `Arc` to
//! the current immutable snapshot; refreshes and misses build a new map and
//! swap it in under a short write lock.

use fleet_metadata::models::EnvironmentRow;
use fleet_metadata::repos::EnvironmentRepo;
use fleet_metadata::{MetadataResult, MetadataStore};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

type Snapshot = Arc<HashMap<Uuid, Arc<EnvironmentRow>>>;

pub struct EnvironmentCache {
    store: Arc<dyn MetadataStore>,
    snapshot: RwLock<Snapshot>,
}

impl EnvironmentCache {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn current(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Look up an environment, falling through to the store on a miss.
    pub async fn get(&self, env_id: Uuid) -> MetadataResult<Option<Arc<EnvironmentRow>>> {
        if let Some(env) = self.current().get(&env_id) {
            return Ok(Some(env.clone()));
        }

        crate::metrics::ENV_CACHE_MISSES.inc();
        let Some(env) = self.store.get_environment(env_id).await? else {
            return Ok(None);
        };
        let env = Arc::new(env);

        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = HashMap::clone(&guard);
        next.insert(env_id, env.clone());
        *guard = Arc::new(next);
        Ok(Some(env))
    }

    /// Reload every environment from the store. Returns how many were loaded.
    pub async fn refresh(&self) -> MetadataResult<usize> {
        let envs = self.store.list_environments().await?;
        let next: HashMap<Uuid, Arc<EnvironmentRow>> = envs
            .into_iter()
            .map(|env| (env.env_id, Arc::new(env)))
            .collect();
        let count = next.len();
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(next);
        Ok(count)
    }

    /// Spawn the periodic refresh. Failures keep the previous snapshot.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.refresh().await {
                    Ok(count) => tracing::debug!(environments = count, "Refreshed environments"),
                    Err(e) => tracing::warn!(error = %e, "Environment refresh failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_metadata::SqliteStore;
    use time::OffsetDateTime;

    fn env_row(name: &str) -> EnvironmentRow {
        let now = OffsetDateTime::now_utc();
        EnvironmentRow {
            env_id: Uuid::new_v4(),
            name: name.to_string(),
            secret: "secret".to_string(),
            enroll_secret_path: String::new(),
            enroll_expire: None,
            remove_secret_path: String::new(),
            remove_expire: None,
            accept_enrolls: true,
            debug_http: false,
            configuration: "{}".to_string(),
            accelerate_until: None,
            accelerated_seconds: 0,
            hostname: "localhost".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_miss_falls_through_and_refresh_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(dir.path().join("m.db"), None).await.unwrap());
        let cache = EnvironmentCache::new(store.clone());

        let mut env = env_row("dev");
        store.create_environment(&env).await.unwrap();
        assert!(cache.get(Uuid::new_v4()).await.unwrap().is_none());
        let cached = cache.get(env.env_id).await.unwrap().unwrap();
        assert!(cached.accept_enrolls);

        env.accept_enrolls = false;
        store.update_environment(&env).await.unwrap();
        // served from the snapshot until refreshed
        assert!(cache.get(env.env_id).await.unwrap().unwrap().accept_enrolls);

        assert_eq!(cache.refresh().await.unwrap(), 1);
        assert!(!cache.get(env.env_id).await.unwrap().unwrap().accept_enrolls);
    }
}
