//! Registry of autopilot instances.
//!
//! In dedicated mode every user gets an instance they permanently own. In
//! shared mode all users resolve to one controller that the starting user
//! owns until it stops. Instance creation and eviction only touch the
//! registry, never another instance's locks.

use autopilot_core::{AppConfig, Error, OwnershipMode, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::instance::{
    AutopilotInstance, InstanceDeps, InstanceOptions, InstanceStatus, StartOutcome, StopOutcome,
};
use crate::persistence::PersistenceStats;

/// Registry key of the shared controller.
pub const SHARED_INSTANCE_ID: &str = "shared";

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub ownership_mode: OwnershipMode,
    /// Idle instances older than this are evicted.
    pub retention: ChronoDuration,
    pub cleanup_interval: Duration,
    pub instance: InstanceOptions,
}

impl ManagerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ownership_mode: config.ownership_mode,
            retention: config.retention(),
            cleanup_interval: config.cleanup_interval(),
            instance: InstanceOptions::from_config(config),
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Status of a user's autopilot, including when none exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAutopilotStatus {
    pub user_id: String,
    pub exists: bool,
    pub message: Option<String>,
    pub instance: Option<InstanceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub ownership_mode: String,
    pub instance_count: usize,
    pub running_count: usize,
    pub running_users: Vec<String>,
    pub persistence: PersistenceStats,
}

type InstanceCell = Arc<OnceCell<Arc<AutopilotInstance>>>;

pub struct AutopilotManager {
    options: ManagerOptions,
    deps: InstanceDeps,
    instances: DashMap<String, InstanceCell>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl AutopilotManager {
    pub fn new(options: ManagerOptions, deps: InstanceDeps) -> Arc<Self> {
        info!(
            ownership_mode = ?options.ownership_mode,
            retention_minutes = options.retention.num_minutes(),
            "Autopilot manager created"
        );
        Arc::new(Self {
            options,
            deps,
            instances: DashMap::new(),
            cleanup: Mutex::new(None),
        })
    }

    pub fn ownership_mode(&self) -> OwnershipMode {
        self.options.ownership_mode
    }

    fn instance_key<'a>(&self, user_id: &'a str) -> &'a str {
        match self.options.ownership_mode {
            OwnershipMode::Dedicated => user_id,
            OwnershipMode::Shared => SHARED_INSTANCE_ID,
        }
    }

    /// Resolve the user's instance, creating it on first use. Concurrent
    /// callers for the same key share one creation.
    pub async fn get_or_create_instance(&self, user_id: &str) -> Arc<AutopilotInstance> {
        let key = self.instance_key(user_id).to_string();
        let cell = self
            .instances
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let instance = cell
            .get_or_init(|| async {
                let owner = match self.options.ownership_mode {
                    OwnershipMode::Dedicated => Some(user_id.to_string()),
                    OwnershipMode::Shared => None,
                };
                AutopilotInstance::load(
                    key.clone(),
                    owner,
                    self.deps.clone(),
                    self.options.instance.clone(),
                )
                .await
            })
            .await
            .clone();
        instance.touch();
        instance
    }

    /// The user's instance if it has been created.
    pub fn get_instance(&self, user_id: &str) -> Option<Arc<AutopilotInstance>> {
        self.instances
            .get(self.instance_key(user_id))
            .and_then(|cell| cell.get().cloned())
    }

    fn all_instances(&self) -> Vec<Arc<AutopilotInstance>> {
        self.instances
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    pub async fn start_autopilot(&self, user_id: &str) -> Result<StartOutcome> {
        let instance = self.get_or_create_instance(user_id).await;
        let outcome = instance.start(user_id).await?;
        if let StartOutcome::AlreadyRunning { owner } = &outcome {
            info!(user_id, owner = ?owner, "Autopilot already running");
        }
        Ok(outcome)
    }

    pub async fn stop_autopilot(&self, user_id: &str) -> Result<StopOutcome> {
        match self.get_instance(user_id) {
            Some(instance) => instance.stop(user_id).await,
            None => Ok(StopOutcome::NotRunning),
        }
    }

    pub async fn set_owner(&self, user_id: &str) -> Result<()> {
        self.get_or_create_instance(user_id)
            .await
            .set_owner(user_id)
            .await
    }

    /// Release the shared controller.
    pub async fn clear_owner(&self) -> Result<()> {
        if self.options.ownership_mode == OwnershipMode::Dedicated {
            return Err(Error::Validation(
                "ownership is fixed per user in dedicated mode".to_string(),
            ));
        }
        if let Some(instance) = self.get_instance(SHARED_INSTANCE_ID) {
            if instance.is_running() {
                return Err(Error::Validation(
                    "stop the autopilot before clearing its owner".to_string(),
                ));
            }
            instance.clear_owner().await;
        }
        Ok(())
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.get_instance(user_id)
            .map(|instance| instance.is_running())
            .unwrap_or(false)
    }

    /// Status for any user. A missing instance is a status, not an error.
    pub async fn instance_status(&self, user_id: &str) -> UserAutopilotStatus {
        match self.get_instance(user_id) {
            Some(instance) => UserAutopilotStatus {
                user_id: user_id.to_string(),
                exists: true,
                message: None,
                instance: Some(instance.status().await),
            },
            None => UserAutopilotStatus {
                user_id: user_id.to_string(),
                exists: false,
                message: Some("no autopilot instance".to_string()),
                instance: None,
            },
        }
    }

    /// Owners of running instances.
    pub async fn running_users(&self) -> Vec<String> {
        let mut users = Vec::new();
        for instance in self.all_instances() {
            if instance.is_running() {
                users.push(
                    instance
                        .owner()
                        .await
                        .unwrap_or_else(|| instance.id().to_string()),
                );
            }
        }
        users.sort();
        users
    }

    pub async fn manager_status(&self) -> ManagerStatus {
        let running_users = self.running_users().await;
        ManagerStatus {
            ownership_mode: match self.options.ownership_mode {
                OwnershipMode::Dedicated => "dedicated".to_string(),
                OwnershipMode::Shared => "shared".to_string(),
            },
            instance_count: self.all_instances().len(),
            running_count: running_users.len(),
            running_users,
            persistence: self.deps.persistence.stats(),
        }
    }

    /// Remove stopped instances idle for longer than the retention window.
    /// Returns the evicted instance ids.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let retention = self.options.retention;
        let is_idle = |instance: &AutopilotInstance| {
            !instance.is_running() && now - instance.last_active() > retention
        };

        let mut evicted = Vec::new();
        for instance in self.all_instances() {
            if !is_idle(&instance) {
                continue;
            }
            let removed = self.instances.remove_if(instance.id(), |_, cell| {
                cell.get().is_some_and(|current| {
                    Arc::ptr_eq(current, &instance) && is_idle(current)
                })
            });
            if removed.is_some() {
                // A start may have slipped in after the idle check.
                instance.force_stop().await;
                evicted.push(instance.id().to_string());
            }
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), instances = ?evicted, "Evicted idle autopilot instances");
        }
        evicted
    }

    /// Periodically evict idle instances until `shutdown`.
    pub async fn spawn_cleanup_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = self.options.cleanup_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.evict_idle(Utc::now()).await;
            }
        });

        if let Some(previous) = self.cleanup.lock().await.replace(task) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Instance cleanup loop spawned");
    }

    /// Load each user's instance and start those whose stored settings ask
    /// for it. Returns the users that were started.
    pub async fn auto_start(&self, user_ids: &[String]) -> Vec<String> {
        let mut started = Vec::new();
        for user_id in user_ids {
            let instance = self.get_or_create_instance(user_id).await;
            if !instance.auto_start_enabled() {
                continue;
            }
            match instance.start(user_id).await {
                Ok(StartOutcome::Started) => started.push(user_id.clone()),
                Ok(StartOutcome::AlreadyRunning { .. }) => {}
                Err(e) => warn!(user_id = %user_id, error = %e, "Auto-start failed"),
            }
        }
        if !started.is_empty() {
            info!(count = started.len(), "Autopilot instances auto-started");
        }
        started
    }

    /// Stop every instance and drain pending persistence.
    pub async fn shutdown(&self) {
        if let Some(cleanup) = self.cleanup.lock().await.take() {
            cleanup.abort();
        }

        for instance in self.all_instances() {
            if instance.force_stop().await == StopOutcome::Stopped {
                info!(instance = %instance.id(), "Instance stopped for shutdown");
            }
        }
        self.deps.persistence.shutdown().await;

        let running = self.all_instances().iter().filter(|i| i.is_running()).count();
        if running > 0 {
            error!(running, "Instances still running after shutdown");
        }
        info!("Autopilot manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::PaperClientFactory;
    use crate::persistence::PersistenceQueue;
    use autopilot_core::{ErrorKind, MemorySettingsStore, SettingsKey, SettingsStore};
    use rust_decimal::Decimal;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn manager_with(mode: OwnershipMode, store: Arc<MemorySettingsStore>) -> Arc<AutopilotManager> {
        let factory = Arc::new(PaperClientFactory::new(Decimal::new(10_000, 0)));
        let deps = InstanceDeps {
            store: store.clone(),
            persistence: Arc::new(PersistenceQueue::spawn(store, 64)),
            factory,
        };
        let options = ManagerOptions {
            ownership_mode: mode,
            retention: ChronoDuration::minutes(30),
            cleanup_interval: Duration::from_secs(300),
            instance: InstanceOptions {
                loop_interval: Duration::from_secs(3600),
                stop_timeout: Duration::from_secs(1),
                ..InstanceOptions::default()
            },
        };
        AutopilotManager::new(options, deps)
    }

    fn manager(mode: OwnershipMode) -> Arc<AutopilotManager> {
        manager_with(mode, Arc::new(MemorySettingsStore::new()))
    }

    #[tokio::test]
    async fn test_concurrent_start_single_winner() {
        let manager = manager(OwnershipMode::Shared);

        let (a, b) = tokio::join!(
            manager.start_autopilot("alice"),
            manager.start_autopilot("alice")
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let started = outcomes
            .iter()
            .filter(|o| **o == StartOutcome::Started)
            .count();
        assert_eq!(started, 1);
        assert!(outcomes.contains(&StartOutcome::AlreadyRunning {
            owner: Some("alice".to_string())
        }));
        assert_eq!(manager.manager_status().await.instance_count, 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_creation_shares_instance() {
        let manager = manager(OwnershipMode::Dedicated);
        let (a, b) = tokio::join!(
            manager.get_or_create_instance("alice"),
            manager.get_or_create_instance("alice")
        );
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_shared_mode_ownership_released_on_stop() {
        let manager = manager(OwnershipMode::Shared);
        manager.start_autopilot("alice").await.unwrap();
        assert!(manager.is_running("bob"));

        let err = manager.stop_autopilot("bob").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(manager.is_running("alice"));

        assert_eq!(
            manager.stop_autopilot("alice").await.unwrap(),
            StopOutcome::Stopped
        );
        let instance = manager.get_instance("alice").unwrap();
        assert_eq!(instance.owner().await, None);

        assert_eq!(
            manager.start_autopilot("bob").await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(manager.running_users().await, vec!["bob".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dedicated_mode_isolates_users() {
        let manager = manager(OwnershipMode::Dedicated);
        manager.start_autopilot("alice").await.unwrap();
        manager.start_autopilot("bob").await.unwrap();

        let alice = manager.get_instance("alice").unwrap();
        let bob = manager.get_instance("bob").unwrap();
        assert!(!Arc::ptr_eq(&alice, &bob));

        manager.stop_autopilot("alice").await.unwrap();
        assert_eq!(alice.owner().await.as_deref(), Some("alice"));
        assert!(bob.is_running());
        assert!(manager.clear_owner().await.is_err());
        assert_ok!(manager.set_owner("alice").await);

        manager.shutdown().await;
        assert!(!bob.is_running());
    }

    #[tokio::test]
    async fn test_status_without_instance() {
        let manager = manager(OwnershipMode::Dedicated);
        let status = manager.instance_status("nobody").await;
        assert!(!status.exists);
        assert_eq!(status.message.as_deref(), Some("no autopilot instance"));
        assert!(status.instance.is_none());
        assert!(!manager.is_running("nobody"));
        assert_eq!(
            manager.stop_autopilot("nobody").await.unwrap(),
            StopOutcome::NotRunning
        );
    }

    #[tokio::test]
    async fn test_evict_idle_skips_running() {
        let manager = manager(OwnershipMode::Dedicated);
        manager.get_or_create_instance("idle").await;
        manager.start_autopilot("busy").await.unwrap();

        let soon = Utc::now() + ChronoDuration::minutes(5);
        assert!(manager.evict_idle(soon).await.is_empty());

        let later = Utc::now() + ChronoDuration::minutes(31);
        let evicted = manager.evict_idle(later).await;
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert!(manager.get_instance("idle").is_none());
        assert!(manager.get_instance("busy").is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_start_honours_stored_flag() {
        let store = Arc::new(MemorySettingsStore::new());
        store
            .save(
                "alice",
                SettingsKey::Trading,
                json!({ "dry_run": true, "auto_start": true }),
            )
            .await
            .unwrap();
        let manager = manager_with(OwnershipMode::Dedicated, store);

        let started = manager
            .auto_start(&["alice".to_string(), "bob".to_string()])
            .await;
        assert_eq!(started, vec!["alice".to_string()]);
        assert!(manager.is_running("alice"));
        assert!(!manager.is_running("bob"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_status_counts() {
        let manager = manager(OwnershipMode::Dedicated);
        manager.start_autopilot("alice").await.unwrap();
        manager.get_or_create_instance("bob").await;

        let status = manager.manager_status().await;
        assert_eq!(status.ownership_mode, "dedicated");
        assert_eq!(status.instance_count, 2);
        assert_eq!(status.running_count, 1);
        assert_eq!(status.running_users, vec!["alice".to_string()]);

        manager.shutdown().await;
    }
}
