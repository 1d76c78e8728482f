//! Configuration Snapshot Store
//!
//! Holds the current, immutable set of webhook configurations. A refresh pulls
//! the backing `ConfigurationStore` and publishes a new snapshot through a
//! watch channel only when the content revision changes. Requests capture one
//! `Arc<ConfigurationSnapshot>` at entry and never observe a partial update.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::ConfigurationStore;
use super::types::{WebhookConfiguration, WebhookRule};
use crate::error::{Error, Result};

/// Default interval between store pulls
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time view of the registered configurations
#[derive(Debug, Clone)]
pub struct ConfigurationSnapshot {
    configurations: Vec<WebhookConfiguration>,
    revision: String,
    loaded_at: DateTime<Utc>,
}

impl Default for ConfigurationSnapshot {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ConfigurationSnapshot {
    /// Build a snapshot; configurations are ordered by name
    pub fn new(mut configurations: Vec<WebhookConfiguration>) -> Self {
        configurations.sort_by(|a, b| a.name.cmp(&b.name));
        let revision = revision_of(&configurations);
        Self {
            configurations,
            revision,
            loaded_at: Utc::now(),
        }
    }

    pub fn configurations(&self) -> &[WebhookConfiguration] {
        &self.configurations
    }

    /// Every webhook rule, configurations by name and webhooks as listed
    pub fn webhooks(&self) -> impl Iterator<Item = (&WebhookConfiguration, &WebhookRule)> {
        self.configurations
            .iter()
            .flat_map(|config| config.webhooks.iter().map(move |hook| (config, hook)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configurations.iter().any(|c| c.name == name)
    }

    /// SHA-256 of the snapshot content
    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }
}

fn revision_of(configurations: &[WebhookConfiguration]) -> String {
    let mut hasher = Sha256::new();
    for config in configurations {
        // serde_json output for these types is deterministic
        if let Ok(bytes) = serde_json::to_vec(config) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Publishes configuration snapshots pulled from a `ConfigurationStore`
pub struct SnapshotStore {
    store: Arc<dyn ConfigurationStore>,
    tx: watch::Sender<Arc<ConfigurationSnapshot>>,
    loaded: AtomicBool,
    feature_enabled: AtomicBool,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ConfigurationStore>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ConfigurationSnapshot::default()));
        Self {
            store,
            tx,
            loaded: AtomicBool::new(false),
            feature_enabled: AtomicBool::new(true),
        }
    }

    /// The backing configuration store
    pub fn store(&self) -> &Arc<dyn ConfigurationStore> {
        &self.store
    }

    /// The snapshot a new request should use
    pub fn current(&self) -> Arc<ConfigurationSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigurationSnapshot>> {
        self.tx.subscribe()
    }

    /// Whether at least one refresh has completed
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// False once the store has reported the configuration API as absent
    pub fn feature_enabled(&self) -> bool {
        self.feature_enabled.load(Ordering::Acquire)
    }

    /// Pull the store once. Returns true if a new snapshot was published.
    ///
    /// A store error leaves the previous snapshot in place.
    pub async fn refresh(&self) -> Result<bool> {
        let configurations = match self.store.list().await {
            Ok(configurations) => configurations,
            Err(Error::FeatureDisabled(reason)) => {
                if self.feature_enabled.swap(false, Ordering::AcqRel) {
                    warn!(
                        "Dynamic admission is disabled, all requests will be admitted: {}",
                        reason
                    );
                }
                self.loaded.store(true, Ordering::Release);
                return Ok(self.publish(ConfigurationSnapshot::default()));
            }
            Err(e) => return Err(e),
        };

        if !self.feature_enabled.swap(true, Ordering::AcqRel) {
            info!("Dynamic admission configuration API is available again");
        }
        self.loaded.store(true, Ordering::Release);
        Ok(self.publish(ConfigurationSnapshot::new(configurations)))
    }

    fn publish(&self, snapshot: ConfigurationSnapshot) -> bool {
        let published = self.tx.send_if_modified(|current| {
            if current.revision() == snapshot.revision() {
                return false;
            }
            *current = Arc::new(snapshot.clone());
            true
        });

        if published {
            info!(
                "Published configuration snapshot {} with {} configuration(s)",
                &snapshot.revision()[..12],
                snapshot.len()
            );
            #[cfg(feature = "metrics")]
            crate::metrics::set_snapshot_configurations(snapshot.len());
        }
        published
    }

    /// Refresh on an interval until the returned task is aborted
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.refresh().await {
                    Ok(true) => {}
                    Ok(false) => debug!("Configuration snapshot unchanged"),
                    Err(e) => warn!("Failed to refresh webhook configurations: {}", e),
                }
            }
        })
    }

    /// Wait until the published snapshot satisfies `predicate`
    pub async fn wait_until<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> Result<Arc<ConfigurationSnapshot>>
    where
        F: Fn(&ConfigurationSnapshot) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| predicate(s.as_ref()))).await;
        match waited {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            Ok(Err(_)) => Err(Error::Timeout("configuration snapshot channel closed".into())),
            Err(_) => Err(Error::Timeout(format!(
                "configuration snapshot after {timeout:?}"
            ))),
        }
    }

    /// Wait until the snapshot with the given revision is published
    pub async fn wait_for_revision(
        &self,
        revision: &str,
        timeout: Duration,
    ) -> Result<Arc<ConfigurationSnapshot>> {
        self.wait_until(|s| s.revision() == revision, timeout).await
    }
}
