//! Process-wide shared state: the one client handle, the current settings
//! snapshot, and the last known hypervisor connection status.
//!
//! Everything here is swapped, never mutated: readers clone an `Arc` out
//! under a momentary read lock and keep working on a consistent value while
//! a reload publishes the next one.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::ApiCache;
use crate::config::SettingsSnapshot;
use crate::proxmox::types::VersionInfo;

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub message: String,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            message: "not yet probed".to_string(),
        }
    }
}

pub struct StateManager {
    client: RwLock<Arc<ApiCache>>,
    settings: RwLock<Arc<SettingsSnapshot>>,
    status: RwLock<ConnectionStatus>,
}

impl StateManager {
    pub fn new(client: Arc<ApiCache>, settings: SettingsSnapshot) -> Self {
        Self {
            client: RwLock::new(client),
            settings: RwLock::new(Arc::new(settings)),
            status: RwLock::new(ConnectionStatus::default()),
        }
    }

    pub fn client(&self) -> Arc<ApiCache> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn settings(&self) -> Arc<SettingsSnapshot> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish a new settings snapshot. In-flight requests keep the Arc they
    /// already cloned; nobody observes a torn update.
    pub fn reload(&self, snapshot: SettingsSnapshot) {
        info!("publishing new settings snapshot");
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Swap the client handle wholesale, e.g. after credential rotation.
    /// The old handle (and its cache) drains as in-flight requests finish.
    pub fn replace_client(&self, client: Arc<ApiCache>) {
        info!("replacing hypervisor client handle");
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
    }

    /// Last probe outcome. Never issues a live call; the health endpoint
    /// must not become a load source.
    pub fn connection_status(&self) -> (bool, String) {
        let status = self
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        (status.connected, status.message)
    }

    /// One liveness probe against `/version`, recording the outcome for
    /// [`connection_status`](Self::connection_status). Bypasses the cache.
    pub async fn probe(&self) -> bool {
        let client = self.client();
        let outcome = match client.get_uncached_as::<VersionInfo>("/version").await {
            Ok(version) => ConnectionStatus {
                connected: true,
                message: format!("connected (pve {})", version.version),
            },
            Err(e) => {
                warn!(error = %e, "hypervisor liveness probe failed");
                ConnectionStatus {
                    connected: false,
                    message: "hypervisor unreachable".to_string(),
                }
            }
        };
        let connected = outcome.connected;
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = outcome;
        connected
    }

    /// Background probe loop keeping the status fresh.
    pub fn spawn_probe_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let state = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                state.probe().await;
            }
        })
    }
}
