//! Layered configuration: hardcoded defaults, then `default.toml`, then
//! `local.toml`, then `PVMSS_`-prefixed environment variables. The loaded
//! `Settings` is converted once into an immutable [`SettingsSnapshot`] that
//! validation reads for the duration of one request.

use std::collections::{HashMap, HashSet};

use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub proxmox: ProxmoxSettings,
    #[serde(default)]
    pub limits: VmLimits,
    /// Per-node aggregate caps, keyed by node name.
    #[serde(default)]
    pub nodes: HashMap<String, NodeLimit>,
    /// Storages users may place disks on.
    #[serde(default)]
    pub storages: Vec<String>,
    /// Tags applied to every portal-managed VM; the first entry is the
    /// management tag used to scope usage aggregation.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub isos: Vec<String>,
    #[serde(default)]
    pub bridges: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxSettings {
    /// Base URL including the API prefix, e.g. `https://pve:8006/api2/json`.
    pub api_url: String,
    /// Token id in `user@realm!name` form.
    pub token_id: String,
    pub token_secret: String,
    /// Set false for clusters running self-signed certificates.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Inclusive [min, max] for one resource kind. An unconfigured kind is
/// simply absent and passes unchecked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceRange {
    pub min: u64,
    pub max: u64,
}

impl ResourceRange {
    pub fn contains(&self, value: u64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmLimits {
    #[serde(default)]
    pub sockets: Option<ResourceRange>,
    #[serde(default)]
    pub cores: Option<ResourceRange>,
    #[serde(default)]
    pub memory_mb: Option<ResourceRange>,
    #[serde(default)]
    pub disk_gb: Option<ResourceRange>,
}

/// Aggregate cap for one node. Zero means unconstrained on that dimension.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeLimit {
    #[serde(default)]
    pub max_cores: u64,
    #[serde(default)]
    pub max_memory_gb: u64,
}

impl Settings {
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", config_path);

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .add_source(File::with_name(&format!("{}/default", config_path)))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(config::Environment::with_prefix("PVMSS").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Point-in-time copy handed to the validator. Reloads publish a fresh
    /// snapshot through the state manager; this value is never mutated.
    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            vm_limits: self.limits.clone(),
            node_limits: self.nodes.clone(),
            enabled_storages: self.storages.iter().cloned().collect(),
            tags: self.tags.clone(),
            iso_allowlist: self.isos.iter().cloned().collect(),
            bridge_allowlist: self.bridges.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettingsSnapshot {
    pub vm_limits: VmLimits,
    pub node_limits: HashMap<String, NodeLimit>,
    pub enabled_storages: HashSet<String>,
    pub tags: Vec<String>,
    pub iso_allowlist: HashSet<String>,
    pub bridge_allowlist: HashSet<String>,
}

impl SettingsSnapshot {
    /// The marker identifying portal-managed VMs, compared case-insensitively.
    pub fn management_tag(&self) -> String {
        self.tags
            .first()
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "pvmss".to_string())
    }

    pub fn node_limit(&self, node: &str) -> NodeLimit {
        self.node_limits.get(node).copied().unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn management_tag_defaults_when_unconfigured() {
        let snapshot = SettingsSnapshot::default();
        assert_eq!(snapshot.management_tag(), "pvmss");
    }

    #[test]
    fn management_tag_is_first_entry_lowercased() {
        let snapshot = SettingsSnapshot {
            tags: vec!["Portal".to_string(), "web".to_string()],
            ..Default::default()
        };
        assert_eq!(snapshot.management_tag(), "portal");
    }

    #[test]
    fn missing_node_limit_is_unconstrained() {
        let snapshot = SettingsSnapshot::default();
        let limit = snapshot.node_limit("pve1");
        assert_eq!(limit.max_cores, 0);
        assert_eq!(limit.max_memory_gb, 0);
    }

    #[test]
    fn resource_range_is_inclusive() {
        let range = ResourceRange { min: 1, max: 8 };
        assert!(range.contains(1));
        assert!(range.contains(8));
        assert!(!range.contains(9));
    }
}
