//! Typed payloads for the Proxmox API endpoints the gateway touches.
//!
//! The API wraps everything in a `{"data": ...}` envelope (stripped by the
//! transport) and is loose about number formatting: several fields arrive as
//! either a JSON number or a quoted string depending on the cluster version,
//! hence the custom deserializers.

use serde::{Deserialize, Deserializer, Serialize};

/// One entry of `GET /nodes`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeListItem {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl NodeListItem {
    /// A node missing the status field is assumed reachable.
    pub fn is_online(&self) -> bool {
        self.status.as_deref() != Some("offline")
    }
}

/// One entry of `GET /cluster/resources?type=vm`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterVm {
    #[serde(deserialize_with = "de_u64_flexible")]
    pub vmid: u64,
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// `GET /nodes/{node}/qemu/{vmid}/config`, reduced to the fields the
/// usage aggregation cares about.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmConfigInfo {
    #[serde(default = "default_one", deserialize_with = "de_u64_flexible")]
    pub sockets: u64,
    #[serde(default = "default_one", deserialize_with = "de_u64_flexible")]
    pub cores: u64,
    /// Configured memory in MB.
    #[serde(default, deserialize_with = "de_opt_u64_flexible")]
    pub memory: Option<u64>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl VmConfigInfo {
    pub fn memory_mb(&self) -> u64 {
        self.memory.unwrap_or(0)
    }
}

/// `GET /nodes/{node}/status` — only the physical capacity fields.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeStatusInfo {
    pub cpuinfo: CpuInfo,
    pub memory: MemoryInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CpuInfo {
    /// Logical CPU count.
    pub cpus: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryInfo {
    /// Total memory in bytes.
    pub total: u64,
}

impl NodeStatusInfo {
    pub fn physical_memory_gb(&self) -> u64 {
        self.memory.total / (1024 * 1024 * 1024)
    }
}

/// `GET /nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmStatusInfo {
    pub status: String,
}

impl VmStatusInfo {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// `GET /version`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub release: Option<String>,
}

fn default_one() -> u64 {
    1
}

/// Accepts `3`, `3.0` or `"3"`.
pub fn de_u64_flexible<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Float(f64),
        Str(String),
    }

    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Float(f) => Ok(f as u64),
        Raw::Str(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| serde::de::Error::custom(format!("not an integer: {e}"))),
    }
}

pub fn de_opt_u64_flexible<'de, D>(de: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrap(#[serde(deserialize_with = "de_u64_flexible")] u64);

    Ok(Option::<Wrap>::deserialize(de)?.map(|w| w.0))
}
