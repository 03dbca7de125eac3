//! Per-node usage aggregation across portal-managed VMs.
//!
//! Best-effort by design: a single unreadable VM config is skipped, and a
//! failed cluster-wide listing degrades to zero usage rather than blocking
//! provisioning. Admission control built on this data is protective, not a
//! hard gate of last resort.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::ApiCache;
use crate::config::SettingsSnapshot;
use crate::errors::GatewayResult;
use crate::proxmox::types::{ClusterVm, NodeListItem, VmConfigInfo};

/// Current aggregate usage on one node, merged with its configured caps.
/// Derived per admission check, never persisted. Memory is accumulated in
/// MB; GB conversion happens only at read time to avoid rounding drift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeUsage {
    pub node: String,
    pub vm_count: u64,
    pub total_cores: u64,
    pub total_memory_mb: u64,
    /// Configured cap; 0 means unconstrained.
    pub max_cores: u64,
    /// Configured cap; 0 means unconstrained.
    pub max_memory_gb: u64,
}

impl NodeUsage {
    pub fn total_memory_gb(&self) -> u64 {
        self.total_memory_mb / 1024
    }
}

/// Split a Proxmox tag string on both `;` and `,`, trimming whitespace and
/// dropping empties.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(|c| c == ';' || c == ',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_management_tag(config: &VmConfigInfo, management_tag: &str) -> bool {
    match &config.tags {
        Some(raw) => parse_tags(raw)
            .iter()
            .any(|t| t.eq_ignore_ascii_case(management_tag)),
        None => false,
    }
}

/// Walk every VM tagged as portal-managed and sum configured cores
/// (`sockets × cores`) and memory per node.
///
/// Failure handling, in order of blast radius:
/// - node listing fails: returned as an error; without node names there is
///   no map to build (the caller degrades to an empty map);
/// - cluster-wide VM listing fails: zeroed usage for every known node, Ok;
/// - one VM's config fetch fails: that VM is skipped with a warning.
pub async fn compute_node_usage(
    cache: &ApiCache,
    snapshot: &SettingsSnapshot,
) -> GatewayResult<HashMap<String, NodeUsage>> {
    let nodes: Vec<NodeListItem> = cache.get_as("/nodes").await?;

    // Offline nodes cannot take placements and their VMs cannot be queried;
    // they are left out of the map entirely.
    let mut usage: HashMap<String, NodeUsage> = nodes
        .iter()
        .filter(|n| n.is_online())
        .map(|n| {
            let limit = snapshot.node_limit(&n.node);
            (
                n.node.clone(),
                NodeUsage {
                    node: n.node.clone(),
                    max_cores: limit.max_cores,
                    max_memory_gb: limit.max_memory_gb,
                    ..Default::default()
                },
            )
        })
        .collect();

    let vms: Vec<ClusterVm> = match cache.get_as("/cluster/resources?type=vm").await {
        Ok(vms) => vms,
        Err(e) => {
            warn!(error = %e, "cluster VM listing failed, reporting zero usage");
            return Ok(usage);
        }
    };

    let management_tag = snapshot.management_tag();
    for vm in &vms {
        let config_path = format!("/nodes/{}/qemu/{}/config", vm.node, vm.vmid);
        let config: VmConfigInfo = match cache.get_as(&config_path).await {
            Ok(config) => config,
            Err(e) => {
                warn!(vmid = vm.vmid, node = %vm.node, error = %e, "skipping VM, config fetch failed");
                continue;
            }
        };

        if !has_management_tag(&config, &management_tag) {
            continue;
        }

        let entry = usage.entry(vm.node.clone()).or_insert_with(|| NodeUsage {
            node: vm.node.clone(),
            ..Default::default()
        });
        entry.vm_count += 1;
        // Saturating: hostile or corrupt VM configs must not panic the sum.
        entry.total_cores = entry
            .total_cores
            .saturating_add(config.sockets.saturating_mul(config.cores));
        entry.total_memory_mb = entry.total_memory_mb.saturating_add(config.memory_mb());
    }

    debug!(nodes = usage.len(), vms = vms.len(), "node usage computed");
    Ok(usage)
}
