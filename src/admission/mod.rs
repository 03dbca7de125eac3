//! Admission control: accept or reject a resource request before anything
//! is committed on the cluster.
//!
//! Three independent checks. Per-VM bounds and per-node aggregate caps run
//! on every provisioning request; the physical-capacity ceiling guards
//! administrative node-limit edits and is advisory (a failed capacity
//! lookup is logged and skipped, never fatal).

use std::collections::HashMap;

use tracing::warn;

use crate::cache::ApiCache;
use crate::config::{NodeLimit, SettingsSnapshot};
use crate::errors::{GatewayResult, ValidationError};
use crate::provision::ProvisionRequest;
use crate::proxmox::types::NodeStatusInfo;
use crate::usage::NodeUsage;

/// Validate a proposed VM against per-VM bounds, allowlists and the target
/// node's aggregate caps. `usage` comes from
/// [`crate::usage::compute_node_usage`] over the same snapshot; an empty map
/// (degraded aggregation) leaves only the per-VM checks in force.
pub fn validate_request(
    request: &ProvisionRequest,
    usage: &HashMap<String, NodeUsage>,
    snapshot: &SettingsSnapshot,
) -> Result<(), ValidationError> {
    check_vm_bounds(request, snapshot)?;
    check_allowlists(request, snapshot)?;
    check_node_caps(request, usage, snapshot)?;
    Ok(())
}

fn check_range(
    field: &'static str,
    value: u64,
    range: Option<crate::config::ResourceRange>,
) -> Result<(), ValidationError> {
    match range {
        Some(r) if !r.contains(value) => Err(ValidationError::OutOfRange {
            field,
            value,
            min: r.min,
            max: r.max,
        }),
        _ => Ok(()),
    }
}

fn check_vm_bounds(
    request: &ProvisionRequest,
    snapshot: &SettingsSnapshot,
) -> Result<(), ValidationError> {
    let limits = &snapshot.vm_limits;
    check_range("sockets", request.sockets, limits.sockets)?;
    check_range("cores", request.cores, limits.cores)?;
    check_range("memory_mb", request.memory_mb, limits.memory_mb)?;
    check_range("disk_gb", request.disk_gb, limits.disk_gb)?;
    Ok(())
}

fn check_allowlists(
    request: &ProvisionRequest,
    snapshot: &SettingsSnapshot,
) -> Result<(), ValidationError> {
    // An empty list means the operator configured no restriction.
    if !snapshot.enabled_storages.is_empty()
        && !snapshot.enabled_storages.contains(&request.storage)
    {
        return Err(ValidationError::NotAllowed {
            field: "storage",
            value: request.storage.clone(),
        });
    }
    if !snapshot.bridge_allowlist.is_empty()
        && !snapshot.bridge_allowlist.contains(&request.bridge)
    {
        return Err(ValidationError::NotAllowed {
            field: "bridge",
            value: request.bridge.clone(),
        });
    }
    if let Some(iso) = &request.iso {
        if !snapshot.iso_allowlist.is_empty() && !snapshot.iso_allowlist.contains(iso) {
            return Err(ValidationError::NotAllowed {
                field: "iso",
                value: iso.clone(),
            });
        }
    }
    Ok(())
}

fn check_node_caps(
    request: &ProvisionRequest,
    usage: &HashMap<String, NodeUsage>,
    snapshot: &SettingsSnapshot,
) -> Result<(), ValidationError> {
    let limit = snapshot.node_limit(&request.node);
    let current = usage.get(&request.node);

    // Memory is compared in MB end to end; converting the cap up instead of
    // the usage down keeps a few-hundred-MB overshoot visible. Saturating
    // arithmetic: an absurd request clamps to u64::MAX and fails the cap
    // comparison instead of panicking the request task.
    if limit.max_cores > 0 {
        let attempted = current
            .map_or(0, |u| u.total_cores)
            .saturating_add(request.sockets.saturating_mul(request.cores));
        if attempted > limit.max_cores {
            return Err(ValidationError::NodeCapExceeded {
                node: request.node.clone(),
                resource: "cores",
                limit: limit.max_cores,
                attempted,
            });
        }
    }
    if limit.max_memory_gb > 0 {
        let cap_mb = limit.max_memory_gb.saturating_mul(1024);
        let attempted_mb = current
            .map_or(0, |u| u.total_memory_mb)
            .saturating_add(request.memory_mb);
        if attempted_mb > cap_mb {
            return Err(ValidationError::NodeCapExceeded {
                node: request.node.clone(),
                resource: "memory_mb",
                limit: cap_mb,
                attempted: attempted_mb,
            });
        }
    }
    Ok(())
}

/// Advisory check for node limit edits: a configured cap should not exceed
/// what the node physically has. If the capacity lookup fails the check is
/// skipped — it protects against operator typos, not runtime safety.
pub async fn validate_node_limits(
    cache: &ApiCache,
    node: &str,
    proposed: NodeLimit,
) -> GatewayResult<()> {
    let status: NodeStatusInfo = match cache.get_as(&format!("/nodes/{node}/status")).await {
        Ok(status) => status,
        Err(e) => {
            warn!(node = node, error = %e, "physical capacity lookup failed, skipping ceiling check");
            return Ok(());
        }
    };

    let physical_cpus = u64::from(status.cpuinfo.cpus);
    if proposed.max_cores > 0 && proposed.max_cores > physical_cpus {
        return Err(ValidationError::ExceedsPhysical {
            node: node.to_string(),
            resource: "cores",
            proposed: proposed.max_cores,
            physical: physical_cpus,
        }
        .into());
    }

    let physical_gb = status.physical_memory_gb();
    if proposed.max_memory_gb > 0 && proposed.max_memory_gb > physical_gb {
        return Err(ValidationError::ExceedsPhysical {
            node: node.to_string(),
            resource: "memory_gb",
            proposed: proposed.max_memory_gb,
            physical: physical_gb,
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceRange, VmLimits};

    fn request(node: &str, sockets: u64, cores: u64, memory_mb: u64) -> ProvisionRequest {
        ProvisionRequest {
            node: node.to_string(),
            name: "test-vm".to_string(),
            vmid: None,
            sockets,
            cores,
            memory_mb,
            disk_gb: 10,
            tags: vec![],
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            iso: None,
        }
    }

    fn snapshot_with_node_cap(node: &str, max_cores: u64) -> SettingsSnapshot {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.node_limits.insert(
            node.to_string(),
            NodeLimit {
                max_cores,
                max_memory_gb: 0,
            },
        );
        snapshot
    }

    fn usage_with(node: &str, total_cores: u64, total_memory_mb: u64) -> HashMap<String, NodeUsage> {
        let mut usage = HashMap::new();
        usage.insert(
            node.to_string(),
            NodeUsage {
                node: node.to_string(),
                vm_count: 3,
                total_cores,
                total_memory_mb,
                ..Default::default()
            },
        );
        usage
    }

    #[test]
    fn accepts_request_within_node_core_cap() {
        let snapshot = snapshot_with_node_cap("pve1", 8);
        let usage = usage_with("pve1", 6, 0);
        assert!(validate_request(&request("pve1", 1, 2, 512), &usage, &snapshot).is_ok());
    }

    #[test]
    fn rejects_request_over_node_core_cap_naming_both_numbers() {
        let snapshot = snapshot_with_node_cap("pve1", 8);
        let usage = usage_with("pve1", 6, 0);
        let err = validate_request(&request("pve1", 1, 3, 512), &usage, &snapshot).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("limit 8"), "got: {message}");
        assert!(message.contains("attempted total 9"), "got: {message}");
    }

    #[test]
    fn sockets_multiply_into_core_cap() {
        let snapshot = snapshot_with_node_cap("pve1", 8);
        let usage = usage_with("pve1", 0, 0);
        // 2 sockets x 4 cores = 8, exactly at the cap
        assert!(validate_request(&request("pve1", 2, 4, 512), &usage, &snapshot).is_ok());
        // 2 x 5 = 10 > 8
        assert!(validate_request(&request("pve1", 2, 5, 512), &usage, &snapshot).is_err());
    }

    #[test]
    fn zero_cap_means_unconstrained() {
        let snapshot = SettingsSnapshot::default();
        let usage = usage_with("pve1", 10_000, 10_000_000);
        assert!(validate_request(&request("pve1", 4, 16, 65536), &usage, &snapshot).is_ok());
    }

    #[test]
    fn memory_cap_is_compared_in_mb() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.node_limits.insert(
            "pve1".to_string(),
            NodeLimit {
                max_cores: 0,
                max_memory_gb: 4,
            },
        );
        // 3.5 GB used; a 600 MB request totals 4184 MB, over the 4096 MB cap
        // even though whole-GB arithmetic would truncate both sides to 4 GB.
        let usage = usage_with("pve1", 0, 3584);
        let err = validate_request(&request("pve1", 1, 1, 600), &usage, &snapshot).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::NodeCapExceeded {
                resource: "memory_mb",
                ..
            }
        ));
    }

    #[test]
    fn oversized_core_request_rejects_instead_of_overflowing() {
        let snapshot = snapshot_with_node_cap("pve1", 8);
        let usage = usage_with("pve1", 6, 0);
        let err = validate_request(&request("pve1", u64::MAX, 2, 512), &usage, &snapshot)
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::NodeCapExceeded { resource: "cores", .. }
        ));
    }

    #[test]
    fn oversized_memory_request_rejects_instead_of_overflowing() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.node_limits.insert(
            "pve1".to_string(),
            NodeLimit {
                max_cores: 0,
                max_memory_gb: 4,
            },
        );
        let usage = usage_with("pve1", 0, 3584);
        let err = validate_request(&request("pve1", 1, 1, u64::MAX), &usage, &snapshot)
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::NodeCapExceeded {
                resource: "memory_mb",
                ..
            }
        ));
    }

    #[test]
    fn per_vm_bounds_reject_with_field_and_range() {
        let snapshot = SettingsSnapshot {
            vm_limits: VmLimits {
                cores: Some(ResourceRange { min: 1, max: 8 }),
                ..Default::default()
            },
            ..Default::default()
        };
        let err =
            validate_request(&request("pve1", 1, 12, 512), &HashMap::new(), &snapshot).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cores = 12 is outside the allowed range [1, 8]"
        );
    }

    #[test]
    fn unconfigured_bounds_pass_unchecked() {
        let snapshot = SettingsSnapshot::default();
        assert!(
            validate_request(&request("pve1", 64, 128, 1 << 20), &HashMap::new(), &snapshot)
                .is_ok()
        );
    }

    #[test]
    fn storage_allowlist_is_enforced_when_configured() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.enabled_storages.insert("ceph".to_string());
        let err =
            validate_request(&request("pve1", 1, 1, 512), &HashMap::new(), &snapshot).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::NotAllowed { field: "storage", .. }
        ));
    }

    #[test]
    fn degraded_usage_map_only_enforces_vm_bounds() {
        // Node has a cap, but aggregation returned nothing for it: the
        // request passes on per-VM bounds alone.
        let snapshot = snapshot_with_node_cap("pve1", 8);
        let usage = HashMap::new();
        assert!(validate_request(&request("pve1", 1, 2, 512), &usage, &snapshot).is_ok());
    }
}
