//! VM lifecycle mutations and their cache invalidation contract.
//!
//! Every state-changing call against the cluster goes through this module,
//! and every mutation names the cache keys it may have dirtied. The cache
//! has no TTL, so this table is load-bearing:
//!
//! | mutation                               | invalidated keys                                            |
//! |----------------------------------------|-------------------------------------------------------------|
//! | `POST /nodes/{n}/qemu` (create)        | prefix `/nodes/{n}/qemu`, prefix `/cluster/resources`, `/cluster/nextid` |
//! | `DELETE /nodes/{n}/qemu/{id}`          | prefix `/nodes/{n}/qemu`, prefix `/cluster/resources`, `/cluster/nextid` |
//! | `POST .../status/{start,stop,shutdown}`| prefix `/nodes/{n}/qemu/{id}`, prefix `/cluster/resources`  |
//!
//! Adding a mutation without extending this table (and the tests that walk
//! it) will serve stale data indefinitely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::admission::validate_request;
use crate::cache::ApiCache;
use crate::errors::{GatewayResult, ValidationError};
use crate::proxmox::types::{de_u64_flexible, VmStatusInfo};
use crate::proxmox::ApiMethod;
use crate::state::StateManager;
use crate::usage::{compute_node_usage, NodeUsage};

/// A proposed VM, as the form-handling layer submits it. Treated as an
/// immutable value object: validated, then translated into API parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub node: String,
    pub name: String,
    #[serde(default)]
    pub vmid: Option<u64>,
    #[serde(default = "default_one")]
    pub sockets: u64,
    pub cores: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub storage: String,
    pub bridge: String,
    #[serde(default)]
    pub iso: Option<String>,
}

fn default_one() -> u64 {
    1
}

/// Progress of one graceful-shutdown sequence. Transitions are pure so
/// tests drive them without sleeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Requested,
    Polling { attempt: u32, max: u32 },
    Confirmed,
    TimedOut,
}

/// Bounded retry machine: `Requested → Polling(1..max) → Confirmed` when
/// the VM reports stopped, or `TimedOut` once the attempt budget is spent.
#[derive(Debug)]
pub struct ShutdownPoll {
    attempt: u32,
    max_attempts: u32,
}

impl ShutdownPoll {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
        }
    }

    pub fn state(&self) -> ShutdownState {
        match self.attempt {
            0 => ShutdownState::Requested,
            n if n >= self.max_attempts => ShutdownState::TimedOut,
            n => ShutdownState::Polling {
                attempt: n,
                max: self.max_attempts,
            },
        }
    }

    /// Feed one observation of the VM's run state.
    pub fn advance(&mut self, still_running: bool) -> ShutdownState {
        if !still_running {
            return ShutdownState::Confirmed;
        }
        self.attempt += 1;
        self.state()
    }
}

/// Drives validated mutations against the cluster. Transport failures on
/// the mutating call itself are fatal to that operation and surface
/// verbatim; only the advisory reads around it degrade.
pub struct Provisioner {
    state: Arc<StateManager>,
    shutdown_max_attempts: u32,
    shutdown_backoff: Duration,
}

impl Provisioner {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self {
            state,
            shutdown_max_attempts: 15,
            shutdown_backoff: Duration::from_secs(2),
        }
    }

    /// Override the shutdown poll budget, mainly so tests run with a zero
    /// backoff instead of real sleeps.
    pub fn with_shutdown_policy(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.shutdown_max_attempts = max_attempts;
        self.shutdown_backoff = backoff;
        self
    }

    /// Best-effort usage snapshot for admission. Aggregation failures are
    /// logged and degrade to "no usage data" so provisioning stays available.
    pub async fn current_usage(&self) -> HashMap<String, NodeUsage> {
        let cache = self.state.client();
        let snapshot = self.state.settings();
        match compute_node_usage(&cache, &snapshot).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "usage aggregation degraded, proceeding without usage data");
                HashMap::new()
            }
        }
    }

    /// Admit and create a VM. Returns the vmid actually used.
    pub async fn create_vm(&self, request: &ProvisionRequest) -> GatewayResult<u64> {
        let cache = self.state.client();
        let snapshot = self.state.settings();

        validate_name(request)?;
        let usage = self.current_usage().await;
        validate_request(request, &usage, &snapshot)?;

        let vmid = match request.vmid {
            Some(vmid) => vmid,
            None => self.next_vmid().await?,
        };

        // Portal-managed VMs always carry the management tag, whatever else
        // the user asked for.
        let management_tag = snapshot.management_tag();
        let mut tags: Vec<String> = vec![management_tag.clone()];
        for tag in &request.tags {
            let tag = tag.trim();
            if !tag.is_empty() && !tag.eq_ignore_ascii_case(&management_tag) {
                tags.push(tag.to_string());
            }
        }

        let mut params = json!({
            "vmid": vmid,
            "name": request.name,
            "sockets": request.sockets,
            "cores": request.cores,
            "memory": request.memory_mb,
            "scsi0": format!("{}:{}", request.storage, request.disk_gb),
            "net0": format!("virtio,bridge={}", request.bridge),
            "tags": tags.join(";"),
        });
        if let Some(iso) = &request.iso {
            params["ide2"] = json!(format!("{iso},media=cdrom"));
            params["boot"] = json!("order=scsi0;ide2");
        }

        let path = format!("/nodes/{}/qemu", request.node);
        cache.call_mut(ApiMethod::Post, &path, Some(&params)).await?;
        info!(vmid = vmid, node = %request.node, name = %request.name, "VM created");

        invalidate_vm_lifecycle(&cache, &request.node);
        Ok(vmid)
    }

    /// Next free vmid from the cluster. Never cached: the answer changes
    /// with every creation.
    pub async fn next_vmid(&self) -> GatewayResult<u64> {
        #[derive(Deserialize)]
        struct NextId(#[serde(deserialize_with = "de_u64_flexible")] u64);

        let cache = self.state.client();
        let NextId(vmid) = cache.get_uncached_as("/cluster/nextid").await?;
        Ok(vmid)
    }

    pub async fn start_vm(&self, node: &str, vmid: u64) -> GatewayResult<()> {
        let cache = self.state.client();
        let path = format!("/nodes/{node}/qemu/{vmid}/status/start");
        cache.call_mut(ApiMethod::Post, &path, None).await?;
        info!(vmid = vmid, node = node, "VM start requested");
        invalidate_vm_status(&cache, node, vmid);
        Ok(())
    }

    pub async fn stop_vm(&self, node: &str, vmid: u64) -> GatewayResult<()> {
        let cache = self.state.client();
        let path = format!("/nodes/{node}/qemu/{vmid}/status/stop");
        cache.call_mut(ApiMethod::Post, &path, None).await?;
        info!(vmid = vmid, node = node, "VM stop requested");
        invalidate_vm_status(&cache, node, vmid);
        Ok(())
    }

    /// Gracefully shut down (bounded poll), hard-stop on timeout, then
    /// delete the VM.
    pub async fn delete_vm(&self, node: &str, vmid: u64) -> GatewayResult<()> {
        let cache = self.state.client();

        if self.fetch_running(&cache, node, vmid).await? {
            let shutdown_path = format!("/nodes/{node}/qemu/{vmid}/status/shutdown");
            cache.call_mut(ApiMethod::Post, &shutdown_path, None).await?;
            invalidate_vm_status(&cache, node, vmid);

            if self.poll_until_stopped(&cache, node, vmid).await? {
                info!(vmid = vmid, node = node, "graceful shutdown confirmed");
            } else {
                warn!(vmid = vmid, node = node, "graceful shutdown timed out, forcing stop");
                let stop_path = format!("/nodes/{node}/qemu/{vmid}/status/stop");
                cache.call_mut(ApiMethod::Post, &stop_path, None).await?;
                invalidate_vm_status(&cache, node, vmid);
            }
        }

        let path = format!("/nodes/{node}/qemu/{vmid}");
        cache.call_mut(ApiMethod::Delete, &path, None).await?;
        info!(vmid = vmid, node = node, "VM deleted");

        invalidate_vm_lifecycle(&cache, node);
        Ok(())
    }

    async fn fetch_running(&self, cache: &ApiCache, node: &str, vmid: u64) -> GatewayResult<bool> {
        // Status must bypass the cache: a cached "running" would never change.
        let status: VmStatusInfo = cache
            .get_uncached_as(&format!("/nodes/{node}/qemu/{vmid}/status/current"))
            .await?;
        Ok(status.is_running())
    }

    /// True when the VM reported stopped within the attempt budget.
    async fn poll_until_stopped(
        &self,
        cache: &ApiCache,
        node: &str,
        vmid: u64,
    ) -> GatewayResult<bool> {
        let mut poll = ShutdownPoll::new(self.shutdown_max_attempts);
        loop {
            tokio::time::sleep(self.shutdown_backoff).await;
            let running = self.fetch_running(cache, node, vmid).await?;
            match poll.advance(running) {
                ShutdownState::Confirmed => return Ok(true),
                ShutdownState::TimedOut => return Ok(false),
                ShutdownState::Requested | ShutdownState::Polling { .. } => continue,
            }
        }
    }
}

/// Blast radius of creating or deleting a VM on `node`: the node's whole
/// qemu collection, the cluster resource listing (any query variant), and
/// the next-free-vmid answer.
fn invalidate_vm_lifecycle(cache: &ApiCache, node: &str) {
    cache.invalidate_prefix(&format!("/nodes/{node}/qemu"));
    cache.invalidate_prefix("/cluster/resources");
    cache.invalidate("/cluster/nextid");
}

/// Blast radius of a start/stop/shutdown: everything under the single VM
/// plus the cluster resource listing, which carries run state.
fn invalidate_vm_status(cache: &ApiCache, node: &str, vmid: u64) {
    cache.invalidate_prefix(&format!("/nodes/{node}/qemu/{vmid}"));
    cache.invalidate_prefix("/cluster/resources");
}

/// Require a non-empty VM name before anything reaches the cluster.
pub fn validate_name(request: &ProvisionRequest) -> Result<(), ValidationError> {
    if request.name.trim().is_empty() {
        return Err(ValidationError::MissingField { field: "name" });
    }
    Ok(())
}
