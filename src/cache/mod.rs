//! Path-keyed read-through cache over the Proxmox transport.
//!
//! Entries never expire by time. An entry is valid until a mutation
//! explicitly invalidates its key (or a prefix covering it); the mutation
//! flows in [`crate::provision`] own that contract. Sharded locking comes
//! from DashMap, so invalidating `/nodes/a/...` never blocks a read of
//! `/nodes/b/...`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use crate::errors::{GatewayError, TransportError, ValidationError};
use crate::proxmox::{ApiMethod, ApiTransport};

/// One cached response payload. `fetched_at` is diagnostic only; validity is
/// purely "not yet invalidated".
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub payload: Value,
    pub fetched_at: Instant,
}

pub struct ApiCache {
    transport: Arc<dyn ApiTransport>,
    entries: DashMap<String, CachedEntry>,
    default_timeout: Duration,
}

impl ApiCache {
    pub fn new(transport: Arc<dyn ApiTransport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            entries: DashMap::new(),
            default_timeout,
        }
    }

    /// Read through the cache. A hit never touches the network; a miss
    /// fetches, stores under the normalized key, and returns the payload.
    ///
    /// Two concurrent misses on the same key may both fetch; the later
    /// insert wins. That is accepted — both fetched the same live data and
    /// the map itself stays consistent.
    pub async fn get(&self, path: &str) -> Result<Value, TransportError> {
        let key = normalize_key(path);

        if let Some(entry) = self.entries.get(&key) {
            trace!(key = %key, "cache hit");
            return Ok(entry.payload.clone());
        }

        debug!(key = %key, "cache miss, fetching");
        let payload = self
            .transport
            .call(ApiMethod::Get, &key, None, self.default_timeout)
            .await?;
        self.entries.insert(
            key,
            CachedEntry {
                payload: payload.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(payload)
    }

    /// Cached read decoded into a typed payload. A payload that does not
    /// match the expected shape is a validation failure at the boundary,
    /// not something to pass deeper as an untyped map.
    pub async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let payload = self.get(path).await?;
        serde_json::from_value(payload).map_err(|e| {
            GatewayError::Validation(ValidationError::MalformedPayload {
                path: path.to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Read bypassing the cache entirely. Used for liveness probes and the
    /// shutdown status poll, where yesterday's answer is worthless.
    pub async fn get_uncached(&self, path: &str) -> Result<Value, TransportError> {
        self.transport
            .call(ApiMethod::Get, &normalize_key(path), None, self.default_timeout)
            .await
    }

    pub async fn get_uncached_as<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, GatewayError> {
        let payload = self.get_uncached(path).await?;
        serde_json::from_value(payload).map_err(|e| {
            GatewayError::Validation(ValidationError::MalformedPayload {
                path: path.to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Pass-through for mutating calls. Never cached; the caller is
    /// responsible for invalidating every key the mutation may have changed.
    pub async fn call_mut(
        &self,
        method: ApiMethod,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        self.transport
            .call(method, &normalize_key(path), body, self.default_timeout)
            .await
    }

    /// Discard the entry for exactly this key, if present.
    pub fn invalidate(&self, key: &str) {
        let key = normalize_key(key);
        if self.entries.remove(&key).is_some() {
            debug!(key = %key, "cache invalidated");
        }
    }

    /// Discard every entry whose key starts with `prefix`. Used after
    /// mutations whose blast radius covers a whole collection, e.g.
    /// `/nodes/{node}/qemu` after creating or deleting a VM on that node.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let prefix = normalize_key(prefix);
        // Counted inside the sweep: the live map length moves under
        // concurrent inserts and cannot be diffed before/after.
        let mut dropped = 0usize;
        self.entries.retain(|key, _| {
            if key.starts_with(&prefix) {
                dropped += 1;
                false
            } else {
                true
            }
        });
        if dropped > 0 {
            debug!(prefix = %prefix, dropped = dropped, "cache prefix invalidated");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keys are the API path with a leading slash and no trailing slash; query
/// strings stay part of the key.
fn normalize_key(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes() {
        assert_eq!(normalize_key("/nodes/pve1/"), "/nodes/pve1");
        assert_eq!(normalize_key("nodes/pve1"), "/nodes/pve1");
        assert_eq!(normalize_key("/nodes/pve1"), "/nodes/pve1");
    }

    #[test]
    fn keeps_query_string_in_key() {
        assert_eq!(
            normalize_key("/cluster/resources?type=vm"),
            "/cluster/resources?type=vm"
        );
    }
}
