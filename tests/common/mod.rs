#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use pvmss_gateway::cache::ApiCache;
use pvmss_gateway::config::SettingsSnapshot;
use pvmss_gateway::errors::TransportError;
use pvmss_gateway::provision::Provisioner;
use pvmss_gateway::proxmox::{ApiMethod, ApiTransport};
use pvmss_gateway::state::StateManager;

#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: ApiMethod,
    pub path: String,
    pub body: Option<Value>,
}

/// In-memory transport. Responses are keyed by normalized path; a path may
/// queue several payloads (the last one repeats), and paths marked failed
/// return a connection error.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Vec<Value>>>,
    failures: Mutex<HashSet<String>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, path: &str, payload: Value) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), vec![payload]);
    }

    /// Queue payloads served in order; the final one keeps repeating.
    pub fn respond_seq(&self, path: &str, payloads: Vec<Value>) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), payloads);
    }

    pub fn fail(&self, path: &str) {
        self.failures.lock().unwrap().insert(path.to_string());
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path == path)
            .count()
    }

    pub fn find_call(&self, method: ApiMethod, path: &str) -> Option<MockCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.method == method && c.path == path)
            .cloned()
    }
}

#[async_trait]
impl ApiTransport for MockTransport {
    async fn call(
        &self,
        method: ApiMethod,
        path: &str,
        body: Option<&Value>,
        _timeout: Duration,
    ) -> Result<Value, TransportError> {
        self.calls.lock().unwrap().push(MockCall {
            method,
            path: path.to_string(),
            body: body.cloned(),
        });

        if self.failures.lock().unwrap().contains(path) {
            return Err(TransportError::Connect {
                path: path.to_string(),
                message: "mock connection failure".to_string(),
            });
        }

        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(path) {
            Some(queue) if queue.len() > 1 => Ok(queue.remove(0)),
            Some(queue) if queue.len() == 1 => Ok(queue[0].clone()),
            _ => Err(TransportError::Status {
                code: 404,
                path: path.to_string(),
                body: "no mock response registered".to_string(),
            }),
        }
    }
}

pub fn cache_over(transport: Arc<MockTransport>) -> Arc<ApiCache> {
    Arc::new(ApiCache::new(transport, Duration::from_secs(5)))
}

pub fn state_over(
    transport: Arc<MockTransport>,
    snapshot: SettingsSnapshot,
) -> Arc<StateManager> {
    Arc::new(StateManager::new(cache_over(transport), snapshot))
}

/// Provisioner wired to a mock transport, with a zero-backoff shutdown poll
/// so tests never sleep for real.
pub fn provisioner_over(
    transport: Arc<MockTransport>,
    snapshot: SettingsSnapshot,
    max_shutdown_attempts: u32,
) -> Provisioner {
    Provisioner::new(state_over(transport, snapshot))
        .with_shutdown_policy(max_shutdown_attempts, Duration::ZERO)
}
