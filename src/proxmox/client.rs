use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::settings::ProxmoxSettings;
use crate::errors::{GatewayError, TransportError};

/// HTTP verbs the gateway actually uses against the Proxmox API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl From<ApiMethod> for reqwest::Method {
    fn from(m: ApiMethod) -> Self {
        match m {
            ApiMethod::Get => reqwest::Method::GET,
            ApiMethod::Post => reqwest::Method::POST,
            ApiMethod::Put => reqwest::Method::PUT,
            ApiMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// The raw I/O leaf. One call, one bounded network round trip, no caching.
///
/// A trait rather than a concrete type so tests can drop in an in-memory
/// transport; the cache layer only ever sees this seam.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Issue one authenticated call. `body` is form-encoded for mutations,
    /// `None` for reads. The returned value is the unwrapped `data` payload
    /// of the Proxmox response envelope.
    async fn call(
        &self,
        method: ApiMethod,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError>;
}

/// Authenticated reqwest client for one Proxmox cluster.
///
/// Immutable after construction. Credential rotation replaces the whole
/// handle through the state manager rather than mutating this one.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
    default_timeout: Duration,
}

impl ProxmoxClient {
    pub fn new(cfg: &ProxmoxSettings) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()
            .map_err(|e| TransportError::Connect {
                path: cfg.api_url.clone(),
                message: e.to_string(),
            })?;

        // PVEAPIToken auth: no ticket dance, one static header per call.
        let auth_header = format!("PVEAPIToken={}={}", cfg.token_id, cfg.token_secret);

        Ok(Self {
            http,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            auth_header,
            default_timeout: Duration::from_secs(cfg.timeout_secs),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn classify(path: &str, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                path: path.to_string(),
            }
        } else if err.is_decode() {
            TransportError::Decode {
                path: path.to_string(),
                message: err.to_string(),
            }
        } else {
            TransportError::Connect {
                path: path.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl ApiTransport for ProxmoxClient {
    async fn call(
        &self,
        method: ApiMethod,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = ?method, path = path, "hypervisor API call");

        let mut request = self
            .http
            .request(method.into(), &url)
            .header(AUTHORIZATION, &self.auth_header)
            .timeout(timeout);
        if let Some(form) = body {
            request = request.form(form);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::classify(path, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(path = path, code = status.as_u16(), "hypervisor API error status");
            return Err(TransportError::Status {
                code: status.as_u16(),
                path: path.to_string(),
                body,
            });
        }

        let mut envelope: Value = response
            .json()
            .await
            .map_err(|e| Self::classify(path, e))?;

        // Everything useful sits under "data"; a missing key means an
        // endpoint we do not understand.
        match envelope.get_mut("data") {
            Some(data) => Ok(data.take()),
            None => Err(TransportError::Decode {
                path: path.to_string(),
                message: "response envelope has no 'data' field".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::ProxmoxSettings;

    fn settings() -> ProxmoxSettings {
        ProxmoxSettings {
            api_url: "https://pve.example:8006/api2/json/".to_string(),
            token_id: "portal@pve!gateway".to_string(),
            token_secret: "secret".to_string(),
            verify_tls: true,
            timeout_secs: 10,
        }
    }

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let client = ProxmoxClient::new(&settings()).unwrap();
        assert_eq!(client.base_url, "https://pve.example:8006/api2/json");
    }

    #[test]
    fn builds_pve_token_header() {
        let client = ProxmoxClient::new(&settings()).unwrap();
        assert_eq!(client.auth_header, "PVEAPIToken=portal@pve!gateway=secret");
    }
}
