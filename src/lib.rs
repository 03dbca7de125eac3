pub mod admission;
pub mod api;
pub mod cache;
pub mod config;
pub mod errors;
pub mod provision;
pub mod proxmox;
pub mod state;
pub mod usage;

// Re-exports
pub use api::routes::{create_router, AppState};
pub use cache::ApiCache;
pub use config::{Settings, SettingsSnapshot};
pub use errors::{GatewayError, GatewayResult};
pub use provision::{Provisioner, ProvisionRequest};
pub use proxmox::{ApiTransport, ProxmoxClient};
pub use state::StateManager;
pub use usage::NodeUsage;
