pub mod client;
pub mod types;

pub use client::{ApiMethod, ApiTransport, ProxmoxClient};
