use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use pvmss_gateway::api::{create_router, AppState};
use pvmss_gateway::cache::ApiCache;
use pvmss_gateway::config::Settings;
use pvmss_gateway::provision::Provisioner;
use pvmss_gateway::proxmox::{ApiTransport, ProxmoxClient};
use pvmss_gateway::state::StateManager;

#[derive(Parser, Debug)]
#[command(name = "pvmss-gateway", about = "Self-service VM portal resource gateway")]
struct Args {
    /// Directory holding default.toml / local.toml
    #[arg(long, default_value = "config")]
    config: String,

    /// Liveness probe interval in seconds
    #[arg(long, default_value_t = 30)]
    probe_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    info!("Starting pvmss-gateway");

    let settings = Settings::new(&args.config)?;

    // Initialize core components
    let client = ProxmoxClient::new(&settings.proxmox)?;
    let timeout = client.default_timeout();
    let transport: Arc<dyn ApiTransport> = Arc::new(client);
    let cache = Arc::new(ApiCache::new(transport, timeout));

    let state = Arc::new(StateManager::new(cache, settings.snapshot()));
    state.probe().await;
    let _probe_task = Arc::clone(&state).spawn_probe_task(Duration::from_secs(args.probe_interval));

    let provisioner = Arc::new(Provisioner::new(Arc::clone(&state)));

    let app = create_router(AppState {
        state,
        provisioner,
    });

    // Start the server
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
