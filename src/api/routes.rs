//! Thin JSON surface over the gateway core. Rendering, sessions and the
//! rest of the portal chrome live elsewhere; these handlers only translate
//! HTTP to core calls and back.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::api::error::ApiError;
use crate::provision::{Provisioner, ProvisionRequest};
use crate::state::StateManager;
use crate::usage::NodeUsage;

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<StateManager>,
    pub provisioner: Arc<Provisioner>,
}

pub fn create_router(app: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/usage", get(usage))
        .route("/api/v1/vms", post(create_vm))
        .route("/api/v1/vms/{node}/{vmid}", delete(delete_vm))
        .route("/api/v1/vms/{node}/{vmid}/start", post(start_vm))
        .route("/api/v1/vms/{node}/{vmid}/stop", post(stop_vm))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app)
}

#[derive(Serialize)]
struct HealthResponse {
    connected: bool,
    message: String,
}

/// Reports the last probe outcome; never issues a live hypervisor call.
async fn health(State(app): State<AppState>) -> Json<HealthResponse> {
    let (connected, message) = app.state.connection_status();
    Json(HealthResponse { connected, message })
}

async fn usage(State(app): State<AppState>) -> Json<HashMap<String, NodeUsage>> {
    Json(app.provisioner.current_usage().await)
}

async fn create_vm(
    State(app): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let vmid = app.provisioner.create_vm(&request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "vmid": vmid }))))
}

async fn delete_vm(
    State(app): State<AppState>,
    Path((node, vmid)): Path<(String, u64)>,
) -> Result<StatusCode, ApiError> {
    app.provisioner.delete_vm(&node, vmid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_vm(
    State(app): State<AppState>,
    Path((node, vmid)): Path<(String, u64)>,
) -> Result<StatusCode, ApiError> {
    app.provisioner.start_vm(&node, vmid).await?;
    Ok(StatusCode::OK)
}

async fn stop_vm(
    State(app): State<AppState>,
    Path((node, vmid)): Path<(String, u64)>,
) -> Result<StatusCode, ApiError> {
    app.provisioner.stop_vm(&node, vmid).await?;
    Ok(StatusCode::OK)
}
