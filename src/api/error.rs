use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::GatewayError;

/// HTTP mapping of gateway failures. Admission rejections carry their
/// specific message; infrastructure failures never leak internal error text.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            GatewayError::Validation(e) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            GatewayError::Transport(e) => {
                error!(error = %e, "hypervisor call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "hypervisor service unavailable".to_string(),
                )
            }
            GatewayError::Config(e) => {
                error!(error = %e, "configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal configuration error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
