use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ebb_protocol::ControlError;
use serde_json::json;

/// Thin local wrapper so we can implement `IntoResponse` for the shared
/// `ControlError` type without violating the orphan rule (spec.md §7:
/// `{ "error": "<message>" }` on REST, `{ "type": "error", "error": "..." }`
/// on the websocket — this covers the REST half).
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::Validation { .. } => StatusCode::BAD_REQUEST,
            ControlError::StateConflict { .. } => StatusCode::BAD_REQUEST,
            ControlError::NotConnected => StatusCode::BAD_REQUEST,
            ControlError::ResourceExhausted { .. } => StatusCode::BAD_REQUEST,
            ControlError::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::WriteFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::DeviceError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::IdentityMismatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
