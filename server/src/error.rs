//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::config::ConfigError;
use crate::websocket::ErrorPayload;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Engine error: {0}")]
    Engine(#[from] weft_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Engine(e) => {
                StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_REQUEST)
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Config(_) | AppError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AppError::Engine(e) => e.name(),
            AppError::BadRequest(_) => "BadRequestError",
            AppError::Unauthorized => "UnauthorizedError",
            AppError::Config(_) | AppError::Io(_) => "InternalError",
        }
    }
}

/// Errors leave as the same `{name, message, status}` body used on the
/// WebSocket. Internal details are logged, not returned.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!("Internal error: {}", self);
            "Internal server error".to_string()
        } else {
            tracing::warn!("Request failed: {}", self);
            self.to_string()
        };

        let body = Json(ErrorPayload {
            name: self.name().to_string(),
            message,
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}
