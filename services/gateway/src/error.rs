use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use types::errors::KeyError;

/// Central error type for the Gateway application
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid chain key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("No listed option chain for {0}")]
    UnknownChain(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code) = match self {
            AppError::InvalidKey(e) => (StatusCode::BAD_REQUEST, e.to_string(), "INVALID_KEY"),
            AppError::UnknownChain(key) => (
                StatusCode::NOT_FOUND,
                format!("No listed option chain for {}", key),
                "UNKNOWN_CHAIN",
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
        };

        let body = Json(json!({
            "error": code,
            "message": error_message
        }));

        (status, body).into_response()
    }
}
