//! Error types shared by the storage core and the HTTP layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrafficError {
    /// Malformed identifiers; rejected before any mutation
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The unit of work was rolled back
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("{0}")]
    Unauthorized(String),

    /// The write queue has shut down
    #[error("{0}")]
    Unavailable(String),

    /// Rendering or signing failed after the data was read
    #[error("{0}")]
    Internal(String),
}

pub type TrafficResult<T> = std::result::Result<T, TrafficError>;

impl TrafficError {
    pub fn status(&self) -> StatusCode {
        match self {
            TrafficError::Validation(_) => StatusCode::BAD_REQUEST,
            TrafficError::NotFound(_) => StatusCode::NOT_FOUND,
            TrafficError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TrafficError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            TrafficError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TrafficError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TrafficError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}
