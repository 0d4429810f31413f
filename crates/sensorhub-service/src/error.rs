//! HTTP error mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::dispatch::DispatchError;

/// Application error type.
///
/// Every variant renders as `{"error": "<message>"}` with its status code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    UnsupportedMediaType(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(sensorhub_store::Error),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Status code for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sensorhub_store::Error> for AppError {
    fn from(e: sensorhub_store::Error) -> Self {
        match e {
            sensorhub_store::Error::Conflict { table, field } => {
                AppError::Conflict(format!("A row in '{table}' already has this '{field}'"))
            }
            sensorhub_store::Error::NotFound { entity, key } => {
                AppError::NotFound(format!("{entity} not found: {key}"))
            }
            other => AppError::Store(other),
        }
    }
}

impl From<sensorhub_types::DocumentError> for AppError {
    fn from(e: sensorhub_types::DocumentError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
