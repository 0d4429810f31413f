//! Request body extraction with schema validation.

use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
    http::{HeaderMap, header},
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use sensorhub_types::{Schema, validate_document};

use crate::error::AppError;

/// A JSON request body that passed `T`'s schema.
///
/// Rejects with 415 unless the content type is JSON, and with 400 when the
/// body is not JSON or fails the schema. The 400 message is the validator's.
#[derive(Debug, Clone)]
pub struct JsonDocument<T>(pub T);

impl<S, T> FromRequest<S> for JsonDocument<T>
where
    S: Send + Sync,
    T: Schema + DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if !has_json_content_type(req.headers()) {
            return Err(AppError::UnsupportedMediaType(
                "Expected a request body with `Content-Type: application/json`".to_string(),
            ));
        }

        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::BadRequest(format!("Malformed JSON body: {e}")))?;

        Ok(Self(validate_document(&value)?))
    }
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || (essence.starts_with("application/") && essence.ends_with("+json"))
}
