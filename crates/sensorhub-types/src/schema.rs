//! JSON schema validation for inbound documents.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{DocumentError, DocumentResult};

/// A document with a JSON schema describing its wire form.
pub trait Schema {
    /// The draft-7 JSON schema for this document.
    fn json_schema() -> Value;
}

/// Validate `body` against `T`'s schema and decode it.
///
/// Schema violations are reported with the validator's messages joined by
/// `"; "`, which is what the API returns to the client.
pub fn validate_document<T>(body: &Value) -> DocumentResult<T>
where
    T: Schema + DeserializeOwned,
{
    let schema = T::json_schema();
    let validator = jsonschema::draft7::options()
        .should_validate_formats(true)
        .build(&schema)
        .map_err(|e| DocumentError::Schema(format!("invalid schema: {e}")))?;

    let messages: Vec<String> = validator.iter_errors(body).map(|e| e.to_string()).collect();
    if !messages.is_empty() {
        return Err(DocumentError::Schema(messages.join("; ")));
    }

    serde_json::from_value(body.clone()).map_err(|e| DocumentError::Invalid(e.to_string()))
}
