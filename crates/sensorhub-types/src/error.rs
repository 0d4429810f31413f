//! Error types for document validation.

use thiserror::Error;

/// Errors raised while turning a JSON body into a typed document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DocumentError {
    /// The body does not satisfy the document's JSON schema.
    #[error("{0}")]
    Schema(String),

    /// The body passed the schema but a field could not be decoded.
    #[error("Invalid document: {0}")]
    Invalid(String),
}

/// Result type alias for document validation.
pub type DocumentResult<T> = std::result::Result<T, DocumentError>;
