//! Platform-agnostic types for the sensor hub.
//!
//! This crate contains the inbound documents accepted by the REST API, the
//! JSON schemas they are validated against, and the one-way digest used to
//! store and compare API keys. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use sensorhub_types::{SensorDocument, validate_document};
//!
//! let body = serde_json::json!({"name": "hall-1", "model": "bme280"});
//! let doc: SensorDocument = validate_document(&body)?;
//! assert_eq!(doc.name, "hall-1");
//! # Ok::<(), sensorhub_types::DocumentError>(())
//! ```

pub mod documents;
pub mod error;
pub mod key;
pub mod schema;
pub mod timestamp;

pub use documents::{LocationDocument, MeasurementDocument, SensorDocument, StatsDocument};
pub use error::{DocumentError, DocumentResult};
pub use key::{KeyDigest, generate_key};
pub use schema::{Schema, validate_document};
pub use timestamp::Timestamp;
