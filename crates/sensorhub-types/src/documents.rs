//! Inbound documents accepted by the REST API.
//!
//! Each document is the typed form of a request body after it has passed the
//! JSON schema returned by its [`Schema`](crate::Schema) implementation.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::schema::Schema;
use crate::timestamp::Timestamp;

/// Maximum length of a location description.
pub const MAX_DESCRIPTION_LEN: u64 = 256;

/// Pattern a measurement timestamp must match (UTC, second precision).
pub const MEASUREMENT_TIME_PATTERN: &str =
    "^[0-9]{4}-[01][0-9]-[0-3][0-9]T[0-9]{2}:[0-5][0-9]:[0-5][0-9]Z$";

/// Create or replace a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDocument {
    /// Unique sensor name.
    pub name: String,
    /// Sensor model.
    pub model: String,
}

impl Schema for SensorDocument {
    fn json_schema() -> Value {
        json!({
            "type": "object",
            "required": ["name", "model"],
            "properties": {
                "name": {
                    "description": "Sensor's unique name",
                    "type": "string"
                },
                "model": {
                    "description": "Name of the sensor's model",
                    "type": "string"
                }
            }
        })
    }
}

/// Create a location, optionally binding it to a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationDocument {
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    /// Name of the sensor placed at this location.
    #[serde(default)]
    pub sensor: Option<String>,
}

impl Schema for LocationDocument {
    fn json_schema() -> Value {
        json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {
                    "description": "Location's unique name",
                    "type": "string"
                },
                "latitude": {"type": ["number", "null"]},
                "longitude": {"type": ["number", "null"]},
                "altitude": {"type": ["number", "null"]},
                "description": {
                    "type": ["string", "null"],
                    "maxLength": MAX_DESCRIPTION_LEN
                },
                "sensor": {
                    "description": "Name of the sensor at this location",
                    "type": ["string", "null"]
                }
            }
        })
    }
}

/// Record a single measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementDocument {
    /// Measured value.
    pub value: f64,
    /// Measurement timestamp; the server clock is used when absent.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub time: Option<OffsetDateTime>,
}

impl Schema for MeasurementDocument {
    fn json_schema() -> Value {
        json!({
            "type": "object",
            "required": ["value"],
            "properties": {
                "value": {
                    "description": "Measured value.",
                    "type": "number"
                },
                "time": {
                    "description": "Measurement timestamp",
                    "type": "string",
                    "pattern": MEASUREMENT_TIME_PATTERN
                }
            }
        })
    }
}

/// Computed statistics written back by the stats worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsDocument {
    /// When the statistics were generated, kept as reported.
    pub generated: Timestamp,
    /// Mean of the sensor's measurement values.
    pub mean: f64,
}

impl Schema for StatsDocument {
    fn json_schema() -> Value {
        json!({
            "type": "object",
            "required": ["generated", "mean"],
            "properties": {
                "generated": {
                    "description": "Generation timestamp",
                    "type": "string",
                    "format": "date-time"
                },
                "mean": {
                    "description": "Mean value of data",
                    "type": "number"
                }
            }
        })
    }
}
