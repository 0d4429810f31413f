//! Data models for stored rows.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use sensorhub_types::Timestamp;

/// A sensor stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSensor {
    /// Database row ID.
    pub id: i64,
    /// Unique sensor name.
    pub name: String,
    /// Sensor model.
    pub model: String,
    /// Location hosting this sensor, if any.
    pub location_id: Option<i64>,
}

/// A location stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLocation {
    pub id: i64,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub description: Option<String>,
    /// Name of the sensor placed here (back reference).
    pub sensor: Option<String>,
}

/// Fields of a location to insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewLocation {
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub description: Option<String>,
}

/// A deployment campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDeployment {
    pub id: i64,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
}

/// A measurement stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMeasurement {
    /// Database row ID.
    pub id: i64,
    /// Owning sensor; `None` once the sensor has been deleted.
    pub sensor_id: Option<i64>,
    /// Measured value.
    pub value: f64,
    /// When the value was measured.
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

/// Statistics computed for a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredStats {
    pub sensor_id: i64,
    /// When the statistics were generated, as reported.
    pub generated: Timestamp,
    pub mean: f64,
}
