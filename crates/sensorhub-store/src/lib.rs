//! Persistence for the sensor hub.
//!
//! This crate provides SQLite-based storage for sensors, their locations and
//! deployments, time-series measurements, computed statistics and hashed API
//! keys.
//!
//! All access goes through a [`UnitOfWork`]: one SQLite transaction that is
//! committed exactly once, or rolled back when dropped.
//!
//! # Example
//!
//! ```
//! use sensorhub_store::{MeasurementQuery, Store};
//!
//! let mut store = Store::open_in_memory()?;
//! let uow = store.begin()?;
//! let sensor = uow.insert_sensor("hall-1", "bme280")?;
//! let first_page = uow.query_measurements(&MeasurementQuery::page(sensor.id, 0, 50))?;
//! assert!(first_page.is_empty());
//! uow.commit()?;
//! # Ok::<(), sensorhub_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{
    NewLocation, StoredDeployment, StoredLocation, StoredMeasurement, StoredSensor,
    StoredStats,
};
pub use queries::MeasurementQuery;
pub use store::{Store, UnitOfWork};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/sensorhub/sensorhub.db`
/// - macOS: `~/Library/Application Support/sensorhub/sensorhub.db`
/// - Windows: `C:\Users\<user>\AppData\Local\sensorhub\sensorhub.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("sensorhub")
        .join("sensorhub.db")
}
