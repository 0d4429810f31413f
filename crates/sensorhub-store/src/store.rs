//! Main store implementation.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use time::OffsetDateTime;
use tracing::{debug, info};

use sensorhub_types::{KeyDigest, Timestamp};

use crate::error::{Error, Result};
use crate::models::{
    NewLocation, StoredDeployment, StoredLocation, StoredMeasurement, StoredSensor,
    StoredStats,
};
use crate::queries::MeasurementQuery;
use crate::schema;

/// SQLite-based store for sensor hub data.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Start a unit of work.
    ///
    /// Writes made through the returned [`UnitOfWork`] become visible only
    /// after [`UnitOfWork::commit`]; dropping it rolls them back.
    pub fn begin(&mut self) -> Result<UnitOfWork<'_>> {
        let tx = self.conn.transaction()?;
        Ok(UnitOfWork { tx })
    }
}

/// One database transaction, committed at most once.
pub struct UnitOfWork<'a> {
    tx: Transaction<'a>,
}

impl UnitOfWork<'_> {
    /// Commit every write made in this unit.
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

const SENSOR_SELECT: &str = "SELECT id, name, model, location_id FROM sensors";

const LOCATION_SELECT: &str = "SELECT l.id, l.name, l.latitude, l.longitude, l.altitude, \
     l.description, s.name FROM locations l LEFT JOIN sensors s ON s.location_id = l.id";

fn sensor_from_row(row: &Row<'_>) -> rusqlite::Result<StoredSensor> {
    Ok(StoredSensor {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        location_id: row.get(3)?,
    })
}

fn location_from_row(row: &Row<'_>) -> rusqlite::Result<StoredLocation> {
    Ok(StoredLocation {
        id: row.get(0)?,
        name: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        altitude: row.get(4)?,
        description: row.get(5)?,
        sensor: row.get(6)?,
    })
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<StoredDeployment> {
    Ok(StoredDeployment {
        id: row.get(0)?,
        name: row.get(1)?,
        starts_at: unix_time(row, 2)?,
        ends_at: unix_time(row, 3)?,
    })
}

fn unix_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let ts: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn reported_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let text: String = row.get(idx)?;
    Timestamp::parse(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn key_digest(row: &Row<'_>, idx: usize) -> rusqlite::Result<KeyDigest> {
    let bytes: Vec<u8> = row.get(idx)?;
    KeyDigest::from_slice(&bytes).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            format!("key digest has {} bytes", bytes.len()).into(),
        )
    })
}

// Sensor operations
impl UnitOfWork<'_> {
    /// List all sensors in creation order.
    pub fn list_sensors(&self) -> Result<Vec<StoredSensor>> {
        let mut stmt = self.tx.prepare(&format!("{SENSOR_SELECT} ORDER BY id"))?;
        let sensors = stmt
            .query_map([], sensor_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sensors)
    }

    /// Get a sensor by its unique name.
    pub fn get_sensor(&self, name: &str) -> Result<Option<StoredSensor>> {
        let sensor = self
            .tx
            .query_row(&format!("{SENSOR_SELECT} WHERE name = ?"), [name], sensor_from_row)
            .optional()?;
        Ok(sensor)
    }

    /// Insert a new sensor.
    ///
    /// Returns [`Error::Conflict`] if the name is taken.
    pub fn insert_sensor(&self, name: &str, model: &str) -> Result<StoredSensor> {
        self.tx
            .execute(
                "INSERT INTO sensors (name, model) VALUES (?1, ?2)",
                params![name, model],
            )
            .map_err(Error::from_write)?;

        Ok(StoredSensor {
            id: self.tx.last_insert_rowid(),
            name: name.to_string(),
            model: model.to_string(),
            location_id: None,
        })
    }

    /// Replace a sensor's name and model.
    ///
    /// Returns [`Error::Conflict`] if the new name belongs to another sensor.
    pub fn update_sensor(&self, id: i64, name: &str, model: &str) -> Result<()> {
        let changed = self
            .tx
            .execute(
                "UPDATE sensors SET name = ?2, model = ?3 WHERE id = ?1",
                params![id, name, model],
            )
            .map_err(Error::from_write)?;

        if changed == 0 {
            return Err(Error::NotFound {
                entity: "Sensor",
                key: id.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a sensor.
    ///
    /// Its measurements are kept with no owner; its stats, keys and
    /// deployment links are removed.
    pub fn delete_sensor(&self, id: i64) -> Result<()> {
        let changed = self.tx.execute("DELETE FROM sensors WHERE id = ?", [id])?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "Sensor",
                key: id.to_string(),
            });
        }
        debug!("Deleted sensor {}", id);
        Ok(())
    }
}

// Location operations
impl UnitOfWork<'_> {
    /// List all locations in creation order.
    pub fn list_locations(&self) -> Result<Vec<StoredLocation>> {
        let mut stmt = self.tx.prepare(&format!("{LOCATION_SELECT} ORDER BY l.id"))?;
        let locations = stmt
            .query_map([], location_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(locations)
    }

    /// Get a location by its unique name.
    pub fn get_location(&self, name: &str) -> Result<Option<StoredLocation>> {
        let location = self
            .tx
            .query_row(
                &format!("{LOCATION_SELECT} WHERE l.name = ?"),
                [name],
                location_from_row,
            )
            .optional()?;
        Ok(location)
    }

    /// Get a location by row ID.
    pub fn get_location_by_id(&self, id: i64) -> Result<Option<StoredLocation>> {
        let location = self
            .tx
            .query_row(
                &format!("{LOCATION_SELECT} WHERE l.id = ?"),
                [id],
                location_from_row,
            )
            .optional()?;
        Ok(location)
    }

    /// Insert a new location.
    ///
    /// Returns [`Error::Conflict`] if the name is taken.
    pub fn insert_location(&self, location: &NewLocation) -> Result<StoredLocation> {
        self.tx
            .execute(
                "INSERT INTO locations (name, latitude, longitude, altitude, description)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    location.name,
                    location.latitude,
                    location.longitude,
                    location.altitude,
                    location.description,
                ],
            )
            .map_err(Error::from_write)?;

        Ok(StoredLocation {
            id: self.tx.last_insert_rowid(),
            name: location.name.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
            altitude: location.altitude,
            description: location.description.clone(),
            sensor: None,
        })
    }

    /// Place a sensor at a location.
    ///
    /// Returns [`Error::Conflict`] if the sensor already has a location or
    /// the location already hosts a sensor.
    pub fn assign_location(&self, sensor: &StoredSensor, location_id: i64) -> Result<()> {
        if sensor.location_id.is_some() {
            return Err(Error::Conflict {
                table: "sensors".to_string(),
                field: "location_id".to_string(),
            });
        }

        self.tx
            .execute(
                "UPDATE sensors SET location_id = ?2 WHERE id = ?1",
                params![sensor.id, location_id],
            )
            .map_err(Error::from_write)?;
        Ok(())
    }

    /// Delete a location. A sensor placed there keeps existing without one.
    pub fn delete_location(&self, id: i64) -> Result<()> {
        let changed = self.tx.execute("DELETE FROM locations WHERE id = ?", [id])?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "Location",
                key: id.to_string(),
            });
        }
        Ok(())
    }
}

// Deployment operations
impl UnitOfWork<'_> {
    /// Insert a deployment campaign.
    pub fn insert_deployment(
        &self,
        name: &str,
        starts_at: OffsetDateTime,
        ends_at: OffsetDateTime,
    ) -> Result<StoredDeployment> {
        self.tx.execute(
            "INSERT INTO deployments (name, starts_at, ends_at) VALUES (?1, ?2, ?3)",
            params![name, starts_at.unix_timestamp(), ends_at.unix_timestamp()],
        )?;

        Ok(StoredDeployment {
            id: self.tx.last_insert_rowid(),
            name: name.to_string(),
            starts_at,
            ends_at,
        })
    }

    /// Link a sensor to a deployment. Linking twice is a no-op.
    pub fn attach_deployment(&self, deployment_id: i64, sensor_id: i64) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO sensor_deployments (deployment_id, sensor_id) VALUES (?1, ?2)",
            params![deployment_id, sensor_id],
        )?;
        Ok(())
    }

    /// Deployments a sensor takes part in, earliest first.
    pub fn sensor_deployments(&self, sensor_id: i64) -> Result<Vec<StoredDeployment>> {
        let mut stmt = self.tx.prepare(
            "SELECT d.id, d.name, d.starts_at, d.ends_at
             FROM deployments d
             JOIN sensor_deployments sd ON sd.deployment_id = d.id
             WHERE sd.sensor_id = ?
             ORDER BY d.starts_at, d.id",
        )?;
        let deployments = stmt
            .query_map([sensor_id], deployment_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(deployments)
    }
}

// Measurement operations
impl UnitOfWork<'_> {
    /// Record a measurement for a sensor.
    pub fn insert_measurement(&self, sensor_id: i64, value: f64, time: OffsetDateTime) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO measurements (sensor_id, value, time) VALUES (?1, ?2, ?3)",
            params![sensor_id, value, time.unix_timestamp()],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Query measurements with filters.
    pub fn query_measurements(&self, query: &MeasurementQuery) -> Result<Vec<StoredMeasurement>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.tx.prepare(&sql)?;
        let measurements = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok(StoredMeasurement {
                    id: row.get(0)?,
                    sensor_id: row.get(1)?,
                    value: row.get(2)?,
                    time: unix_time(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(measurements)
    }

    /// All values recorded by a sensor, oldest first.
    pub fn measurement_values(&self, sensor_id: i64) -> Result<Vec<f64>> {
        let mut stmt = self.tx.prepare(
            "SELECT value FROM measurements WHERE sensor_id = ? ORDER BY time, id",
        )?;
        let values = stmt
            .query_map([sensor_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<f64>, _>>()?;
        Ok(values)
    }

    /// Number of measurements a sensor owns.
    pub fn count_measurements(&self, sensor_id: i64) -> Result<u64> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM measurements WHERE sensor_id = ?",
            [sensor_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// Stats operations
impl UnitOfWork<'_> {
    /// Get the statistics computed for a sensor.
    pub fn get_stats(&self, sensor_id: i64) -> Result<Option<StoredStats>> {
        let stats = self
            .tx
            .query_row(
                "SELECT sensor_id, generated, mean FROM stats WHERE sensor_id = ?",
                [sensor_id],
                |row| {
                    Ok(StoredStats {
                        sensor_id: row.get(0)?,
                        generated: reported_time(row, 1)?,
                        mean: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }

    /// Create or replace a sensor's statistics. `generated` is stored as reported.
    pub fn put_stats(&self, sensor_id: i64, generated: &Timestamp, mean: f64) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO stats (sensor_id, generated, mean) VALUES (?1, ?2, ?3)
                 ON CONFLICT(sensor_id) DO UPDATE SET
                    generated = excluded.generated,
                    mean = excluded.mean",
                params![sensor_id, generated.as_str(), mean],
            )
            .map_err(Error::from_write)?;
        Ok(())
    }

    /// Remove a sensor's statistics. Returns whether any existed.
    pub fn delete_stats(&self, sensor_id: i64) -> Result<bool> {
        let changed = self
            .tx
            .execute("DELETE FROM stats WHERE sensor_id = ?", [sensor_id])?;
        Ok(changed > 0)
    }
}

// API key operations
impl UnitOfWork<'_> {
    /// Digest of the single admin key, if one has been provisioned.
    pub fn admin_key(&self) -> Result<Option<KeyDigest>> {
        let digest = self
            .tx
            .query_row("SELECT key FROM api_keys WHERE admin = 1", [], |row| {
                key_digest(row, 0)
            })
            .optional()?;
        Ok(digest)
    }

    /// Digest of the key bound to a sensor, if any.
    pub fn sensor_key(&self, sensor_id: i64) -> Result<Option<KeyDigest>> {
        let digest = self
            .tx
            .query_row(
                "SELECT key FROM api_keys WHERE sensor_id = ?",
                [sensor_id],
                |row| key_digest(row, 0),
            )
            .optional()?;
        Ok(digest)
    }

    /// Install a new admin key, replacing the previous one.
    pub fn replace_admin_key(&self, digest: &KeyDigest) -> Result<()> {
        self.tx.execute("DELETE FROM api_keys WHERE admin = 1", [])?;
        self.tx
            .execute(
                "INSERT INTO api_keys (key, admin) VALUES (?1, 1)",
                [digest.as_bytes().as_slice()],
            )
            .map_err(Error::from_write)?;
        info!("Installed new admin key {:?}", digest);
        Ok(())
    }

    /// Bind a new key to a sensor, replacing its previous key.
    pub fn replace_sensor_key(&self, sensor_id: i64, digest: &KeyDigest) -> Result<()> {
        self.tx
            .execute("DELETE FROM api_keys WHERE sensor_id = ?", [sensor_id])?;
        self.tx
            .execute(
                "INSERT INTO api_keys (key, admin, sensor_id) VALUES (?1, 0, ?2)",
                params![digest.as_bytes().as_slice(), sensor_id],
            )
            .map_err(Error::from_write)?;
        info!("Installed new key {:?} for sensor {}", digest, sensor_id);
        Ok(())
    }
}
