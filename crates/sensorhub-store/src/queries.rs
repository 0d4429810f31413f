//! Query builder for measurements.
//!
//! # Example
//!
//! ```
//! use sensorhub_store::MeasurementQuery;
//!
//! // Third page of 50, oldest first
//! let query = MeasurementQuery::page(7, 2, 50);
//! assert_eq!(query.offset, Some(100));
//! assert_eq!(query.limit, Some(50));
//! ```

/// Fluent query builder for measurements.
///
/// Results are ordered by `time` ascending (oldest first), with ties broken
/// by insertion order so that pages are stable.
#[derive(Debug, Default, Clone)]
pub struct MeasurementQuery {
    /// Filter by owning sensor.
    pub sensor_id: Option<i64>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Number of rows to skip.
    pub offset: Option<u64>,
}

impl MeasurementQuery {
    /// Create a query over all measurements, oldest first.
    pub fn new() -> Self {
        Self::default()
    }

    /// A page of a sensor's measurements.
    ///
    /// Page `start` skips `start * page_size` rows. The offset is clamped to
    /// the largest value SQLite accepts.
    pub fn page(sensor_id: i64, start: u64, page_size: u32) -> Self {
        let offset = start
            .saturating_mul(u64::from(page_size))
            .min(i64::MAX as u64);
        Self::new().sensor(sensor_id).offset(offset).limit(page_size)
    }

    /// Only include measurements owned by this sensor.
    pub fn sensor(mut self, sensor_id: i64) -> Self {
        self.sensor_id = Some(sensor_id);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Build the WHERE clause and its parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(sensor_id) = self.sensor_id {
            conditions.push("sensor_id = ?");
            params.push(Box::new(sensor_id));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (clause, params)
    }

    /// Build the full SELECT statement.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let mut sql = format!(
            "SELECT id, sensor_id, value, time FROM measurements {} ORDER BY time ASC, id ASC",
            where_clause
        );

        // SQLite only accepts OFFSET after a LIMIT
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        sql
    }
}
