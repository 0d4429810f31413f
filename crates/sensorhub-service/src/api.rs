//! REST API endpoints.
//!
//! # Authorization
//!
//! | Route | Open | Admin key | Sensor key |
//! |-------|------|-----------|------------|
//! | `/api/sensors/` | | GET, POST | |
//! | `/api/sensors/{sensor}/` | GET | PUT, DELETE | |
//! | `/api/sensors/{sensor}/measurements/` | GET | | POST |
//! | `/api/sensors/{sensor}/stats/` | GET | PUT, DELETE | |
//! | `/api/locations/` | GET | POST | |
//! | `/api/locations/{location}/` | GET | DELETE | |
//!
//! # Lock Acquisition
//!
//! Handlers lock `state.store`, do all of their database work in one
//! [`UnitOfWork`] and release the lock before touching the cache or the
//! broker.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`].

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{StatusCode, Uri, header},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use sensorhub_store::{MeasurementQuery, NewLocation, StoredLocation, StoredSensor, UnitOfWork};
use sensorhub_types::{
    LocationDocument, MeasurementDocument, SensorDocument, StatsDocument, Timestamp,
};

use crate::cache::{CachedResponse, page_key};
use crate::dispatch::StatsTask;
use crate::error::AppError;
use crate::extract::JsonDocument;
use crate::middleware::{Gate, Scope, authorize};
use crate::state::AppState;

/// Create the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = || from_fn_with_state(Gate::new(&state, Scope::Admin), authorize);
    let sensor_key = from_fn_with_state(Gate::new(&state, Scope::Sensor), authorize);

    Router::new()
        .route("/api/", get(entry))
        // Sensors
        .route(
            "/api/sensors/",
            get(list_sensors).post(create_sensor).route_layer(admin()),
        )
        .route(
            "/api/sensors/{sensor}/",
            get(get_sensor).merge(
                put(update_sensor)
                    .delete(delete_sensor)
                    .route_layer(admin()),
            ),
        )
        .route(
            "/api/sensors/{sensor}/measurements/",
            get(list_measurements).merge(post(add_measurement).route_layer(sensor_key)),
        )
        .route(
            "/api/sensors/{sensor}/stats/",
            get(get_stats).merge(put(put_stats).delete(delete_stats).route_layer(admin())),
        )
        // Locations
        .route(
            "/api/locations/",
            get(list_locations).merge(post(create_location).route_layer(admin())),
        )
        .route(
            "/api/locations/{location}/",
            get(get_location).merge(delete(delete_location).route_layer(admin())),
        )
        .with_state(Arc::clone(&state))
}

/// API entry point.
#[derive(Debug, Serialize)]
pub struct ApiEntry {
    pub api_version: &'static str,
    pub api_name: &'static str,
}

async fn entry() -> Json<ApiEntry> {
    Json(ApiEntry {
        api_version: "1.0",
        api_name: "sensorhub",
    })
}

// ==================== Representations ====================

/// Location as embedded in a sensor.
#[derive(Debug, Serialize)]
pub struct LocationBody {
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub description: Option<String>,
}

impl From<StoredLocation> for LocationBody {
    fn from(location: StoredLocation) -> Self {
        Self {
            name: location.name,
            latitude: location.latitude,
            longitude: location.longitude,
            altitude: location.altitude,
            description: location.description,
        }
    }
}

/// A location resource, with the sensor placed there.
#[derive(Debug, Serialize)]
pub struct LocationItemBody {
    #[serde(flatten)]
    pub location: LocationBody,
    pub sensor: Option<String>,
}

/// Short form used in collections.
#[derive(Debug, Serialize)]
pub struct NameOnly {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct SensorBody {
    pub name: String,
    pub model: String,
    pub location: Option<LocationBody>,
    /// Names of the deployments the sensor takes part in.
    pub deployments: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SensorSummary {
    pub name: String,
    pub model: String,
    pub location: Option<NameOnly>,
}

#[derive(Debug, Serialize)]
pub struct Collection<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct MeasurementBody {
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

/// One page of a sensor's measurements, oldest first.
#[derive(Debug, Serialize)]
pub struct MeasurementPage {
    pub sensor: String,
    pub measurements: Vec<MeasurementBody>,
}

#[derive(Debug, Serialize)]
pub struct StatsBody {
    /// Echoed exactly as it was written.
    pub generated: Timestamp,
    pub mean: f64,
}

/// Query parameters of a paged listing.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    /// Zero-based page index.
    pub start: Option<u64>,
}

// ==================== Helpers ====================

fn find_sensor(uow: &UnitOfWork<'_>, name: &str) -> Result<StoredSensor, AppError> {
    uow.get_sensor(name)?
        .ok_or_else(|| AppError::NotFound(format!("Sensor not found: {name}")))
}

fn find_location(uow: &UnitOfWork<'_>, name: &str) -> Result<StoredLocation, AppError> {
    uow.get_location(name)?
        .ok_or_else(|| AppError::NotFound(format!("Location not found: {name}")))
}

/// Turn a uniqueness violation on `name` into a readable 409.
fn name_taken(entity: &str, name: &str) -> impl FnOnce(sensorhub_store::Error) -> AppError {
    move |e| {
        if e.is_conflict() {
            AppError::Conflict(format!("{entity} with name '{name}' already exists."))
        } else {
            e.into()
        }
    }
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Percent-encode a single path segment.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ==================== Sensors ====================

async fn list_sensors(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Collection<SensorSummary>>, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;

    let mut items = Vec::new();
    for sensor in uow.list_sensors()? {
        let location = match sensor.location_id {
            Some(id) => uow
                .get_location_by_id(id)?
                .map(|location| NameOnly {
                    name: location.name,
                }),
            None => None,
        };
        items.push(SensorSummary {
            name: sensor.name,
            model: sensor.model,
            location,
        });
    }

    Ok(Json(Collection { items }))
}

async fn create_sensor(
    State(state): State<Arc<AppState>>,
    JsonDocument(doc): JsonDocument<SensorDocument>,
) -> Result<impl IntoResponse, AppError> {
    {
        let mut store = state.store.lock().await;
        let uow = store.begin()?;
        uow.insert_sensor(&doc.name, &doc.model)
            .map_err(name_taken("Sensor", &doc.name))?;
        uow.commit()?;
    }

    info!("Created sensor {}", doc.name);
    let location = format!("/api/sensors/{}/", encode_segment(&doc.name));
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]))
}

async fn get_sensor(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SensorBody>, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let sensor = find_sensor(&uow, &name)?;

    let location = match sensor.location_id {
        Some(id) => uow.get_location_by_id(id)?.map(LocationBody::from),
        None => None,
    };
    let deployments = uow
        .sensor_deployments(sensor.id)?
        .into_iter()
        .map(|d| d.name)
        .collect();

    Ok(Json(SensorBody {
        name: sensor.name,
        model: sensor.model,
        location,
        deployments,
    }))
}

async fn update_sensor(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    JsonDocument(doc): JsonDocument<SensorDocument>,
) -> Result<StatusCode, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let sensor = find_sensor(&uow, &name)?;

    uow.update_sensor(sensor.id, &doc.name, &doc.model)
        .map_err(name_taken("Sensor", &doc.name))?;
    uow.commit()?;

    Ok(StatusCode::NO_CONTENT)
}

async fn delete_sensor(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let sensor = find_sensor(&uow, &name)?;

    uow.delete_sensor(sensor.id)?;
    uow.commit()?;

    info!("Deleted sensor {}", name);
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Measurements ====================

/// One page of measurements.
///
/// Full pages are cached forever under the request path plus `start`. The
/// cache is consulted before the sensor is looked up, so a cached page is
/// served even after its sensor is gone.
async fn list_measurements(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    uri: Uri,
    params: Result<Query<PageParams>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let start = params.start.unwrap_or(0);
    let key = page_key(uri.path(), start);

    match state.cache.get(&key).await {
        Ok(Some(hit)) => {
            debug!("Cache hit for {}", key);
            let status = StatusCode::from_u16(hit.status).unwrap_or(StatusCode::OK);
            return Ok(json_response(status, hit.body));
        }
        Ok(None) => debug!("Cache miss for {}", key),
        Err(e) => warn!("Cache read for {} failed: {}", key, e),
    }

    let page_size = state.config.api.page_size;
    let page = {
        let mut store = state.store.lock().await;
        let uow = store.begin()?;
        let sensor = find_sensor(&uow, &name)?;
        let rows = uow.query_measurements(&MeasurementQuery::page(sensor.id, start, page_size))?;

        MeasurementPage {
            sensor: sensor.name,
            measurements: rows
                .into_iter()
                .map(|m| MeasurementBody {
                    value: m.value,
                    time: m.time,
                })
                .collect(),
        }
    };

    let body = serde_json::to_string(&page)
        .map_err(|e| AppError::Internal(format!("Failed to encode page: {e}")))?;

    if page.measurements.len() == page_size as usize {
        let entry = CachedResponse {
            status: StatusCode::OK.as_u16(),
            body: body.clone(),
        };
        if let Err(e) = state.cache.set(&key, &entry).await {
            warn!("Cache write for {} failed: {}", key, e);
        }
    }

    Ok(json_response(StatusCode::OK, body))
}

async fn add_measurement(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    JsonDocument(doc): JsonDocument<MeasurementDocument>,
) -> Result<StatusCode, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let sensor = find_sensor(&uow, &name)?;

    let time = doc.time.unwrap_or_else(OffsetDateTime::now_utc);
    uow.insert_measurement(sensor.id, doc.value, time)?;
    uow.commit()?;

    Ok(StatusCode::CREATED)
}

// ==================== Stats ====================

/// Stats of a sensor, or a dispatched computation.
///
/// Without stored stats every call publishes a new task and answers 202;
/// nothing records that a task is pending. A failed publish is 502.
async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let task = {
        let mut store = state.store.lock().await;
        let uow = store.begin()?;
        let sensor = find_sensor(&uow, &name)?;

        if let Some(stats) = uow.get_stats(sensor.id)? {
            let body = StatsBody {
                generated: stats.generated,
                mean: stats.mean,
            };
            return Ok(Json(body).into_response());
        }

        StatsTask {
            data: uow.measurement_values(sensor.id)?,
            sensor: sensor.name,
        }
    };

    state.publisher.publish(&task).await?;
    info!(
        "Dispatched stats task for {} ({} values)",
        task.sensor,
        task.data.len()
    );

    Ok(StatusCode::ACCEPTED.into_response())
}

async fn put_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    JsonDocument(doc): JsonDocument<StatsDocument>,
) -> Result<StatusCode, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let sensor = find_sensor(&uow, &name)?;

    uow.put_stats(sensor.id, &doc.generated, doc.mean)?;
    uow.commit()?;

    Ok(StatusCode::NO_CONTENT)
}

async fn delete_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let sensor = find_sensor(&uow, &name)?;

    if !uow.delete_stats(sensor.id)? {
        return Err(AppError::NotFound(format!("No stats for sensor {name}")));
    }
    uow.commit()?;

    Ok(StatusCode::NO_CONTENT)
}

// ==================== Locations ====================

async fn list_locations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Collection<NameOnly>>, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;

    let items = uow
        .list_locations()?
        .into_iter()
        .map(|location| NameOnly {
            name: location.name,
        })
        .collect();

    Ok(Json(Collection { items }))
}

async fn create_location(
    State(state): State<Arc<AppState>>,
    JsonDocument(doc): JsonDocument<LocationDocument>,
) -> Result<impl IntoResponse, AppError> {
    {
        let mut store = state.store.lock().await;
        let uow = store.begin()?;

        let sensor = match &doc.sensor {
            Some(name) => Some(find_sensor(&uow, name)?),
            None => None,
        };

        let location = uow
            .insert_location(&NewLocation {
                name: doc.name.clone(),
                latitude: doc.latitude,
                longitude: doc.longitude,
                altitude: doc.altitude,
                description: doc.description.clone(),
            })
            .map_err(name_taken("Location", &doc.name))?;

        if let Some(sensor) = &sensor {
            uow.assign_location(sensor, location.id).map_err(|e| {
                if e.is_conflict() {
                    AppError::Conflict(format!("Sensor '{}' already has a location.", sensor.name))
                } else {
                    e.into()
                }
            })?;
        }
        uow.commit()?;
    }

    let location = format!("/api/locations/{}/", encode_segment(&doc.name));
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]))
}

async fn get_location(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<LocationItemBody>, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let mut location = find_location(&uow, &name)?;

    let sensor = location.sensor.take();
    Ok(Json(LocationItemBody {
        location: location.into(),
        sensor,
    }))
}

async fn delete_location(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let location = find_location(&uow, &name)?;

    uow.delete_location(location.id)?;
    uow.commit()?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use time::macros::datetime;
    use tower::ServiceExt;

    use sensorhub_store::Store;
    use sensorhub_types::KeyDigest;

    use crate::cache::MemoryCache;
    use crate::config::Config;
    use crate::dispatch::testing::RecordingPublisher;
    use crate::middleware::API_KEY_HEADER;

    const ADMIN_KEY: &str = "verysafetestkey";
    const SENSOR_KEY: &str = "sensor1key";

    /// Three sensors, an admin key, a key for `test-sensor-1` and a deployment.
    fn create_test_state_with(
        publisher: RecordingPublisher,
        page_size: u32,
    ) -> (Arc<AppState>, Arc<RecordingPublisher>) {
        let mut store = Store::open_in_memory().unwrap();
        {
            let uow = store.begin().unwrap();
            for i in 1..=3 {
                uow.insert_sensor(&format!("test-sensor-{i}"), "testsensor")
                    .unwrap();
            }
            let sensor = uow.get_sensor("test-sensor-1").unwrap().unwrap();
            uow.replace_admin_key(&KeyDigest::of(ADMIN_KEY)).unwrap();
            uow.replace_sensor_key(sensor.id, &KeyDigest::of(SENSOR_KEY))
                .unwrap();
            let deployment = uow
                .insert_deployment(
                    "campaign",
                    datetime!(2024-01-01 0:00 UTC),
                    datetime!(2024-12-31 0:00 UTC),
                )
                .unwrap();
            uow.attach_deployment(deployment.id, sensor.id).unwrap();
            uow.commit().unwrap();
        }

        let mut config = Config::default();
        config.api.page_size = page_size;

        let publisher = Arc::new(publisher);
        let state = AppState::new(
            store,
            config,
            Arc::new(MemoryCache::new()),
            Arc::clone(&publisher) as Arc<dyn crate::dispatch::TaskPublisher>,
        );
        (state, publisher)
    }

    fn create_test_state() -> (Arc<AppState>, Arc<RecordingPublisher>) {
        create_test_state_with(RecordingPublisher::default(), 5)
    }

    fn request(method: &str, uri: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> Response {
        router(Arc::clone(state)).oneshot(request).await.unwrap()
    }

    async fn response_body(response: Response) -> String {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn response_json(response: Response) -> Value {
        serde_json::from_str(&response_body(response).await).unwrap()
    }

    /// Insert `count` measurements for a sensor, 10 s apart, in reverse order.
    async fn add_measurements(state: &Arc<AppState>, sensor: &str, count: i64) {
        let mut store = state.store.lock().await;
        let uow = store.begin().unwrap();
        let sensor = uow.get_sensor(sensor).unwrap().unwrap();
        let base = datetime!(2024-01-01 0:00 UTC);
        for i in (0..count).rev() {
            uow.insert_measurement(sensor.id, i as f64, base + time::Duration::seconds(10 * i))
                .unwrap();
        }
        uow.commit().unwrap();
    }

    fn values(page: &Value) -> Vec<f64> {
        page["measurements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["value"].as_f64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_entry_point() {
        let (state, _) = create_test_state();
        let response = send(&state, request("GET", "/api/", None, None)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json, json!({"api_version": "1.0", "api_name": "sensorhub"}));
    }

    // ==================== Authorization ====================

    #[tokio::test]
    async fn test_list_sensors_with_admin_key() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request("GET", "/api/sensors/", Some(ADMIN_KEY), None),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        let items = json["items"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(
            items[0],
            json!({"name": "test-sensor-1", "model": "testsensor", "location": null})
        );
    }

    #[tokio::test]
    async fn test_list_sensors_rejects_bad_keys() {
        let (state, _) = create_test_state();

        for key in [None, Some("wrong"), Some(""), Some(SENSOR_KEY)] {
            let response = send(&state, request("GET", "/api/sensors/", key, None)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "key {key:?}");
            let json = response_json(response).await;
            assert!(json["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_admin_key_is_trimmed() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request("GET", "/api/sensors/", Some(" verysafetestkey "), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_admin_key_provisioned() {
        let store = Store::open_in_memory().unwrap();
        let state = AppState::new(
            store,
            Config::default(),
            Arc::new(MemoryCache::new()),
            Arc::new(RecordingPublisher::default()),
        );

        let response = send(&state, request("GET", "/api/sensors/", Some(""), None)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    /// Every admin-gated route with a valid body and the status it answers
    /// when the admin key is presented.
    fn admin_routes() -> Vec<(&'static str, &'static str, Option<Value>, StatusCode)> {
        let sensor = json!({"name": "x", "model": "y"});
        let stats = json!({"generated": "2024-05-01T12:00:00Z", "mean": 1.0});

        vec![
            ("GET", "/api/sensors/", None, StatusCode::OK),
            ("POST", "/api/sensors/", Some(sensor.clone()), StatusCode::CREATED),
            ("PUT", "/api/sensors/test-sensor-1/", Some(sensor), StatusCode::NO_CONTENT),
            ("DELETE", "/api/sensors/test-sensor-1/", None, StatusCode::NO_CONTENT),
            ("PUT", "/api/sensors/test-sensor-1/stats/", Some(stats), StatusCode::NO_CONTENT),
            ("DELETE", "/api/sensors/test-sensor-1/stats/", None, StatusCode::NO_CONTENT),
            ("POST", "/api/locations/", Some(json!({"name": "attic"})), StatusCode::CREATED),
            ("DELETE", "/api/locations/roof/", None, StatusCode::NO_CONTENT),
        ]
    }

    /// Give test-sensor-1 stats and a location named `roof`.
    async fn seed_stats_and_location(state: &Arc<AppState>) {
        let mut store = state.store.lock().await;
        let uow = store.begin().unwrap();
        let sensor = uow.get_sensor("test-sensor-1").unwrap().unwrap();
        uow.put_stats(
            sensor.id,
            &Timestamp::parse("2024-01-01T00:00:00Z").unwrap(),
            4.0,
        )
        .unwrap();
        let location = uow
            .insert_location(&NewLocation {
                name: "roof".to_string(),
                latitude: None,
                longitude: None,
                altitude: None,
                description: None,
            })
            .unwrap();
        uow.assign_location(&sensor, location.id).unwrap();
        uow.commit().unwrap();
    }

    #[tokio::test]
    async fn test_admin_routes_reject_other_keys() {
        let (state, _) = create_test_state();
        seed_stats_and_location(&state).await;

        for (method, uri, body, _) in admin_routes() {
            for key in [None, Some("wrong"), Some(""), Some(SENSOR_KEY)] {
                let response = send(&state, request(method, uri, key, body.clone())).await;
                assert_eq!(
                    response.status(),
                    StatusCode::FORBIDDEN,
                    "{method} {uri} with {key:?}"
                );
            }
        }

        // Nothing was changed
        let sensor = response_json(
            send(
                &state,
                request("GET", "/api/sensors/test-sensor-1/", None, None),
            )
            .await,
        )
        .await;
        assert_eq!(sensor["model"], "testsensor");
        assert_eq!(sensor["location"]["name"], "roof");

        let response = send(
            &state,
            request("GET", "/api/sensors/test-sensor-1/stats/", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let locations =
            response_json(send(&state, request("GET", "/api/locations/", None, None)).await).await;
        assert_eq!(locations, json!({"items": [{"name": "roof"}]}));
    }

    #[tokio::test]
    async fn test_admin_routes_accept_admin_key() {
        for (method, uri, body, expected) in admin_routes() {
            let (state, _) = create_test_state();
            seed_stats_and_location(&state).await;

            let response = send(&state, request(method, uri, Some(ADMIN_KEY), body)).await;
            assert_eq!(response.status(), expected, "{method} {uri}");
        }
    }

    // ==================== Sensors ====================

    #[tokio::test]
    async fn test_create_then_get_sensor() {
        let (state, _) = create_test_state();

        let response = send(
            &state,
            request(
                "POST",
                "/api/sensors/",
                Some(ADMIN_KEY),
                Some(json!({"name": "test-sensor-4", "model": "bme280"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/api/sensors/test-sensor-4/"
        );

        let response = send(
            &state,
            request("GET", "/api/sensors/test-sensor-4/", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["name"], "test-sensor-4");
        assert_eq!(json["model"], "bme280");
        assert_eq!(json["location"], Value::Null);
    }

    #[tokio::test]
    async fn test_location_header_is_encoded() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request(
                "POST",
                "/api/sensors/",
                Some(ADMIN_KEY),
                Some(json!({"name": "hall 1/a", "model": "m"})),
            ),
        )
        .await;
        assert_eq!(
            response.headers()[header::LOCATION],
            "/api/sensors/hall%201%2Fa/"
        );
    }

    #[tokio::test]
    async fn test_create_duplicate_sensor_conflicts() {
        let (state, _) = create_test_state();

        let response = send(
            &state,
            request(
                "POST",
                "/api/sensors/",
                Some(ADMIN_KEY),
                Some(json!({"name": "test-sensor-1", "model": "other"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("test-sensor-1"));

        let response = send(
            &state,
            request("GET", "/api/sensors/test-sensor-1/", None, None),
        )
        .await;
        let json = response_json(response).await;
        assert_eq!(json["model"], "testsensor");
    }

    #[tokio::test]
    async fn test_create_sensor_schema_failure() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request(
                "POST",
                "/api/sensors/",
                Some(ADMIN_KEY),
                Some(json!({"name": "test-sensor-4"})),
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("model"));
    }

    #[tokio::test]
    async fn test_create_sensor_requires_json() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            Request::builder()
                .method("POST")
                .uri("/api/sensors/")
                .header(API_KEY_HEADER, ADMIN_KEY)
                .header("content-type", "text/plain")
                .body(Body::from("name=x"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = send(
            &state,
            request("POST", "/api/sensors/", Some(ADMIN_KEY), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            Request::builder()
                .method("POST")
                .uri("/api/sensors/")
                .header(API_KEY_HEADER, ADMIN_KEY)
                .header("content-type", "application/json")
                .body(Body::from("{\"name\": "))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_sensor_full_representation() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request("GET", "/api/sensors/test-sensor-1/", None, None),
        )
        .await;

        let json = response_json(response).await;
        assert_eq!(
            json,
            json!({
                "name": "test-sensor-1",
                "model": "testsensor",
                "location": null,
                "deployments": ["campaign"]
            })
        );
    }

    #[tokio::test]
    async fn test_get_unknown_sensor() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request("GET", "/api/sensors/non-sensor-x/", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_sensor_to_taken_name_conflicts() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request(
                "PUT",
                "/api/sensors/test-sensor-1/",
                Some(ADMIN_KEY),
                Some(json!({"name": "test-sensor-2", "model": "x"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_put_sensor_keeping_name() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request(
                "PUT",
                "/api/sensors/test-sensor-1/",
                Some(ADMIN_KEY),
                Some(json!({"name": "test-sensor-1", "model": "x"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(
            &state,
            request("GET", "/api/sensors/test-sensor-1/", None, None),
        )
        .await;
        assert_eq!(response_json(response).await["model"], "x");
    }

    #[tokio::test]
    async fn test_put_sensor_rename_and_errors() {
        let (state, _) = create_test_state();

        let response = send(
            &state,
            request(
                "PUT",
                "/api/sensors/test-sensor-3/",
                Some(ADMIN_KEY),
                Some(json!({"name": "renamed", "model": "x"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(
            &state,
            request("GET", "/api/sensors/renamed/", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &state,
            request(
                "PUT",
                "/api/sensors/test-sensor-3/",
                Some(ADMIN_KEY),
                Some(json!({"name": "x", "model": "x"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &state,
            request(
                "PUT",
                "/api/sensors/renamed/",
                Some(ADMIN_KEY),
                Some(json!({"name": 5, "model": "x"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_sensor() {
        let (state, _) = create_test_state();

        let response = send(
            &state,
            request("DELETE", "/api/sensors/test-sensor-2/", Some(ADMIN_KEY), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(
            &state,
            request("GET", "/api/sensors/test-sensor-2/", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &state,
            request("DELETE", "/api/sensors/test-sensor-2/", Some(ADMIN_KEY), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // ==================== Measurements ====================

    #[tokio::test]
    async fn test_measurement_pages_in_time_order() {
        let (state, _) = create_test_state();
        add_measurements(&state, "test-sensor-1", 12).await;

        let response = send(
            &state,
            request("GET", "/api/sensors/test-sensor-1/measurements/", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = response_json(response).await;
        assert_eq!(page["sensor"], "test-sensor-1");
        assert_eq!(values(&page), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            page["measurements"][1]["time"],
            "2024-01-01T00:00:10Z"
        );

        let response = send(
            &state,
            request(
                "GET",
                "/api/sensors/test-sensor-1/measurements/?start=2",
                None,
                None,
            ),
        )
        .await;
        assert_eq!(values(&response_json(response).await), vec![10.0, 11.0]);
    }

    #[tokio::test]
    async fn test_full_pages_stay_cached() {
        let (state, _) = create_test_state();
        add_measurements(&state, "test-sensor-1", 12).await;
        let page1 = "/api/sensors/test-sensor-1/measurements/?start=1";
        let page2 = "/api/sensors/test-sensor-1/measurements/?start=2";

        let first = response_body(send(&state, request("GET", page1, None, None)).await).await;
        let partial = response_json(send(&state, request("GET", page2, None, None)).await).await;
        assert_eq!(values(&partial), vec![10.0, 11.0]);

        // An earlier measurement shifts every page by one
        {
            let mut store = state.store.lock().await;
            let uow = store.begin().unwrap();
            let sensor = uow.get_sensor("test-sensor-1").unwrap().unwrap();
            uow.insert_measurement(sensor.id, 100.0, datetime!(2023-12-31 0:00 UTC))
                .unwrap();
            uow.commit().unwrap();
        }

        let again = response_body(send(&state, request("GET", page1, None, None)).await).await;
        assert_eq!(first, again);

        let partial = response_json(send(&state, request("GET", page2, None, None)).await).await;
        assert_eq!(values(&partial), vec![9.0, 10.0, 11.0]);
    }

    #[tokio::test]
    async fn test_measurements_invalid_start() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request(
                "GET",
                "/api/sensors/test-sensor-1/measurements/?start=abc",
                None,
                None,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_measurements_unknown_sensor() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request("GET", "/api/sensors/nope/measurements/", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_measurement_with_sensor_key() {
        let (state, _) = create_test_state();
        let uri = "/api/sensors/test-sensor-1/measurements/";

        let response = send(
            &state,
            request(
                "POST",
                uri,
                Some(SENSOR_KEY),
                Some(json!({"value": 21.5, "time": "2024-02-01T10:00:00Z"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(
            &state,
            request("POST", uri, Some(SENSOR_KEY), Some(json!({"value": 22.0}))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let page = response_json(send(&state, request("GET", uri, None, None)).await).await;
        assert_eq!(values(&page), vec![21.5, 22.0]);
        assert_eq!(page["measurements"][0]["time"], "2024-02-01T10:00:00Z");
    }

    #[tokio::test]
    async fn test_add_measurement_rejects_other_keys() {
        let (state, _) = create_test_state();
        let body = json!({"value": 1.0});

        for key in [None, Some("wrong"), Some(ADMIN_KEY)] {
            let response = send(
                &state,
                request(
                    "POST",
                    "/api/sensors/test-sensor-1/measurements/",
                    key,
                    Some(body.clone()),
                ),
            )
            .await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "key {key:?}");
        }

        // A key bound to another sensor
        let response = send(
            &state,
            request(
                "POST",
                "/api/sensors/test-sensor-2/measurements/",
                Some(SENSOR_KEY),
                Some(body),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_add_measurement_bad_time() {
        let (state, _) = create_test_state();
        let response = send(
            &state,
            request(
                "POST",
                "/api/sensors/test-sensor-1/measurements/",
                Some(SENSOR_KEY),
                Some(json!({"value": 1.0, "time": "2024-02-01 10:00"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // ==================== Stats ====================

    #[tokio::test]
    async fn test_stats_missing_dispatches_task() {
        let (state, publisher) = create_test_state();
        add_measurements(&state, "test-sensor-1", 3).await;
        let uri = "/api/sensors/test-sensor-1/stats/";

        let response = send(&state, request("GET", uri, None, None)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let tasks = publisher.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0],
            StatsTask {
                sensor: "test-sensor-1".to_string(),
                data: vec![0.0, 1.0, 2.0],
            }
        );

        // No pending state is kept; polling again publishes again
        let response = send(&state, request("GET", uri, None, None)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(publisher.tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_stats_put_then_get() {
        let (state, publisher) = create_test_state();
        let uri = "/api/sensors/test-sensor-2/stats/";

        let response = send(
            &state,
            request(
                "PUT",
                uri,
                Some(ADMIN_KEY),
                Some(json!({"generated": "2024-05-01T12:00:00+03:00", "mean": 12.5})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&state, request("GET", uri, None, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            json!({"generated": "2024-05-01T12:00:00+03:00", "mean": 12.5})
        );
        assert!(publisher.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_stats_generated_text_is_kept() {
        let (state, _) = create_test_state();
        let uri = "/api/sensors/test-sensor-2/stats/";

        for generated in [
            "2024-05-01T12:00:00.500Z",
            "2024-05-01T12:00:00.000Z",
            "2024-05-01T12:00:00.25-05:30",
        ] {
            let response = send(
                &state,
                request(
                    "PUT",
                    uri,
                    Some(ADMIN_KEY),
                    Some(json!({"generated": generated, "mean": 1.5})),
                ),
            )
            .await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);

            let body = response_json(send(&state, request("GET", uri, None, None)).await).await;
            assert_eq!(body, json!({"generated": generated, "mean": 1.5}));
        }
    }

    #[tokio::test]
    async fn test_stats_put_validation() {
        let (state, _) = create_test_state();
        let uri = "/api/sensors/test-sensor-2/stats/";

        for body in [
            json!({"generated": "2024-05-01T12:00:00Z"}),
            json!({"mean": 1.0}),
            json!({"generated": "yesterday", "mean": 1.0}),
            json!({"generated": "2024-05-01T12:00:00Z", "mean": "1.0"}),
        ] {
            let response = send(&state, request("PUT", uri, Some(ADMIN_KEY), Some(body.clone()))).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }
    }

    #[tokio::test]
    async fn test_stats_dispatch_failure_is_bad_gateway() {
        let (state, publisher) = create_test_state_with(RecordingPublisher::failing(), 5);
        let response = send(
            &state,
            request("GET", "/api/sensors/test-sensor-1/stats/", None, None),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(publisher.tasks().len(), 1);
        let json = response_json(response).await;
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_stats_delete() {
        let (state, _) = create_test_state();
        let uri = "/api/sensors/test-sensor-1/stats/";

        let response = send(&state, request("DELETE", uri, Some(ADMIN_KEY), None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        send(
            &state,
            request(
                "PUT",
                uri,
                Some(ADMIN_KEY),
                Some(json!({"generated": "2024-05-01T12:00:00Z", "mean": 3.0})),
            ),
        )
        .await;

        let response = send(&state, request("DELETE", uri, Some(ADMIN_KEY), None)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&state, request("GET", uri, None, None)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_stats_unknown_sensor() {
        let (state, publisher) = create_test_state();
        let response = send(
            &state,
            request("GET", "/api/sensors/nope/stats/", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(publisher.tasks().is_empty());
    }

    // ==================== Locations ====================

    #[tokio::test]
    async fn test_location_lifecycle() {
        let (state, _) = create_test_state();

        let response = send(
            &state,
            request(
                "POST",
                "/api/locations/",
                Some(ADMIN_KEY),
                Some(json!({
                    "name": "roof",
                    "latitude": 65.06,
                    "longitude": 25.47,
                    "description": "North corner",
                    "sensor": "test-sensor-1"
                })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::LOCATION], "/api/locations/roof/");

        let response = send(&state, request("GET", "/api/locations/roof/", None, None)).await;
        assert_eq!(
            response_json(response).await,
            json!({
                "name": "roof",
                "latitude": 65.06,
                "longitude": 25.47,
                "altitude": null,
                "description": "North corner",
                "sensor": "test-sensor-1"
            })
        );

        let sensor = response_json(
            send(
                &state,
                request("GET", "/api/sensors/test-sensor-1/", None, None),
            )
            .await,
        )
        .await;
        assert_eq!(sensor["location"]["name"], "roof");

        let items = response_json(
            send(
                &state,
                request("GET", "/api/sensors/", Some(ADMIN_KEY), None),
            )
            .await,
        )
        .await;
        assert_eq!(items["items"][0]["location"], json!({"name": "roof"}));

        let response = send(
            &state,
            request("DELETE", "/api/locations/roof/", Some(ADMIN_KEY), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let sensor = response_json(
            send(
                &state,
                request("GET", "/api/sensors/test-sensor-1/", None, None),
            )
            .await,
        )
        .await;
        assert_eq!(sensor["location"], Value::Null);

        let response = send(&state, request("GET", "/api/locations/roof/", None, None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_location_conflicts() {
        let (state, _) = create_test_state();
        let post = |body: Value| request("POST", "/api/locations/", Some(ADMIN_KEY), Some(body));

        let response = send(&state, post(json!({"name": "roof", "sensor": "test-sensor-1"}))).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        // Duplicate name
        let response = send(&state, post(json!({"name": "roof"}))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Sensor already placed; the new location is not kept
        let response = send(&state, post(json!({"name": "cellar", "sensor": "test-sensor-1"}))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = send(&state, request("GET", "/api/locations/cellar/", None, None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Unknown sensor
        let response = send(&state, post(json!({"name": "attic", "sensor": "nope"}))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Description too long
        let response = send(
            &state,
            post(json!({"name": "long", "description": "x".repeat(257)})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let list = response_json(send(&state, request("GET", "/api/locations/", None, None)).await).await;
        assert_eq!(list, json!({"items": [{"name": "roof"}]}));
    }
}
