//! API key authorization.
//!
//! Gated routes are wrapped in [`authorize`] with an explicit [`Scope`]. The
//! presented key is always hashed and compared in constant time, including
//! when it is missing or when no key is on file, so every failure path does
//! the same work before answering 403.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, RawPathParams, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use sensorhub_types::KeyDigest;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "Sensorhub-Api-Key";

/// Path parameter naming the sensor a sensor-scoped route addresses.
const SENSOR_PARAM: &str = "sensor";

/// Authorization domain a route requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The single admin key.
    Admin,
    /// The key bound to the sensor named in the path.
    Sensor,
}

/// State of one gate: the application plus the scope it enforces.
#[derive(Clone)]
pub struct Gate {
    state: Arc<AppState>,
    scope: Scope,
}

impl Gate {
    pub fn new(state: &Arc<AppState>, scope: Scope) -> Self {
        Self {
            state: Arc::clone(state),
            scope,
        }
    }
}

/// Reject the request with 403 unless it carries the key for the gate's scope.
///
/// Use with [`axum::middleware::from_fn_with_state`] as a route layer.
pub async fn authorize(State(gate): State<Gate>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let digest = KeyDigest::of(presented);

    let (request, expected) = match gate.scope {
        Scope::Admin => (request, admin_key(&gate.state).await),
        Scope::Sensor => {
            let (mut parts, body) = request.into_parts();
            let sensor = match RawPathParams::from_request_parts(&mut parts, &()).await {
                Ok(params) => params
                    .iter()
                    .find(|(key, _)| *key == SENSOR_PARAM)
                    .map(|(_, value)| value.to_string()),
                Err(_) => None,
            };
            let expected = match sensor {
                Some(name) => sensor_key(&gate.state, &name).await,
                None => Err(AppError::Internal(
                    "sensor scope used on a route without a sensor".to_string(),
                )),
            };
            (Request::from_parts(parts, body), expected)
        }
    };

    let expected = match expected {
        Ok(expected) => expected,
        Err(e) => return e.into_response(),
    };

    if keys_match(expected.as_ref(), &digest) {
        debug!("{:?} key accepted for {}", gate.scope, request.uri().path());
        next.run(request).await
    } else {
        warn!(
            "API key rejected for {} {} ({:?} scope)",
            request.method(),
            request.uri().path(),
            gate.scope
        );
        AppError::Forbidden("Invalid or missing API key".to_string()).into_response()
    }
}

async fn admin_key(state: &AppState) -> Result<Option<KeyDigest>, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    Ok(uow.admin_key()?)
}

/// Key bound to the named sensor. An unknown sensor is 404, as on open routes.
async fn sensor_key(state: &AppState, name: &str) -> Result<Option<KeyDigest>, AppError> {
    let mut store = state.store.lock().await;
    let uow = store.begin()?;
    let sensor = uow
        .get_sensor(name)?
        .ok_or_else(|| AppError::NotFound(format!("Sensor not found: {name}")))?;
    Ok(uow.sensor_key(sensor.id)?)
}

/// Constant-time comparison. Nothing on file never matches.
fn keys_match(expected: Option<&KeyDigest>, presented: &KeyDigest) -> bool {
    let stored = expected.unwrap_or(presented);
    let equal: bool = stored.as_bytes()[..].ct_eq(&presented.as_bytes()[..]).into();
    equal && expected.is_some()
}
