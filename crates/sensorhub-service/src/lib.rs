//! HTTP REST API for sensors, measurements and asynchronous statistics.
//!
//! This crate provides a service that:
//! - Stores sensors, locations and measurements in the local database
//! - Serves measurements in fixed-size pages, caching full pages
//! - Hands stats computation to an external worker over AMQP
//! - Gates writes with hashed API keys
//!
//! # REST API Endpoints
//!
//! - `GET /api/` - API entry point
//! - `GET|POST /api/sensors/` - List or create sensors (admin key)
//! - `GET|PUT|DELETE /api/sensors/{sensor}/` - One sensor
//! - `GET|POST /api/sensors/{sensor}/measurements/?start=N` - Measurement pages
//! - `GET|PUT|DELETE /api/sensors/{sensor}/stats/` - Stats, dispatched on demand
//! - `GET|POST /api/locations/` - List or create locations
//! - `GET|DELETE /api/locations/{location}/` - One location
//!
//! Keys are sent in the `Sensorhub-Api-Key` header.
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/sensorhub/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! path = "~/.local/share/sensorhub/sensorhub.db"
//!
//! [cache]
//! backend = "file"
//!
//! [api]
//! page_size = 50
//!
//! [broker]
//! host = "rabbit.example.com"
//! queue = "stats"
//! timeout_secs = 5
//!
//! [broker.tls]
//! enabled = true
//! ca_cert = "/etc/sensorhub/ca.pem"
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod retry;
pub mod state;

pub use cache::{CachedResponse, FileCache, MemoryCache, ResponseCache};
pub use config::{
    ApiConfig, BrokerConfig, BrokerTlsConfig, CacheBackend, CacheConfig, Config, ConfigError,
    ServerConfig, StorageConfig,
};
pub use dispatch::{AmqpPublisher, DispatchError, StatsTask, TaskPublisher};
pub use error::AppError;
pub use state::AppState;
