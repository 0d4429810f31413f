//! Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// API behaviour.
    pub api: ApiConfig,
    /// Message broker used to dispatch stats tasks.
    pub broker: BrokerConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return all errors at once.
    ///
    /// # Example
    ///
    /// ```
    /// use sensorhub_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.cache.validate());
        errors.extend(self.api.validate());
        errors.extend(self.broker.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError::new(
                "server.bind",
                "bind address cannot be empty",
            ));
            return errors;
        }

        match self.bind.rsplit_once(':') {
            None => errors.push(ValidationError::new(
                "server.bind",
                format!(
                    "invalid bind address '{}': expected format 'host:port'",
                    self.bind
                ),
            )),
            Some((_, port)) => match port.parse::<u16>() {
                Ok(0) => errors.push(ValidationError::new("server.bind", "port cannot be 0")),
                Err(_) => errors.push(ValidationError::new(
                    "server.bind",
                    format!("invalid port '{}': must be a number 1-65535", port),
                )),
                Ok(_) => {}
            },
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: sensorhub_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }

        errors
    }
}

/// Where cached responses are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// One file per entry, survives restarts.
    #[default]
    File,
    /// Process memory.
    Memory,
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Directory for the file backend.
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::File,
            dir: default_cache_dir(),
        }
    }
}

impl CacheConfig {
    /// Validate cache configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.backend == CacheBackend::File && self.dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "cache.dir",
                "cache directory cannot be empty for the file backend",
            ));
        }

        errors
    }
}

/// Default number of measurements per page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Largest accepted page size.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Measurements per page of a measurement listing.
    pub page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ApiConfig {
    /// Validate API configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            errors.push(ValidationError::new(
                "api.page_size",
                format!(
                    "page size {} is out of range (1-{})",
                    self.page_size, MAX_PAGE_SIZE
                ),
            ));
        }

        errors
    }
}

/// Maximum broker operation timeout in seconds.
pub const MAX_BROKER_TIMEOUT_SECS: u64 = 120;

/// AMQP broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port; 5672, or 5671 with TLS, when unset.
    pub port: Option<u16>,
    /// Virtual host.
    pub vhost: String,
    /// Username for authentication (optional).
    pub username: Option<String>,
    /// Password for authentication (optional).
    pub password: Option<String>,
    /// Durable queue that receives stats tasks.
    pub queue: String,
    /// Bound on each publish attempt, in seconds.
    pub timeout_secs: u64,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds. Doubles per retry.
    pub retry_delay_ms: u64,
    /// TLS settings.
    pub tls: BrokerTlsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            vhost: "/".to_string(),
            username: None,
            password: None,
            queue: "stats".to_string(),
            timeout_secs: 5,
            max_retries: 2,
            retry_delay_ms: 200,
            tls: BrokerTlsConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls.enabled { 5671 } else { 5672 })
    }

    /// Bound on each publish attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate broker configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push(ValidationError::new("broker.host", "host cannot be empty"));
        }
        if self.port == Some(0) {
            errors.push(ValidationError::new("broker.port", "port cannot be 0"));
        }
        if self.queue.is_empty() {
            errors.push(ValidationError::new(
                "broker.queue",
                "queue name cannot be empty",
            ));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_BROKER_TIMEOUT_SECS {
            errors.push(ValidationError::new(
                "broker.timeout_secs",
                format!(
                    "timeout {} is out of range (1-{} seconds)",
                    self.timeout_secs, MAX_BROKER_TIMEOUT_SECS
                ),
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            errors.push(ValidationError::new(
                "broker.username",
                "username and password must be given together",
            ));
        }

        errors.extend(self.tls.validate());
        errors
    }
}

/// TLS settings for the broker connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerTlsConfig {
    /// Connect with `amqps`.
    pub enabled: bool,
    /// PEM bundle of trusted CA certificates.
    pub ca_cert: Option<PathBuf>,
    /// PKCS#12 archive holding the client certificate and key.
    pub client_identity: Option<PathBuf>,
    /// Password of the PKCS#12 archive.
    pub client_identity_password: Option<String>,
}

impl BrokerTlsConfig {
    /// Validate TLS configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !self.enabled && (self.ca_cert.is_some() || self.client_identity.is_some()) {
            errors.push(ValidationError::new(
                "broker.tls.enabled",
                "certificates are configured but TLS is disabled",
            ));
        }
        if self.client_identity.is_none() && self.client_identity_password.is_some() {
            errors.push(ValidationError::new(
                "broker.tls.client_identity_password",
                "password given without client_identity",
            ));
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `broker.tls.enabled`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sensorhub")
        .join("server.toml")
}

/// Default directory of the file-backed response cache.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sensorhub")
        .join("responses")
}
