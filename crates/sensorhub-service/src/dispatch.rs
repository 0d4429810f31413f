//! Stats task dispatch.
//!
//! When a sensor has no statistics yet, the API gathers its measurement values
//! and publishes a [`StatsTask`] to a durable AMQP queue. An external worker
//! computes the statistics and writes them back with `PUT .../stats/`.
//!
//! Every publish opens its own connection, declares the queue, publishes with
//! publisher confirms and closes the connection. Each attempt is bounded by
//! the configured timeout and failed attempts are retried with backoff.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo, SASLMechanism,
};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::retry::{RetryConfig, Retryable, with_retry};

/// Message body consumed by the stats worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsTask {
    /// Sensor name.
    pub sensor: String,
    /// Every measurement value recorded by the sensor.
    pub data: Vec<f64>,
}

/// Failure to hand a task over to the broker.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("Broker did not respond within {0:?}")]
    Timeout(Duration),
    #[error("Broker rejected the stats task")]
    Rejected,
    #[error("Failed to encode stats task: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to read TLS material {path}: {source}")]
    TlsMaterial {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Broker(_) | DispatchError::Timeout(_) | DispatchError::Rejected
        )
    }
}

/// Publishes stats tasks somewhere a worker will pick them up.
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    /// Publish one task. Returns only after the broker has accepted it.
    async fn publish(&self, task: &StatsTask) -> Result<(), DispatchError>;
}

/// [`TaskPublisher`] backed by an AMQP 0-9-1 broker.
pub struct AmqpPublisher {
    uri: AMQPUri,
    ca_cert: Option<String>,
    identity: Option<(Vec<u8>, String)>,
    queue: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl AmqpPublisher {
    /// Build a publisher, reading any TLS certificates up front.
    pub fn from_config(config: &BrokerConfig) -> Result<Self, DispatchError> {
        let ca_cert = match &config.tls.ca_cert {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| tls_error(path, e))?),
            None => None,
        };
        let identity = match &config.tls.client_identity {
            Some(path) => {
                let der = std::fs::read(path).map_err(|e| tls_error(path, e))?;
                let password = config.tls.client_identity_password.clone().unwrap_or_default();
                Some((der, password))
            }
            None => None,
        };

        info!(
            "Stats tasks go to queue '{}' on {}:{}",
            config.queue,
            config.host,
            config.port()
        );

        Ok(Self {
            uri: broker_uri(config),
            ca_cert,
            identity,
            queue: config.queue.clone(),
            timeout: config.timeout(),
            retry: RetryConfig::new(
                config.max_retries,
                Duration::from_millis(config.retry_delay_ms),
            ),
        })
    }

    fn tls_config(&self) -> OwnedTLSConfig {
        OwnedTLSConfig {
            identity: self
                .identity
                .as_ref()
                .map(|(der, password)| OwnedIdentity {
                    der: der.clone(),
                    password: password.clone(),
                }),
            cert_chain: self.ca_cert.clone(),
        }
    }

    /// One attempt. Connecting and publishing are each bounded by the
    /// configured timeout; an open connection is always closed afterwards.
    async fn publish_once(&self, payload: &[u8]) -> Result<(), DispatchError> {
        let connection = tokio::time::timeout(
            self.timeout,
            Connection::connect_uri_with_config(
                self.uri.clone(),
                ConnectionProperties::default(),
                self.tls_config(),
            ),
        )
        .await
        .map_err(|_| DispatchError::Timeout(self.timeout))??;

        let close = async {
            if let Err(e) = connection.close(200, "OK").await {
                debug!("Closing broker connection failed: {}", e);
            }
        };
        bounded_then_close(self.timeout, self.publish_on(&connection, payload), close).await
    }

    async fn publish_on(&self, connection: &Connection, payload: &[u8]) -> Result<(), DispatchError> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let confirmation = channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(DispatchError::Rejected);
        }
        Ok(())
    }
}

#[async_trait]
impl TaskPublisher for AmqpPublisher {
    async fn publish(&self, task: &StatsTask) -> Result<(), DispatchError> {
        let payload = serde_json::to_vec(task)?;
        let payload = payload.as_slice();

        let result = with_retry(&self.retry, "stats dispatch", || self.publish_once(payload)).await;

        match &result {
            Ok(()) => debug!(
                "Dispatched stats task for {} ({} values)",
                task.sensor,
                task.data.len()
            ),
            Err(e) => error!("Stats dispatch for {} failed: {}", task.sensor, e),
        }
        result
    }
}

/// Bound on closing a broker connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Run `work` within `limit`, then run `close` within [`CLOSE_TIMEOUT`]
/// whether or not `work` finished.
async fn bounded_then_close<W, C>(limit: Duration, work: W, close: C) -> Result<(), DispatchError>
where
    W: Future<Output = Result<(), DispatchError>>,
    C: Future<Output = ()>,
{
    let result = tokio::time::timeout(limit, work)
        .await
        .unwrap_or(Err(DispatchError::Timeout(limit)));

    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        warn!("Broker connection did not close within {:?}", CLOSE_TIMEOUT);
    }
    result
}

fn tls_error(path: &Path, source: std::io::Error) -> DispatchError {
    DispatchError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    }
}

/// Connection URI for the configured broker.
///
/// A client certificate without a username authenticates with SASL EXTERNAL.
fn broker_uri(config: &BrokerConfig) -> AMQPUri {
    let scheme = if config.tls.enabled {
        AMQPScheme::AMQPS
    } else {
        AMQPScheme::AMQP
    };

    let userinfo = match (&config.username, &config.password) {
        (Some(username), Some(password)) => AMQPUserInfo {
            username: username.clone(),
            password: password.clone(),
        },
        _ => AMQPUserInfo::default(),
    };

    let auth_mechanism = (config.tls.client_identity.is_some() && config.username.is_none())
        .then_some(SASLMechanism::External);

    AMQPUri {
        scheme,
        authority: AMQPAuthority {
            userinfo,
            host: config.host.clone(),
            port: config.port(),
        },
        vhost: config.vhost.clone(),
        query: AMQPQueryString {
            connection_timeout: Some(config.timeout().as_millis() as u64),
            auth_mechanism,
            ..Default::default()
        },
    }
}
