//! Sensorhub - HTTP API and administrative commands.
//!
//! Run with: `cargo run -p sensorhub-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use time::{Duration, OffsetDateTime};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use sensorhub_service::{AmqpPublisher, AppState, Config, api, cache};
use sensorhub_store::Store;
use sensorhub_types::{KeyDigest, generate_key};

/// Name of the sensor created by `testgen`.
const TESTGEN_SENSOR: &str = "test-sensor-1";
/// Measurements created by `testgen`.
const TESTGEN_COUNT: i32 = 1000;
/// Spacing of generated measurements.
const TESTGEN_INTERVAL: Duration = Duration::seconds(10);

/// Sensorhub - REST API for sensors, measurements and stats.
#[derive(Parser, Debug)]
#[command(name = "sensorhub")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long, global = true)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Broker host (overrides config).
    #[arg(long, global = true, env = "SENSORHUB_BROKER_HOST")]
    broker_host: Option<String>,

    /// Broker username (overrides config).
    #[arg(long, global = true, env = "SENSORHUB_BROKER_USER")]
    broker_user: Option<String>,

    /// Broker password (overrides config).
    #[arg(long, global = true, env = "SENSORHUB_BROKER_PASSWORD", hide_env_values = true)]
    broker_password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default behavior).
    Serve,

    /// Create the database schema and exit.
    InitDb,

    /// Replace the admin key and print the new one.
    Masterkey,

    /// Create a key for one sensor, replacing its previous key.
    Sensorkey {
        /// Sensor name.
        sensor: String,
    },

    /// Generate a test sensor with synthetic measurements.
    Testgen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sensorhub_service=info".parse()?)
                .add_directive("sensorhub=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::InitDb) => init_db(&config),
        Some(Command::Masterkey) => masterkey(&config),
        Some(Command::Sensorkey { sensor }) => sensorkey(&config, &sensor),
        Some(Command::Testgen) => testgen(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration, apply CLI overrides and validate the result.
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Override config with CLI args
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }
    if let Some(host) = &args.broker_host {
        config.broker.host = host.clone();
    }
    if let Some(user) = &args.broker_user {
        config.broker.username = Some(user.clone());
    }
    if let Some(password) = &args.broker_password {
        config.broker.password = Some(password.clone());
    }

    config.validate()?;
    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    info!("Opening database at {:?}", config.storage.path);
    Ok(Store::open(&config.storage.path)?)
}

fn init_db(config: &Config) -> anyhow::Result<()> {
    open_store(config)?;
    println!("Database ready at {}", config.storage.path.display());
    Ok(())
}

fn masterkey(config: &Config) -> anyhow::Result<()> {
    let mut store = open_store(config)?;
    let key = generate_key();

    let uow = store.begin()?;
    uow.replace_admin_key(&KeyDigest::of(&key))?;
    uow.commit()?;

    println!("{key}");
    Ok(())
}

fn sensorkey(config: &Config, sensor: &str) -> anyhow::Result<()> {
    let mut store = open_store(config)?;
    let key = generate_key();

    let uow = store.begin()?;
    let stored = uow
        .get_sensor(sensor)?
        .with_context(|| format!("Sensor not found: {sensor}"))?;
    uow.replace_sensor_key(stored.id, &KeyDigest::of(&key))?;
    uow.commit()?;

    println!("{key}");
    Ok(())
}

fn testgen(config: &Config) -> anyhow::Result<()> {
    let mut store = open_store(config)?;
    let mut rng = rand::rng();

    let uow = store.begin()?;
    let sensor = match uow.get_sensor(TESTGEN_SENSOR)? {
        Some(sensor) => sensor,
        None => uow.insert_sensor(TESTGEN_SENSOR, "testsensor")?,
    };

    let first = OffsetDateTime::now_utc().replace_nanosecond(0)? - TESTGEN_INTERVAL * TESTGEN_COUNT;
    let mut last = first;
    for i in 0..TESTGEN_COUNT {
        let value: f64 = rng.random_range(0.0..100.0);
        last = first + TESTGEN_INTERVAL * i;
        uow.insert_measurement(sensor.id, (value * 100.0).round() / 100.0, last)?;
    }

    let deployment = uow.insert_deployment("testgen", first, last)?;
    uow.attach_deployment(deployment.id, sensor.id)?;
    let total = uow.count_measurements(sensor.id)?;
    uow.commit()?;

    info!("Generated {} measurements for {}", TESTGEN_COUNT, TESTGEN_SENSOR);
    println!("{TESTGEN_SENSOR} now has {total} measurements");
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config)?;

    let cache = cache::from_config(&config.cache)?;
    let publisher = AmqpPublisher::from_config(&config.broker)?;

    // Parse bind address
    let addr: SocketAddr = config.server.bind.parse()?;

    // Create application state
    let state = AppState::new(store, config, Arc::from(cache), Arc::new(publisher));

    // Build the router
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", addr);

    // Run the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
