use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use jiff::Timestamp;
use oilwatch_core::DeviceId;
use oilwatch_ingest::{
    IngestClient,
    broker::mqtt::MqttTransport,
    config::{Config, StorageConfig},
    publish::{CommandPublisher, DeviceConfig, MqttCommandPublisher},
    query,
    storage::{DeviceStorage, HistoryQuery, memory::MemoryStorage, sqlite::SqliteStorage},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "oilwatch-ingest")]
#[command(about = "Oilwatch telemetry ingestion")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "oilwatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to device telemetry (default)
    Run,
    /// Send new settings to one device
    Configure {
        /// Device name as it appears in telemetry topics
        device: String,
        /// Settings as JSON, e.g. '{"tankHeight":120,"lowLevelAlert":10}'
        settings: String,
    },
    /// Print every device with its latest level and position as JSON
    Devices,
    /// Print the level history and position track of one device as JSON
    History {
        device: String,
        /// Maximum number of readings, oldest first
        #[arg(long, default_value_t = HistoryQuery::DEFAULT_LIMIT)]
        limit: usize,
        /// Earliest reading time, e.g. 2024-06-01T00:00:00Z
        #[arg(long)]
        since: Option<Timestamp>,
        /// Latest reading time
        #[arg(long)]
        until: Option<Timestamp>,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };
    config.apply_env();

    let command = cli.command.unwrap_or(Command::Run);

    match config.storage.clone() {
        StorageConfig::Memory => {
            info!("Using in-memory device storage");
            execute(command, MemoryStorage::new(), config).await?;
        }
        StorageConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite device storage");
            let storage = SqliteStorage::new(&path).await?;
            execute(command, storage, config).await?;
        }
    }

    Ok(())
}

async fn execute<S: DeviceStorage>(
    command: Command,
    storage: S,
    config: Config,
) -> color_eyre::Result<()> {
    match command {
        Command::Run => run(storage, config).await,
        Command::Configure { device, settings } => {
            configure(storage, &config, &device, &settings).await
        }
        Command::Devices => {
            let summaries = query::device_summaries(&storage).await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            Ok(())
        }
        Command::History {
            device,
            limit,
            since,
            until,
        } => {
            let window = HistoryQuery {
                limit: if limit == 0 { HistoryQuery::DEFAULT_LIMIT } else { limit },
                start: since,
                end: until,
            };
            let id = DeviceId::new(device);
            let history = query::device_history(&storage, &id, &window)
                .await?
                .ok_or_else(|| eyre!("device {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
    }
}

async fn run<S: DeviceStorage>(storage: S, config: Config) -> color_eyre::Result<()> {
    config.broker.validate()?;

    let transport = MqttTransport::new(config.broker.endpoint());
    let client = Arc::new(IngestClient::new(
        transport,
        storage,
        config.client_settings(),
    ));
    let cancel = CancellationToken::new();

    client.connect(&cancel).await?;

    let mut receive_loop = tokio::spawn({
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        async move { client.run(cancel).await }
    });

    let app = Router::new().route("/health", get(health_handler));
    let listener = TcpListener::bind(config.server.http_addr).await?;
    info!(http_addr = %config.server.http_addr, "HTTP server listening");

    let http_cancel = cancel.clone();
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            None
        }
        result = &mut receive_loop => Some(result),
    };

    cancel.cancel();

    let shutdown = {
        let client = Arc::clone(&client);
        async move {
            client.close().await;
            match finished {
                Some(result) => result,
                None => receive_loop.await,
            }
        }
    };

    let outcome = match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
        Ok(outcome) => Some(outcome),
        Err(_) => {
            warn!("Shutdown timed out, exiting anyway");
            None
        }
    };

    if let Err(e) = http.await? {
        error!(error = ?e, "HTTP server error");
    }
    info!("HTTP server shut down");

    if let Some(outcome) = outcome {
        outcome??;
    }
    info!("Ingestion stopped");
    Ok(())
}

async fn configure<S: DeviceStorage>(
    storage: S,
    config: &Config,
    device: &str,
    settings: &str,
) -> color_eyre::Result<()> {
    config.publisher.validate()?;

    let settings: DeviceConfig = serde_json::from_str(settings)?;
    let payload = serde_json::to_value(&settings)?;
    let product_key = &config.publisher.product_key;

    let publisher = MqttCommandPublisher::connect(
        &config.publisher.endpoint(),
        &config.broker.signer(),
        product_key,
    )
    .await?;
    publisher.publish(product_key, device, &payload).await?;
    publisher.disconnect().await;

    // The device already has the command; a local write failure is not fatal.
    let id = DeviceId::new(device);
    if let Err(e) = storage.create_device_if_absent(&id).await {
        warn!(device_id = %id, error = %e, "failed to create device record");
    }
    if let Err(e) = storage.update_alert_config(&id, settings.alerts()).await {
        warn!(device_id = %id, error = %e, "failed to store alert config");
    }

    info!(device_id = %id, "Configuration sent, restart the device to apply it");
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}
