//! # udagram
//!
//! Upload notification server: hosts WebSocket connections, records them in
//! the connection registry and pushes an `image_uploaded` frame to each one
//! when storage reports a new object.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use udagram_core::{PresignedUrlSigner, PublicUrlSigner, UrlSigner};
use udagram_server::{BroadcastConfig, ServerConfig};
use udagram_settings::{Settings, SigningSettings};
use udagram_store::{ConnectionRepo, Database};
use udagram_telemetry::{data_dir, init_telemetry, TelemetryConfig};

/// Udagram upload notification server.
#[derive(Parser, Debug)]
#[command(name = "udagram", about = "Udagram upload notification server")]
struct Cli {
    /// Settings file (defaults to `~/.udagram/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to bind (0 for auto-assign). Overrides settings.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the connection registry database. Overrides settings.
    #[arg(long)]
    database: Option<PathBuf>,
}

impl Cli {
    fn load_settings(&self) -> Result<Settings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(udagram_settings::settings_path);
        let mut settings = udagram_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref database) = self.database {
            settings.storage.database_path = database.display().to_string();
        }
        Ok(settings)
    }
}

/// Relative paths live under `~/.udagram`.
fn resolve_data_path(raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir().join(path)
    }
}

fn build_signer(signing: &SigningSettings) -> Arc<dyn UrlSigner> {
    match signing.secret.as_deref() {
        Some(secret) if !secret.is_empty() => Arc::new(PresignedUrlSigner::new(
            signing.base_url.clone(),
            secret,
            Duration::from_secs(signing.url_expiration_secs),
        )),
        _ => Arc::new(PublicUrlSigner::new(signing.base_url.clone())),
    }
}

fn server_config(settings: &Settings) -> ServerConfig {
    ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_send_queue: settings.server.max_send_queue,
        heartbeat_interval: Duration::from_secs(settings.server.heartbeat_interval_secs),
        event_queue_capacity: settings.server.event_queue_capacity,
        broadcast: BroadcastConfig {
            max_concurrency: settings.broadcast.max_concurrency,
            delivery_timeout: Duration::from_millis(settings.broadcast.delivery_timeout_ms),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let log_level = Level::from_str(&settings.logging.level).ok();
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: log_level.unwrap_or(Level::INFO),
        module_levels: Vec::new(),
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: resolve_data_path(&settings.logging.log_db_path),
    });
    if log_level.is_none() {
        tracing::warn!(level = %settings.logging.level, "unknown log level, using info");
    }

    tracing::info!("Starting Udagram notification server");

    let db_path = resolve_data_path(&settings.storage.database_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Database opened");

    let store = Arc::new(ConnectionRepo::new(db));
    let signer = build_signer(&settings.signing);

    let handle = udagram_server::start(server_config(&settings), store, signer, telemetry.metrics())
        .await
        .context("Failed to start server")?;

    tracing::info!(port = handle.port, "Udagram server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("Shutting down...");
    handle.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
