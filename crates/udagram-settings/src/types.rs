//! Typed settings tree. Every section deserializes with `default`, so a
//! partial JSON file only needs the keys it overrides.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broadcast: BroadcastSettings,
    pub storage: StorageSettings,
    pub signing: SigningSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        if self.broadcast.max_concurrency == 0 {
            return Err(SettingsError::InvalidValue(
                "broadcast.maxConcurrency must be at least 1".into(),
            ));
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxSendQueue must be at least 1".into(),
            ));
        }
        if self.server.event_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.eventQueueCapacity must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalSecs must be at least 1".into(),
            ));
        }
        if self.signing.base_url.is_empty() {
            return Err(SettingsError::InvalidValue("signing.baseUrl is empty".into()));
        }
        Ok(())
    }
}

/// Connection hosting.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound queue depth.
    pub max_send_queue: usize,
    /// WebSocket ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Upload events buffered ahead of the broadcaster.
    pub event_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            event_queue_capacity: 1024,
        }
    }
}

/// Fan-out behavior of one broadcast cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BroadcastSettings {
    /// Delivery attempts in flight at once.
    pub max_concurrency: usize,
    /// Per-attempt deadline; a timed-out attempt counts as transient.
    pub delivery_timeout_ms: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            delivery_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Connection registry database, relative to `~/.udagram` unless absolute.
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "connections.db".to_string(),
        }
    }
}

/// Read URLs for uploaded images.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SigningSettings {
    /// Base URL objects are served from.
    pub base_url: String,
    /// Empty secret means plain public URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub url_expiration_secs: u64,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            base_url: "https://udagram-images-dev.s3.amazonaws.com".to_string(),
            secret: None,
            url_expiration_secs: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level name (`trace` .. `error`). `RUST_LOG` wins when set.
    pub level: String,
    pub log_to_sqlite: bool,
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: "logs.db".to_string(),
        }
    }
}
