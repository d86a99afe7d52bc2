//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::Settings;

/// Resolve the path to the settings file (`~/.udagram/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".udagram").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `UDAGRAM_*` overrides. `lookup` resolves a variable name.
///
/// Numbers must parse and sit inside their range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Anything else is
/// logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("UDAGRAM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("UDAGRAM_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64_in("UDAGRAM_MAX_SEND_QUEUE", 1, 1_000_000) {
        settings.server.max_send_queue = v as usize;
    }
    if let Some(v) = env.u64_in("UDAGRAM_HEARTBEAT_INTERVAL_SECS", 1, 3_600) {
        settings.server.heartbeat_interval_secs = v;
    }

    // ── Broadcast ───────────────────────────────────────────────────
    if let Some(v) = env.u64_in("UDAGRAM_MAX_CONCURRENCY", 1, 10_000) {
        settings.broadcast.max_concurrency = v as usize;
    }
    if let Some(v) = env.u64_in("UDAGRAM_DELIVERY_TIMEOUT_MS", 10, 600_000) {
        settings.broadcast.delivery_timeout_ms = v;
    }

    // ── Storage / signing / logging ─────────────────────────────────
    if let Some(v) = env.string("UDAGRAM_DATABASE_PATH") {
        settings.storage.database_path = v;
    }
    if let Some(v) = env.string("UDAGRAM_IMAGES_BASE_URL") {
        settings.signing.base_url = v;
    }
    if let Some(v) = env.string("UDAGRAM_SIGNING_SECRET") {
        settings.signing.secret = Some(v);
    }
    if let Some(v) = env.u64_in("UDAGRAM_SIGNED_URL_EXPIRATION", 1, 604_800) {
        settings.signing.url_expiration_secs = v;
    }
    if let Some(v) = env.string("UDAGRAM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("UDAGRAM_LOG_TO_SQLITE") {
        settings.logging.log_to_sqlite = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim()
        .parse::<u64>()
        .ok()
        .filter(|n| (min..=max).contains(n))
}
