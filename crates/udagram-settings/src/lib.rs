//! # udagram-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`Settings::default()`]
//! 2. **User file**: `~/.udagram/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `UDAGRAM_*` overrides (highest priority)
//!
//! The loaded [`Settings`] value is handed to whoever needs it; there is no
//! global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
