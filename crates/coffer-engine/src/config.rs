//! Engine configuration loaded from environment variables.
//!
//! All settings have defaults so the engine runs with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use coffer_shared::constants::{DEFAULT_MAX_FILE_SIZE, DEFAULT_ZIP_THRESHOLD};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the default catalog.
    /// Env: `COFFER_CATALOG`
    /// Default: platform config directory (see `Database::default_path`).
    pub catalog_path: Option<PathBuf>,

    /// Files below this size are deflated when `zip` is requested.
    /// Env: `COFFER_ZIP_THRESHOLD`
    /// Default: 64 MiB
    pub zip_threshold: u64,

    /// Largest accepted file body.
    /// Env: `COFFER_MAX_FILE_SIZE`
    /// Default: 256 MiB
    pub max_file_size: u64,

    /// Lifetime of decrypted content in the local cache.
    /// Env: `COFFER_CACHE_EXPIRE_SECS`
    /// Default: 3600
    pub cache_expire: Duration,

    /// Upper bound for a database `sync`.
    /// Env: `COFFER_SYNC_TIMEOUT_SECS`
    /// Default: 30
    pub sync_timeout: Duration,

    /// Initial log level.
    /// Env: `COFFER_LOG`
    /// Default: `info`
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            zip_threshold: DEFAULT_ZIP_THRESHOLD,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            cache_expire: Duration::from_secs(3600),
            sync_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("COFFER_CATALOG") {
            if !path.is_empty() {
                config.catalog_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("COFFER_ZIP_THRESHOLD") {
            match val.parse::<u64>() {
                Ok(n) => config.zip_threshold = n,
                Err(_) => tracing::warn!(value = %val, "Invalid COFFER_ZIP_THRESHOLD, using default"),
            }
        }

        if let Some(val) = lookup("COFFER_MAX_FILE_SIZE") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.max_file_size = n,
                _ => tracing::warn!(value = %val, "Invalid COFFER_MAX_FILE_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("COFFER_CACHE_EXPIRE_SECS") {
            match val.parse::<u64>() {
                Ok(n) => config.cache_expire = Duration::from_secs(n),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid COFFER_CACHE_EXPIRE_SECS, using default")
                }
            }
        }

        if let Some(val) = lookup("COFFER_SYNC_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.sync_timeout = Duration::from_secs(n),
                _ => tracing::warn!(value = %val, "Invalid COFFER_SYNC_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(level) = lookup("COFFER_LOG") {
            if crate::logging::parse_level(&level).is_ok() {
                config.log_level = level.trim().to_ascii_lowercase();
            } else {
                tracing::warn!(value = %level, "Invalid COFFER_LOG, using default");
            }
        }

        config
    }
}
