//! Process-wide log level control.
//!
//! The subscriber is installed once with its `EnvFilter` behind a reload
//! layer, so the level can be changed at runtime from any thread.

use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{EngineError, Result};

pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    directive: Mutex<String>,
}

static CONTROL: OnceLock<LogControl> = OnceLock::new();

/// Parse one of `trace`, `debug`, `info`, `warn`, `error` (any case).
pub fn parse_level(level: &str) -> Result<Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(EngineError::malformed(format!("unknown log level '{other}'"))),
    }
}

/// Install the global subscriber with the given filter directive (e.g.
/// `info,coffer_engine=debug`). Later calls return the existing control.
pub fn install(directive: &str) -> &'static LogControl {
    CONTROL.get_or_init(|| {
        let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
        let (layer, handle) = reload::Layer::new(filter);

        // another subscriber may already be set (tests, embedding hosts)
        if tracing_subscriber::registry()
            .with(layer)
            .with(fmt::layer().with_target(true))
            .try_init()
            .is_err()
        {
            tracing::debug!("global subscriber already set, log level changes are local");
        }

        LogControl {
            handle,
            directive: Mutex::new(directive.to_string()),
        }
    })
}

/// Install using `RUST_LOG` when set, otherwise `default_directive`.
pub fn install_from_env(default_directive: &str) -> &'static LogControl {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default_directive.to_string());
    install(&directive)
}

/// Change the process-wide log level, installing the subscriber if needed.
pub fn set_log_level(level: &str) -> Result<()> {
    let parsed = parse_level(level)?;
    let directive = parsed.to_string().to_ascii_lowercase();
    let control = install(&directive);
    control.set_directive(&directive)?;
    tracing::info!(level = %directive, "log level changed");
    Ok(())
}

/// Current filter directive, `None` before installation.
pub fn current_directive() -> Option<String> {
    CONTROL
        .get()
        .and_then(|c| c.directive.lock().ok().map(|d| d.clone()))
}

impl LogControl {
    fn set_directive(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive).map_err(EngineError::malformed)?;
        // the reload target is gone when a foreign subscriber won the install
        if let Err(e) = self.handle.reload(filter) {
            tracing::debug!(error = %e, "log filter not reloaded");
        }
        *self.directive.lock()? = directive.to_string();
        Ok(())
    }
}
