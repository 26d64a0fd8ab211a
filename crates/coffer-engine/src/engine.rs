//! Process-scoped engine context.
//!
//! The [`Engine`] owns the handle registry, the engine configuration and the
//! memo of the default catalog. Hosts either build one explicitly
//! (`Engine::new`) or install a single process-wide instance once
//! (`Engine::install`) and reach it through `Engine::global`.

use std::sync::{Arc, Mutex, OnceLock};

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::registry::{Handle, Registry, Resource};

pub struct Engine {
    config: Arc<EngineConfig>,
    registry: Registry,
    /// Handle of the default catalog, once opened.
    default_catalog: Mutex<Option<Handle>>,
}

static GLOBAL: OnceLock<Engine> = OnceLock::new();

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Registry::new(),
            default_catalog: Mutex::new(None),
        }
    }

    /// Set the process-wide engine. Only the first call takes effect; later
    /// calls return the installed instance.
    pub fn install(config: EngineConfig) -> &'static Engine {
        GLOBAL.get_or_init(|| {
            tracing::debug!(?config, "engine installed");
            Self::new(config)
        })
    }

    /// The process-wide engine, installed from the environment on first use.
    pub fn global() -> &'static Engine {
        GLOBAL.get_or_init(|| Self::new(EngineConfig::from_env()))
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle of the default catalog. Repeated calls return the same handle
    /// until it is closed.
    pub fn default_catalog(&self) -> Result<Handle> {
        let mut memo = self.default_catalog.lock()?;
        if let Some(handle) = *memo {
            if self.registry.catalog(handle).is_ok() {
                return Ok(handle);
            }
        }

        let catalog = Catalog::open_default(&self.config)?;
        let handle = self.registry.insert(Resource::Catalog(Arc::new(catalog)), None)?;
        *memo = Some(handle);
        tracing::info!(handle, "default catalog opened");
        Ok(handle)
    }
}
