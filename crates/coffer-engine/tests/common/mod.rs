#![allow(dead_code)]

use std::sync::Arc;

use coffer_engine::{Catalog, CatalogOptions, EngineConfig, Safe, SafeSettings};
use coffer_shared::Identity;

/// One device: its own catalog directory and identity.
pub struct Member {
    pub dir: tempfile::TempDir,
    pub catalog: Arc<Catalog>,
    pub identity: Identity,
}

impl Member {
    pub fn new(nick: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let options = CatalogOptions {
            force_create: true,
            ..Default::default()
        };
        let catalog = Arc::new(Catalog::open(&dir.path().join("catalog.db"), options).unwrap());
        Self {
            dir,
            catalog,
            identity: Identity::create(nick).unwrap(),
        }
    }

    /// Another identity on the same device, sharing this member's catalog.
    pub fn sharing(&self, nick: &str) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            catalog: self.catalog.clone(),
            identity: Identity::create(nick).unwrap(),
        }
    }

    pub fn create(&self, url: &str) -> coffer_engine::Result<Arc<Safe>> {
        self.create_with(url, &SafeSettings::default(), config())
    }

    pub fn create_with(
        &self,
        url: &str,
        settings: &SafeSettings,
        config: Arc<EngineConfig>,
    ) -> coffer_engine::Result<Arc<Safe>> {
        Safe::create(self.catalog.clone(), &self.identity, url, settings, config).map(Arc::new)
    }

    pub fn open(&self, url: &str) -> coffer_engine::Result<Arc<Safe>> {
        Safe::open(self.catalog.clone(), &self.identity, url, config()).map(Arc::new)
    }
}

pub fn config() -> Arc<EngineConfig> {
    Arc::new(EngineConfig::default())
}

pub fn mem_url() -> String {
    format!("mem://test-{}", uuid::Uuid::new_v4())
}
