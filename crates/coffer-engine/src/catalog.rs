//! Catalogs: the local registry of identities and known safes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use coffer_shared::{Identity, IdentityId};
use coffer_store::{Database, SafeRecord, StoredIdentity};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

const CURRENT_IDENTITY_KEY: &str = "current_identity";
const ADAPTIVE_CAP: u32 = 16;

/// How a catalog is opened and how often views refresh from replicas.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogOptions {
    /// Create the catalog file when it does not exist.
    pub force_create: bool,
    /// Minimum time between two refreshes of the same replica area; zero
    /// refreshes on every call.
    #[serde(with = "duration_secs")]
    pub sync_period: Duration,
    /// Double the period after a refresh that found nothing new, up to 16x.
    pub adaptive_sync: bool,
}

pub struct Catalog {
    path: PathBuf,
    db: Mutex<Database>,
    options: CatalogOptions,
    closed: AtomicBool,
}

impl Catalog {
    /// Open a catalog file. A missing file is `NotFound` unless
    /// `force_create` is set.
    pub fn open(path: &Path, options: CatalogOptions) -> Result<Self> {
        let db = if options.force_create {
            Database::open_at(path)?
        } else {
            Database::open_existing(path)
                .map_err(|_| EngineError::not_found(format!("catalog {}", path.display())))?
        };

        tracing::debug!(path = %path.display(), sync_period = ?options.sync_period, "catalog opened");
        Ok(Self {
            path: path.to_path_buf(),
            db: Mutex::new(db),
            options,
            closed: AtomicBool::new(false),
        })
    }

    /// Open (creating if needed) the catalog at the configured default path.
    pub fn open_default(config: &EngineConfig) -> Result<Self> {
        let path = match &config.catalog_path {
            Some(path) => path.clone(),
            None => Database::default_path()?,
        };
        Self::open(
            &path,
            CatalogOptions {
                force_create: true,
                ..Default::default()
            },
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    /// Directory next to the catalog file that holds caches and per-group
    /// databases.
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir().join("cache")
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.dir().join("db")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::Aborted);
        }
        Ok(())
    }

    /// Lock the catalog database.
    pub fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.ensure_open()?;
        Ok(self.db.lock()?)
    }

    /// Flush and mark closed. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(db) = self.db.lock() {
            if let Err(e) = db.checkpoint() {
                tracing::warn!(error = %e, "catalog checkpoint failed");
            }
        }
        tracing::debug!(path = %self.path.display(), "catalog closed");
    }

    // -- identities ---------------------------------------------------------

    /// Store an identity, including its private material when present.
    pub fn save_identity(&self, identity: &Identity) -> Result<()> {
        self.db()?.upsert_identity(&StoredIdentity {
            id: identity.id().clone(),
            nick: identity.nick().to_string(),
            private_material: identity.private_material(),
            created_at: Utc::now(),
        })?;
        Ok(())
    }

    /// Record a peer seen in a safe.
    pub fn remember(&self, id: &IdentityId) -> Result<()> {
        self.db()?.remember_identity(id)?;
        Ok(())
    }

    /// Public-only identity from the catalog's directory.
    pub fn lookup_public(&self, id: &IdentityId) -> Result<Identity> {
        let stored = self
            .db()?
            .find_identity(id)?
            .ok_or_else(|| EngineError::not_found(format!("identity {id}")))?;
        Ok(Identity::public_only(&stored.id)?)
    }

    /// An own identity with its private material.
    pub fn load_identity(&self, id: &IdentityId) -> Result<Identity> {
        let stored = self
            .db()?
            .find_identity(id)?
            .ok_or_else(|| EngineError::not_found(format!("identity {id}")))?;
        let private = stored
            .private_material
            .ok_or_else(|| EngineError::denied(format!("no private key for {id}")))?;
        let identity = Identity::from_private(&stored.nick, &private)?;
        if identity.id() != id {
            return Err(EngineError::malformed(format!("stored key does not match {id}")));
        }
        Ok(identity)
    }

    pub fn identities(&self) -> Result<Vec<StoredIdentity>> {
        Ok(self.db()?.list_identities()?)
    }

    pub fn current_identity(&self) -> Result<Option<IdentityId>> {
        Ok(self.db()?.get_setting(CURRENT_IDENTITY_KEY)?.map(IdentityId))
    }

    pub fn set_current_identity(&self, id: &IdentityId) -> Result<()> {
        self.db()?.set_setting(CURRENT_IDENTITY_KEY, id.as_str())?;
        Ok(())
    }

    // -- safes --------------------------------------------------------------

    pub fn list_safes(&self) -> Result<Vec<SafeRecord>> {
        Ok(self.db()?.list_safes()?)
    }

    // -- refresh policy -----------------------------------------------------

    /// Whether `area` of a safe should be refreshed from its replica now.
    pub fn refresh_due(&self, safe_url: &str, area: &str) -> Result<bool> {
        if self.options.sync_period.is_zero() {
            return Ok(true);
        }
        let Some(mark) = self.db()?.get_sync_mark(safe_url, area)? else {
            return Ok(true);
        };
        let elapsed = Utc::now()
            .signed_duration_since(mark.refreshed_at)
            .num_milliseconds()
            .max(0) as u64;
        Ok(elapsed >= mark.period_ms)
    }

    /// Record a refresh. With adaptive sync an unchanged refresh doubles the
    /// period, a change resets it.
    pub fn mark_refreshed(&self, safe_url: &str, area: &str, changed: bool) -> Result<()> {
        let base = self.options.sync_period.as_millis() as u64;
        let db = self.db()?;
        let period = match db.get_sync_mark(safe_url, area)? {
            Some(mark) if self.options.adaptive_sync && !changed => mark
                .period_ms
                .max(base)
                .saturating_mul(2)
                .min(base.saturating_mul(ADAPTIVE_CAP as u64)),
            _ => base,
        };
        db.set_sync_mark(safe_url, area, Utc::now(), period)?;
        Ok(())
    }

    /// Force the next `refresh_due` for `area` to be true.
    pub fn invalidate(&self, safe_url: &str, area: &str) -> Result<()> {
        self.db()?.set_sync_mark(safe_url, area, chrono::DateTime::<Utc>::default(), 0)?;
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("period must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
