//! Catalog connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// File name of the catalog inside its directory.
pub const CATALOG_FILE: &str = "catalog.db";

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    /// Path of the default catalog.
    ///
    /// The file is placed in the platform-appropriate config directory:
    /// - Linux:   `~/.config/coffer/catalog.db`
    /// - macOS:   `~/Library/Application Support/org.coffer.coffer/catalog.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\coffer\coffer\config\catalog.db`
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("org", "coffer", "coffer").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.config_dir().join(CATALOG_FILE))
    }

    /// Open (or create) a catalog at an explicit path, creating parent
    /// directories as needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening catalog");
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing catalog; `NotFound` when the file is missing.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StoreError::NotFound);
        }
        Self::open_at(path)
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for transactions or ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the catalog file, its cache and per-group databases.
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Flush the WAL into the main file.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}
