//! Replica storage.
//!
//! A replica is the shared copy of a safe: a flat namespace of objects named
//! by `/`-separated relative paths. Every member reads and writes the same
//! replica; all confidentiality comes from the envelopes stored in it.

mod local;
mod mem;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use local::LocalReplica;
pub use mem::MemReplica;

use crate::error::ReplicaError;

pub type ReplicaResult<T> = std::result::Result<T, ReplicaError>;

/// One object or sub-directory returned by [`Replica::list`] and
/// [`Replica::stat`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaEntry {
    /// Last path segment.
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

pub trait Replica: Send + Sync {
    /// URL this replica was opened from.
    fn url(&self) -> &str;

    fn read(&self, name: &str) -> ReplicaResult<Vec<u8>>;

    /// Create or overwrite an object.
    fn write(&self, name: &str, data: &[u8]) -> ReplicaResult<()>;

    /// Create an object only if it does not exist yet. Returns `false` when
    /// something already occupies the name.
    fn create_new(&self, name: &str, data: &[u8]) -> ReplicaResult<bool>;

    /// Remove an object; missing objects are not an error.
    fn delete(&self, name: &str) -> ReplicaResult<()>;

    /// Direct children of `dir`, sorted by name. A missing directory lists
    /// as empty.
    fn list(&self, dir: &str) -> ReplicaResult<Vec<ReplicaEntry>>;

    fn stat(&self, name: &str) -> ReplicaResult<ReplicaEntry>;

    fn exists(&self, name: &str) -> ReplicaResult<bool> {
        match self.stat(name) {
            Ok(_) => Ok(true),
            Err(ReplicaError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Open the replica a URL points to.
///
/// - `file:///abs/path` -- a directory tree on a local or mounted filesystem
/// - `mem://name`       -- an in-process namespace shared by every handle
///   opened with the same name
pub fn open_replica(url: &str) -> ReplicaResult<Arc<dyn Replica>> {
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(ReplicaError::UnsupportedUrl(url.to_string()));
        }
        return Ok(Arc::new(LocalReplica::open(url, path)?));
    }
    if let Some(name) = url.strip_prefix("mem://") {
        let name = name.trim_end_matches('/');
        if name.is_empty() {
            return Err(ReplicaError::UnsupportedUrl(url.to_string()));
        }
        return Ok(Arc::new(MemReplica::open(url, name)));
    }
    Err(ReplicaError::UnsupportedUrl(url.to_string()))
}

/// Split an object name into validated segments.
pub(crate) fn segments(name: &str) -> ReplicaResult<Vec<&str>> {
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = trimmed.split('/').collect();
    for part in &parts {
        if part.is_empty() || *part == "." || *part == ".." || part.contains('\\') {
            return Err(ReplicaError::InvalidName(name.to_string()));
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_schemes() {
        assert!(open_replica("mem://scheme-test").is_ok());
        assert!(matches!(
            open_replica("s3://bucket/x"),
            Err(ReplicaError::UnsupportedUrl(_))
        ));
        assert!(matches!(
            open_replica("mem://"),
            Err(ReplicaError::UnsupportedUrl(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        let replica = open_replica(&url).unwrap();
        assert_eq!(replica.url(), url);
    }

    #[test]
    fn names_are_validated() {
        assert_eq!(segments("a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(segments("/a/").unwrap(), vec!["a"]);
        assert!(segments("").unwrap().is_empty());
        assert!(segments("a/../b").is_err());
        assert!(segments("a//b").is_err());
        assert!(segments("a\\b").is_err());
    }
}
