use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use coffer_shared::types::next_snowflake;

use super::{segments, Replica, ReplicaEntry, ReplicaResult};
use crate::error::ReplicaError;

const TEMP_PREFIX: &str = ".tmp-";

/// Replica stored as a directory tree.
#[derive(Debug, Clone)]
pub struct LocalReplica {
    url: String,
    base: PathBuf,
}

impl LocalReplica {
    pub fn open(url: &str, base: impl AsRef<Path>) -> ReplicaResult<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        tracing::debug!(path = %base.display(), "local replica opened");
        Ok(Self {
            url: url.to_string(),
            base: base.canonicalize().unwrap_or(base),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve an object name below the base directory, rejecting anything
    /// that would escape it.
    fn resolve(&self, name: &str) -> ReplicaResult<PathBuf> {
        let mut resolved = self.base.clone();
        for segment in segments(name)? {
            for component in Path::new(segment).components() {
                match component {
                    Component::Normal(c) => resolved.push(c),
                    _ => return Err(ReplicaError::InvalidName(name.to_string())),
                }
            }
        }
        if !resolved.starts_with(&self.base) {
            return Err(ReplicaError::InvalidName(name.to_string()));
        }
        Ok(resolved)
    }

    fn entry(name: String, meta: &fs::Metadata) -> ReplicaEntry {
        let modified: DateTime<Utc> = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        ReplicaEntry {
            name,
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified,
            is_dir: meta.is_dir(),
        }
    }
}

impl Replica for LocalReplica {
    fn url(&self) -> &str {
        &self.url
    }

    fn read(&self, name: &str) -> ReplicaResult<Vec<u8>> {
        let path = self.resolve(name)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ReplicaError::NotFound(name.to_string()),
            _ => ReplicaError::Io(e),
        })
    }

    fn write(&self, name: &str, data: &[u8]) -> ReplicaResult<()> {
        let path = self.resolve(name)?;
        let parent = path
            .parent()
            .ok_or_else(|| ReplicaError::InvalidName(name.to_string()))?;
        fs::create_dir_all(parent)?;

        // write-then-rename so readers never see a partial object
        let temp = parent.join(format!("{TEMP_PREFIX}{}", next_snowflake()));
        fs::write(&temp, data)?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        tracing::trace!(name, size = data.len(), "replica object written");
        Ok(())
    }

    fn create_new(&self, name: &str, data: &[u8]) -> ReplicaResult<bool> {
        use std::io::Write;

        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(data)?;
        file.sync_all()?;
        Ok(true)
    }

    fn delete(&self, name: &str) -> ReplicaResult<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, dir: &str) -> ReplicaResult<Vec<ReplicaEntry>> {
        let path = self.resolve(dir)?;
        let reader = match fs::read_dir(&path) {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in reader {
            let item = item?;
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let meta = item.metadata()?;
            entries.push(Self::entry(name, &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn stat(&self, name: &str) -> ReplicaResult<ReplicaEntry> {
        let path = self.resolve(name)?;
        let meta = fs::metadata(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ReplicaError::NotFound(name.to_string()),
            _ => ReplicaError::Io(e),
        })?;
        let last = name.trim_matches('/').rsplit('/').next().unwrap_or("").to_string();
        Ok(Self::entry(last, &meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica() -> (tempfile::TempDir, LocalReplica) {
        let dir = tempfile::tempdir().unwrap();
        let replica = LocalReplica::open("file://test", dir.path()).unwrap();
        (dir, replica)
    }

    #[test]
    fn write_read_list_delete() {
        let (_dir, replica) = replica();
        replica.write("fs/headers/1", b"one").unwrap();
        replica.write("fs/headers/2", b"two").unwrap();
        replica.write("fs/bodies/9", b"body").unwrap();

        assert_eq!(replica.read("fs/headers/1").unwrap(), b"one");
        let names: Vec<String> = replica
            .list("fs/headers")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["1", "2"]);

        let top = replica.list("fs").unwrap();
        assert!(top.iter().all(|e| e.is_dir));

        replica.delete("fs/headers/1").unwrap();
        replica.delete("fs/headers/1").unwrap();
        assert!(matches!(
            replica.read("fs/headers/1"),
            Err(ReplicaError::NotFound(_))
        ));
        assert!(replica.list("missing").unwrap().is_empty());
    }

    #[test]
    fn create_new_only_once() {
        let (_dir, replica) = replica();
        assert!(replica.create_new("manifest", b"a").unwrap());
        assert!(!replica.create_new("manifest", b"b").unwrap());
        assert_eq!(replica.read("manifest").unwrap(), b"a");
        assert!(replica.exists("manifest").unwrap());
        assert_eq!(replica.stat("manifest").unwrap().size, 1);
    }

    #[test]
    fn rejects_path_traversal() {
        let (_dir, replica) = replica();
        assert!(matches!(
            replica.write("../escape", b"x"),
            Err(ReplicaError::InvalidName(_))
        ));
        assert!(matches!(
            replica.read("a/../../etc/passwd"),
            Err(ReplicaError::InvalidName(_))
        ));
    }
}
