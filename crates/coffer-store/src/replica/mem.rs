use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};

use super::{segments, Replica, ReplicaEntry, ReplicaResult};
use crate::error::ReplicaError;

#[derive(Debug, Clone)]
struct MemObject {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

type Namespace = Arc<Mutex<BTreeMap<String, MemObject>>>;

fn namespaces() -> &'static Mutex<HashMap<String, Namespace>> {
    static NAMESPACES: OnceLock<Mutex<HashMap<String, Namespace>>> = OnceLock::new();
    NAMESPACES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// In-process replica. Every `MemReplica` opened with the same name shares
/// the same objects for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct MemReplica {
    url: String,
    objects: Namespace,
}

impl MemReplica {
    pub fn open(url: &str, name: &str) -> Self {
        let objects = match namespaces().lock() {
            Ok(mut map) => map.entry(name.to_string()).or_default().clone(),
            // a poisoned registry still holds valid namespaces
            Err(poisoned) => poisoned
                .into_inner()
                .entry(name.to_string())
                .or_default()
                .clone(),
        };
        Self {
            url: url.to_string(),
            objects,
        }
    }

    fn key(name: &str) -> ReplicaResult<String> {
        let parts = segments(name)?;
        if parts.is_empty() {
            return Err(ReplicaError::InvalidName(name.to_string()));
        }
        Ok(parts.join("/"))
    }

    fn objects(&self) -> ReplicaResult<std::sync::MutexGuard<'_, BTreeMap<String, MemObject>>> {
        self.objects.lock().map_err(|_| ReplicaError::Poisoned)
    }
}

impl Replica for MemReplica {
    fn url(&self) -> &str {
        &self.url
    }

    fn read(&self, name: &str) -> ReplicaResult<Vec<u8>> {
        let key = Self::key(name)?;
        self.objects()?
            .get(&key)
            .map(|o| o.data.clone())
            .ok_or(ReplicaError::NotFound(key))
    }

    fn write(&self, name: &str, data: &[u8]) -> ReplicaResult<()> {
        let key = Self::key(name)?;
        self.objects()?.insert(
            key,
            MemObject {
                data: data.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn create_new(&self, name: &str, data: &[u8]) -> ReplicaResult<bool> {
        let key = Self::key(name)?;
        let mut objects = self.objects()?;
        if objects.contains_key(&key) {
            return Ok(false);
        }
        objects.insert(
            key,
            MemObject {
                data: data.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(true)
    }

    fn delete(&self, name: &str) -> ReplicaResult<()> {
        let key = Self::key(name)?;
        self.objects()?.remove(&key);
        Ok(())
    }

    fn list(&self, dir: &str) -> ReplicaResult<Vec<ReplicaEntry>> {
        let parts = segments(dir)?;
        let prefix = if parts.is_empty() {
            String::new()
        } else {
            format!("{}/", parts.join("/"))
        };

        let objects = self.objects()?;
        let mut entries: BTreeMap<String, ReplicaEntry> = BTreeMap::new();
        for (key, object) in objects.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    let entry = entries.entry(child.to_string()).or_insert(ReplicaEntry {
                        name: child.to_string(),
                        size: 0,
                        modified: object.modified,
                        is_dir: true,
                    });
                    entry.modified = entry.modified.max(object.modified);
                }
                None => {
                    entries.insert(
                        rest.to_string(),
                        ReplicaEntry {
                            name: rest.to_string(),
                            size: object.data.len() as u64,
                            modified: object.modified,
                            is_dir: false,
                        },
                    );
                }
            }
        }
        Ok(entries.into_values().collect())
    }

    fn stat(&self, name: &str) -> ReplicaResult<ReplicaEntry> {
        let key = Self::key(name)?;
        let last = key.rsplit('/').next().unwrap_or("").to_string();
        let objects = self.objects()?;
        if let Some(object) = objects.get(&key) {
            return Ok(ReplicaEntry {
                name: last,
                size: object.data.len() as u64,
                modified: object.modified,
                is_dir: false,
            });
        }
        let prefix = format!("{key}/");
        match objects.range(prefix.clone()..).next() {
            Some((child, object)) if child.starts_with(&prefix) => Ok(ReplicaEntry {
                name: last,
                size: 0,
                modified: object.modified,
                is_dir: true,
            }),
            _ => Err(ReplicaError::NotFound(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique() -> String {
        format!("mem-test-{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn namespaces_are_shared_by_name() {
        let name = unique();
        let a = MemReplica::open("mem://a", &name);
        let b = MemReplica::open("mem://a", &name);
        let other = MemReplica::open("mem://o", &unique());

        a.write("comm/groups/users/1", b"hi").unwrap();
        assert_eq!(b.read("comm/groups/users/1").unwrap(), b"hi");
        assert!(matches!(
            other.read("comm/groups/users/1"),
            Err(ReplicaError::NotFound(_))
        ));
    }

    #[test]
    fn list_direct_children() {
        let replica = MemReplica::open("mem://l", &unique());
        replica.write("db/users/1", b"a").unwrap();
        replica.write("db/users/2", b"bb").unwrap();
        replica.write("db/admin/1", b"c").unwrap();
        replica.write("dbx", b"d").unwrap();

        let top: Vec<(String, bool)> = replica
            .list("")
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        assert_eq!(top, vec![("db".to_string(), true), ("dbx".to_string(), false)]);

        let groups: Vec<String> = replica.list("db").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(groups, vec!["admin", "users"]);

        let users = replica.list("db/users").unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].size, 2);
        assert!(replica.stat("db").unwrap().is_dir);
        assert!(!replica.exists("db/none").unwrap());
    }

    #[test]
    fn create_new_and_delete() {
        let replica = MemReplica::open("mem://c", &unique());
        assert!(replica.create_new("manifest", b"x").unwrap());
        assert!(!replica.create_new("manifest", b"y").unwrap());
        replica.delete("manifest").unwrap();
        replica.delete("manifest").unwrap();
        assert!(!replica.exists("manifest").unwrap());
    }
}
