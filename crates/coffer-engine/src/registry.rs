//! Handle registry.
//!
//! Every resource that crosses the boundary lives in a slot of this arena
//! and is referred to by an opaque `u64` handle: the upper 32 bits carry the
//! slot generation, the lower 32 bits the slot index. A slot's generation is
//! bumped whenever it is freed, so a stale handle never resolves to a newer
//! resource that reused the slot. Handle `0` is never issued.

use std::sync::{Arc, Mutex};

use crate::catalog::Catalog;
use crate::cursor::Cursor;
use crate::db::DbView;
use crate::error::{EngineError, Result};
use crate::fs::FsView;
use crate::messaging::CommView;
use crate::safe::Safe;

pub type Handle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Catalog,
    Safe,
    Filesystem,
    Database,
    Cursor,
    Messaging,
}

#[derive(Clone)]
pub enum Resource {
    Catalog(Arc<Catalog>),
    Safe(Arc<Safe>),
    Filesystem(Arc<FsView>),
    Database(Arc<DbView>),
    Cursor(Arc<Cursor>),
    Messaging(Arc<CommView>),
}

impl Resource {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Catalog(_) => Kind::Catalog,
            Self::Safe(_) => Kind::Safe,
            Self::Filesystem(_) => Kind::Filesystem,
            Self::Database(_) => Kind::Database,
            Self::Cursor(_) => Kind::Cursor,
            Self::Messaging(_) => Kind::Messaging,
        }
    }

    /// Mark the resource closed so in-flight operations abort, and release
    /// what it owns.
    fn shutdown(&self) {
        match self {
            Self::Catalog(c) => c.close(),
            Self::Safe(s) => s.close(),
            Self::Filesystem(f) => f.close(),
            Self::Database(d) => d.close(),
            Self::Cursor(c) => c.close(),
            Self::Messaging(m) => m.close(),
        }
    }
}

struct Entry {
    resource: Resource,
    parent: Option<Handle>,
    children: Vec<Handle>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Slots {
    fn entry(&self, handle: Handle) -> Option<&Entry> {
        let (generation, index) = split(handle);
        self.slots
            .get(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        let (generation, index) = split(handle);
        self.slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    // Free the slot and return its entry; the generation moves on so the
    // handle can never resolve again.
    fn take(&mut self, handle: Handle) -> Option<Entry> {
        let (generation, index) = split(handle);
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let entry = slot.entry.take()?;
        // a slot whose generation is exhausted is retired
        if let Some(next) = slot.generation.checked_add(1) {
            slot.generation = next;
            self.free.push(index);
        }
        Some(entry)
    }
}

/// Process-wide table of live resources.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Slots>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource, optionally as the child of `parent`. Fails with
    /// `InvalidHandle` when the parent is no longer live.
    pub fn insert(&self, resource: Resource, parent: Option<Handle>) -> Result<Handle> {
        let mut slots = self.inner.lock()?;
        if let Some(parent) = parent {
            if slots.entry(parent).is_none() {
                return Err(EngineError::InvalidHandle(parent));
            }
        }

        let kind = resource.kind();
        let entry = Entry {
            resource,
            parent,
            children: Vec::new(),
        };
        let handle = match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.slots[index as usize];
                slot.entry = Some(entry);
                join(slot.generation, index)
            }
            None => {
                let index = u32::try_from(slots.slots.len())
                    .map_err(|_| EngineError::malformed("handle table full"))?;
                slots.slots.push(Slot {
                    generation: 1,
                    entry: Some(entry),
                });
                join(1, index)
            }
        };

        if let Some(parent) = parent {
            if let Some(parent_entry) = slots.entry_mut(parent) {
                parent_entry.children.push(handle);
            }
        }

        tracing::trace!(handle, ?kind, ?parent, "handle opened");
        Ok(handle)
    }

    pub fn resolve(&self, handle: Handle) -> Result<Resource> {
        let slots = self.inner.lock()?;
        slots
            .entry(handle)
            .map(|e| e.resource.clone())
            .ok_or(EngineError::InvalidHandle(handle))
    }

    /// Resolve and check the kind; a handle of another kind is an
    /// `InvalidHandle`, never a silent success.
    pub fn resolve_kind(&self, handle: Handle, kind: Kind) -> Result<Resource> {
        let resource = self.resolve(handle)?;
        if resource.kind() != kind {
            return Err(EngineError::InvalidHandle(handle));
        }
        Ok(resource)
    }

    pub fn catalog(&self, handle: Handle) -> Result<Arc<Catalog>> {
        match self.resolve_kind(handle, Kind::Catalog)? {
            Resource::Catalog(c) => Ok(c),
            _ => Err(EngineError::InvalidHandle(handle)),
        }
    }

    pub fn safe(&self, handle: Handle) -> Result<Arc<Safe>> {
        match self.resolve_kind(handle, Kind::Safe)? {
            Resource::Safe(s) => Ok(s),
            _ => Err(EngineError::InvalidHandle(handle)),
        }
    }

    pub fn filesystem(&self, handle: Handle) -> Result<Arc<FsView>> {
        match self.resolve_kind(handle, Kind::Filesystem)? {
            Resource::Filesystem(f) => Ok(f),
            _ => Err(EngineError::InvalidHandle(handle)),
        }
    }

    pub fn database(&self, handle: Handle) -> Result<Arc<DbView>> {
        match self.resolve_kind(handle, Kind::Database)? {
            Resource::Database(d) => Ok(d),
            _ => Err(EngineError::InvalidHandle(handle)),
        }
    }

    pub fn cursor(&self, handle: Handle) -> Result<Arc<Cursor>> {
        match self.resolve_kind(handle, Kind::Cursor)? {
            Resource::Cursor(c) => Ok(c),
            _ => Err(EngineError::InvalidHandle(handle)),
        }
    }

    pub fn messaging(&self, handle: Handle) -> Result<Arc<CommView>> {
        match self.resolve_kind(handle, Kind::Messaging)? {
            Resource::Messaging(m) => Ok(m),
            _ => Err(EngineError::InvalidHandle(handle)),
        }
    }

    /// Close a handle and everything opened from it. Unknown or already
    /// closed handles are a no-op.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let closed = {
            let mut slots = self.inner.lock()?;
            let Some(entry) = slots.take(handle) else {
                return Ok(());
            };
            if let Some(parent) = entry.parent {
                if let Some(parent_entry) = slots.entry_mut(parent) {
                    parent_entry.children.retain(|c| *c != handle);
                }
            }

            // collect the whole subtree while holding the lock
            let mut closed = vec![(handle, entry.resource)];
            let mut pending = entry.children;
            while let Some(child) = pending.pop() {
                if let Some(child_entry) = slots.take(child) {
                    pending.extend(child_entry.children);
                    closed.push((child, child_entry.resource));
                }
            }
            closed
        };

        // children first; shutdown may join worker threads, so the table
        // lock is already released
        for (h, resource) in closed.into_iter().rev() {
            tracing::trace!(handle = h, kind = ?resource.kind(), "handle closed");
            resource.shutdown();
        }
        Ok(())
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|s| s.slots.iter().filter(|slot| slot.entry.is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn split(handle: Handle) -> (u32, u32) {
    ((handle >> 32) as u32, handle as u32)
}

fn join(generation: u32, index: u32) -> Handle {
    ((generation as u64) << 32) | index as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogOptions;

    fn catalog() -> (tempfile::TempDir, Resource) {
        let dir = tempfile::tempdir().unwrap();
        let options = CatalogOptions {
            force_create: true,
            ..Default::default()
        };
        let catalog = Catalog::open(&dir.path().join("catalog.db"), options).unwrap();
        (dir, Resource::Catalog(Arc::new(catalog)))
    }

    #[test]
    fn handles_are_never_zero_and_never_reused() {
        let (_dir, resource) = catalog();
        let registry = Registry::new();

        let first = registry.insert(resource.clone(), None).unwrap();
        assert_ne!(first, 0);
        registry.close(first).unwrap();

        let second = registry.insert(resource, None).unwrap();
        assert_ne!(first, second);
        // same slot, newer generation
        assert_eq!(first as u32, second as u32);
        assert!(matches!(registry.resolve(first), Err(EngineError::InvalidHandle(_))));
        assert!(registry.resolve(second).is_ok());
    }

    #[test]
    fn close_is_idempotent() {
        let (_dir, resource) = catalog();
        let registry = Registry::new();
        let handle = registry.insert(resource, None).unwrap();

        registry.close(handle).unwrap();
        registry.close(handle).unwrap();
        registry.close(0).unwrap();
        registry.close(u64::MAX).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn wrong_kind_is_invalid_handle() {
        let (_dir, resource) = catalog();
        let registry = Registry::new();
        let handle = registry.insert(resource, None).unwrap();

        assert!(registry.catalog(handle).is_ok());
        assert!(matches!(registry.safe(handle), Err(EngineError::InvalidHandle(h)) if h == handle));
        assert!(matches!(registry.cursor(handle), Err(EngineError::InvalidHandle(_))));
    }

    #[test]
    fn closing_parent_closes_children() {
        let (_dir, resource) = catalog();
        let registry = Registry::new();
        let parent = registry.insert(resource.clone(), None).unwrap();
        let child = registry.insert(resource.clone(), Some(parent)).unwrap();
        let grandchild = registry.insert(resource.clone(), Some(child)).unwrap();
        let sibling = registry.insert(resource.clone(), None).unwrap();

        registry.close(parent).unwrap();
        assert!(registry.resolve(child).is_err());
        assert!(registry.resolve(grandchild).is_err());
        assert!(registry.resolve(sibling).is_ok());

        assert!(matches!(
            registry.insert(resource, Some(parent)),
            Err(EngineError::InvalidHandle(_))
        ));
    }

    #[test]
    fn closing_child_detaches_from_parent() {
        let (_dir, resource) = catalog();
        let registry = Registry::new();
        let parent = registry.insert(resource.clone(), None).unwrap();
        let child = registry.insert(resource.clone(), Some(parent)).unwrap();

        registry.close(child).unwrap();
        let reused = registry.insert(resource, None).unwrap();
        registry.close(parent).unwrap();
        // the reused slot belongs to an unrelated resource now
        assert!(registry.resolve(reused).is_ok());
    }
}
