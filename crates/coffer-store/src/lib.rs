//! # coffer-store
//!
//! Local and replicated storage for coffer.
//!
//! The catalog is a SQLite file holding everything a device knows locally:
//! identities, known safes, retained group keys, the file index, decrypted
//! content cache entries and per-stream read positions. The crate exposes a
//! synchronous `Database` handle that wraps a `rusqlite::Connection` with
//! typed CRUD helpers for every model.
//!
//! Replicas are the shared side: a [`Replica`](replica::Replica) is a flat
//! keyed object store (`file://` directory trees or process-local `mem://`
//! namespaces) that every member of a safe reads and writes.

pub mod cache;
pub mod database;
pub mod files;
pub mod identities;
pub mod keys;
pub mod migrations;
pub mod models;
pub mod positions;
pub mod replica;
pub mod safes;
pub mod settings;
pub mod uploads;

mod error;

pub use database::Database;
pub use error::{ReplicaError, StoreError};
pub use models::*;
pub use replica::{open_replica, Replica, ReplicaEntry};
