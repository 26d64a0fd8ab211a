//! # coffer-engine
//!
//! Session logic for coffer safes.
//!
//! A caller creates or loads an [`Identity`](coffer_shared::Identity), opens
//! a [`Catalog`], then creates or opens a [`Safe`] with it. A safe owns the
//! group state that decides who may read and write, and hands out three
//! views: files ([`FsView`]), per-group SQL databases ([`DbView`] with
//! streaming [`Cursor`]s) and messages ([`CommView`]).
//!
//! Everything that crosses a foreign boundary is held in the [`Registry`]
//! and addressed by opaque handles; [`api`] exposes every operation in that
//! shape.

pub mod api;
pub mod b64;
pub mod catalog;
pub mod config;
pub mod cursor;
pub mod db;
pub mod engine;
pub mod error;
pub mod fs;
pub mod group;
pub mod keys;
pub mod logging;
pub mod messaging;
pub mod registry;
pub mod safe;

pub use catalog::{Catalog, CatalogOptions};
pub use config::EngineConfig;
pub use cursor::{Cursor, Row};
pub use db::{DbView, Params};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use fs::{FileEntry, FileRange, FsView, GetOptions, ListOptions, PutOptions};
pub use group::{GroupSnapshot, Member, Role};
pub use messaging::{CommView, Message, Payload};
pub use registry::{Handle, Kind, Registry, Resource};
pub use safe::{Safe, SafeConfig, SafeSettings};
