//! Boundary operations.
//!
//! One function per engine operation, shaped for a foreign caller: handles
//! are plain `u64`s, structured arguments and results are JSON records with
//! named fields, binary content travels as length-prefixed frames. Every
//! function returns an [`Outcome`]; errors are flattened to their message.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use coffer_shared::protocol::{decode_frame, encode_frame, GroupAction};
use coffer_shared::{Identity, IdentityId, IdentityRecord, Invite, MessageId};

use crate::catalog::{Catalog, CatalogOptions};
use crate::db::{DbView, Params};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::fs::{FsView, GetOptions, ListOptions, PutOptions};
use crate::logging;
use crate::messaging::{CommView, Message, Payload};
use crate::registry::{Handle, Resource};
use crate::safe::{Safe, SafeSettings};

/// Result of a boundary call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Success with a payload; `handle` is 0 unless the call opened one.
    Payload { data: Vec<u8>, handle: Handle },
    /// Success without a payload.
    Done { handle: Handle },
    Failed(String),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::Payload { handle, .. } | Self::Done { handle } => Some(*handle),
            Self::Failed(_) => None,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Payload { data, .. } => Some(data),
            _ => None,
        }
    }
}

fn run(op: &str, call: impl FnOnce() -> Result<Outcome>) -> Outcome {
    match call() {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::debug!(op, error = %e, "operation failed");
            Outcome::Failed(e.to_string())
        }
    }
}

fn json<T: Serialize>(value: &T, handle: Handle) -> Result<Outcome> {
    Ok(Outcome::Payload {
        data: serde_json::to_vec(value)?,
        handle,
    })
}

fn done() -> Result<Outcome> {
    Ok(Outcome::Done { handle: 0 })
}

// Empty input means "all defaults".
fn parse<T: serde::de::DeserializeOwned + Default>(text: &str) -> Result<T> {
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(text)?)
}

fn identity_from_json(text: &str) -> Result<Identity> {
    let record: IdentityRecord = serde_json::from_str(text)?;
    Ok(Identity::from_record(&record)?)
}

// -- identities ---------------------------------------------------------------

pub fn create_identity(nick: &str) -> Outcome {
    run("create_identity", || {
        let identity = Identity::create(nick)?;
        tracing::info!(id = %identity.id().short(), "identity created");
        json(&identity.to_record(), 0)
    })
}

pub fn identity_from_private(nick: &str, private_material: &str) -> Outcome {
    run("identity_from_private", || {
        json(&Identity::from_private(nick, private_material)?.to_record(), 0)
    })
}

pub fn lookup_identity(engine: &Engine, catalog: Handle, id: &str) -> Outcome {
    run("lookup_identity", || {
        let catalog = engine.registry().catalog(catalog)?;
        json(&catalog.lookup_public(&IdentityId::from(id))?.to_record(), 0)
    })
}

// -- catalogs -----------------------------------------------------------------

pub fn open_catalog(engine: &Engine, path: &str, options: &str) -> Outcome {
    run("open_catalog", || {
        let options: CatalogOptions = parse(options)?;
        let catalog = Catalog::open(Path::new(path), options)?;
        let handle = engine.registry().insert(Resource::Catalog(Arc::new(catalog)), None)?;
        Ok(Outcome::Done { handle })
    })
}

pub fn default_catalog(engine: &Engine) -> Outcome {
    run("default_catalog", || Ok(Outcome::Done {
        handle: engine.default_catalog()?,
    }))
}

pub fn list_safes(engine: &Engine, catalog: Handle) -> Outcome {
    run("list_safes", || json(&engine.registry().catalog(catalog)?.list_safes()?, 0))
}

/// Close any handle and everything opened from it.
pub fn close(engine: &Engine, handle: Handle) -> Outcome {
    run("close", || {
        engine.registry().close(handle)?;
        done()
    })
}

// -- safes --------------------------------------------------------------------

pub fn create_safe(engine: &Engine, catalog: Handle, identity: &str, url: &str, settings: &str) -> Outcome {
    run("create_safe", || {
        let catalog_ref = engine.registry().catalog(catalog)?;
        let identity = identity_from_json(identity)?;
        let settings: SafeSettings = parse(settings)?;
        let safe = Safe::create(catalog_ref, &identity, url, &settings, engine.config().clone())?;
        let config = safe.config();
        let handle = engine.registry().insert(Resource::Safe(Arc::new(safe)), Some(catalog))?;
        json(&config, handle)
    })
}

pub fn open_safe(engine: &Engine, catalog: Handle, identity: &str, url: &str) -> Outcome {
    run("open_safe", || {
        let catalog_ref = engine.registry().catalog(catalog)?;
        let identity = identity_from_json(identity)?;
        let safe = Safe::open(catalog_ref, &identity, url, engine.config().clone())?;
        let config = safe.config();
        let handle = engine.registry().insert(Resource::Safe(Arc::new(safe)), Some(catalog))?;
        json(&config, handle)
    })
}

/// `action`: 0 grant, 1 revoke, 2 curse, 3 endorse. `users` maps identity
/// ids to a role (grant) or weight.
pub fn update_group(engine: &Engine, safe: Handle, group: &str, action: i64, users: &str) -> Outcome {
    run("update_group", || {
        let safe = engine.registry().safe(safe)?;
        let action = GroupAction::from_code(action)
            .ok_or_else(|| EngineError::malformed(format!("unknown group action {action}")))?;
        let users: BTreeMap<IdentityId, i64> = serde_json::from_str(users)?;
        let users: Vec<(IdentityId, i64)> = users.into_iter().collect();
        safe.update_group(group, action, &users)?;
        done()
    })
}

pub fn get_groups(engine: &Engine, safe: Handle) -> Outcome {
    run("get_groups", || json(&engine.registry().safe(safe)?.groups()?, 0))
}

/// Key chain as consecutive frames, oldest version first.
pub fn get_keys(engine: &Engine, safe: Handle, group: &str, min_length: usize) -> Outcome {
    run("get_keys", || {
        let keys = engine.registry().safe(safe)?.get_keys(group, min_length)?;
        let data = keys.iter().flat_map(|key| encode_frame(key)).collect();
        Ok(Outcome::Payload { data, handle: 0 })
    })
}

pub fn safe_config(engine: &Engine, safe: Handle) -> Outcome {
    run("safe_config", || json(&engine.registry().safe(safe)?.config(), 0))
}

// -- filesystem -----------------------------------------------------------------

pub fn open_fs(engine: &Engine, safe: Handle) -> Outcome {
    run("open_fs", || {
        let view = FsView::new(engine.registry().safe(safe)?);
        let handle = engine.registry().insert(Resource::Filesystem(Arc::new(view)), Some(safe))?;
        Ok(Outcome::Done { handle })
    })
}

pub fn list_files(engine: &Engine, fs: Handle, dir: &str, options: &str) -> Outcome {
    run("list_files", || {
        let options: ListOptions = parse(options)?;
        json(&engine.registry().filesystem(fs)?.list(dir, &options)?, 0)
    })
}

pub fn stat_file(engine: &Engine, fs: Handle, path: &str) -> Outcome {
    run("stat_file", || json(&engine.registry().filesystem(fs)?.stat(path)?, 0))
}

/// `content` is one frame holding the file bytes.
pub fn put_data(engine: &Engine, fs: Handle, dest: &str, content: &[u8], options: &str) -> Outcome {
    run("put_data", || {
        let (data, _) = decode_frame(content)?;
        let options: PutOptions = parse(options)?;
        json(&engine.registry().filesystem(fs)?.put_data(dest, data, &options)?, 0)
    })
}

pub fn put_file(engine: &Engine, fs: Handle, dest: &str, source: &str, options: &str) -> Outcome {
    run("put_file", || {
        let options: PutOptions = parse(options)?;
        json(&engine.registry().filesystem(fs)?.put_file(dest, Path::new(source), &options)?, 0)
    })
}

/// `true` once the asynchronous put `id` has been stored.
pub fn has_put_completed(engine: &Engine, fs: Handle, id: u64) -> Outcome {
    run("has_put_completed", || json(&engine.registry().filesystem(fs)?.has_put_completed(id)?, 0))
}

/// Content comes back as one frame.
pub fn get_data(engine: &Engine, fs: Handle, src: &str, options: &str) -> Outcome {
    run("get_data", || {
        let options: GetOptions = parse(options)?;
        let data = engine.registry().filesystem(fs)?.get_data(src, &options)?;
        Ok(Outcome::Payload {
            data: encode_frame(&data),
            handle: 0,
        })
    })
}

pub fn get_file(engine: &Engine, fs: Handle, src: &str, dest: &str, options: &str) -> Outcome {
    run("get_file", || {
        let options: GetOptions = parse(options)?;
        engine.registry().filesystem(fs)?.get_file(src, Path::new(dest), &options)?;
        done()
    })
}

pub fn delete_file(engine: &Engine, fs: Handle, path: &str) -> Outcome {
    run("delete_file", || {
        engine.registry().filesystem(fs)?.delete(path)?;
        done()
    })
}

pub fn rename_file(engine: &Engine, fs: Handle, old: &str, new: &str) -> Outcome {
    run("rename_file", || json(&engine.registry().filesystem(fs)?.rename(old, new)?, 0))
}

// -- databases ------------------------------------------------------------------

/// `ddls` maps schema versions to statement batches, e.g. `{"1": "CREATE ..."}`.
pub fn open_db(engine: &Engine, safe: Handle, group: &str, ddls: &str) -> Outcome {
    run("open_db", || {
        let ddls: BTreeMap<u32, String> = parse(ddls)?;
        let view = DbView::open(engine.registry().safe(safe)?, group, &ddls)?;
        let handle = engine.registry().insert(Resource::Database(Arc::new(view)), Some(safe))?;
        Ok(Outcome::Done { handle })
    })
}

pub fn db_exec(engine: &Engine, db: Handle, statement: &str, params: &str) -> Outcome {
    run("db_exec", || {
        let params: Params = parse(params)?;
        json(&engine.registry().database(db)?.exec(statement, &params)?, 0)
    })
}

/// Opens a cursor handle, a child of the database handle.
pub fn db_query(engine: &Engine, db: Handle, statement: &str, params: &str) -> Outcome {
    run("db_query", || {
        let params: Params = parse(params)?;
        let cursor = engine.registry().database(db)?.query(statement, &params)?;
        let handle = engine.registry().insert(Resource::Cursor(Arc::new(cursor)), Some(db))?;
        Ok(Outcome::Done { handle })
    })
}

pub fn db_sync(engine: &Engine, db: Handle) -> Outcome {
    run("db_sync", || json(&engine.registry().database(db)?.sync()?, 0))
}

pub fn db_get_counter(engine: &Engine, db: Handle, table: &str, key: &str) -> Outcome {
    run("db_get_counter", || json(&engine.registry().database(db)?.get_counter(table, key)?, 0))
}

pub fn db_inc_counter(engine: &Engine, db: Handle, table: &str, key: &str, value: i64) -> Outcome {
    run("db_inc_counter", || {
        engine.registry().database(db)?.inc_counter(table, key, value)?;
        done()
    })
}

/// Next row as a JSON object, or `Done` with handle 0 at the end.
pub fn cursor_next(engine: &Engine, cursor: Handle) -> Outcome {
    run("cursor_next", || match engine.registry().cursor(cursor)?.next()? {
        Some(row) => json(&row, cursor),
        None => done(),
    })
}

// -- messaging ------------------------------------------------------------------

pub fn open_comm(engine: &Engine, safe: Handle) -> Outcome {
    run("open_comm", || {
        let view = CommView::new(engine.registry().safe(safe)?);
        let handle = engine.registry().insert(Resource::Messaging(Arc::new(view)), Some(safe))?;
        Ok(Outcome::Done { handle })
    })
}

/// `payload` is `{"text": ..}`, `{"data": <base64url>}` or `{"file": <path>}`.
pub fn send(engine: &Engine, comm: Handle, to: &str, payload: &str) -> Outcome {
    run("send", || {
        let payload: Payload = parse(payload)?;
        json(&engine.registry().messaging(comm)?.send(&IdentityId::from(to), &payload)?, 0)
    })
}

pub fn broadcast(engine: &Engine, comm: Handle, group: &str, payload: &str) -> Outcome {
    run("broadcast", || {
        let payload: Payload = parse(payload)?;
        json(&engine.registry().messaging(comm)?.broadcast(group, &payload)?, 0)
    })
}

pub fn receive(engine: &Engine, comm: Handle, filter: &str) -> Outcome {
    run("receive", || json(&engine.registry().messaging(comm)?.receive(filter)?, 0))
}

/// `message` is a record as returned by `receive`.
pub fn download(engine: &Engine, comm: Handle, message: &str, dest: &str) -> Outcome {
    run("download", || {
        let message: Message = serde_json::from_str(message)?;
        engine.registry().messaging(comm)?.download(&message, Path::new(dest))?;
        done()
    })
}

pub fn rewind(engine: &Engine, comm: Handle, stream: &str, message_id: u64) -> Outcome {
    run("rewind", || {
        engine.registry().messaging(comm)?.rewind(stream, MessageId(message_id))?;
        done()
    })
}

// -- process-wide ---------------------------------------------------------------

pub fn set_log_level(level: &str) -> Outcome {
    run("set_log_level", || {
        logging::set_log_level(level)?;
        done()
    })
}

/// `[locator, group, url]` as JSON, or `Done` when `link` is not an invite.
pub fn parse_invite(link: &str) -> Outcome {
    run("parse_invite", || match Invite::parse(link) {
        Some(invite) => json(&invite.into_parts(), 0),
        None => done(),
    })
}
