//! Filesystem view of a safe.
//!
//! Every file version is a signed header (`fs/headers/<entryId>`) plus an
//! encrypted body (`fs/bodies/<bodyId>`). Headers are decrypted into the
//! catalog's file index so listings run as SQL. Deleting rewrites the header
//! as a tombstone; renaming rewrites the path and keeps the body.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use coffer_shared::constants::USERS_GROUP;
use coffer_shared::crypto::{self, SymmetricKey};
use coffer_shared::identity::{verify_signature, PublicKeys};
use coffer_shared::protocol::{SealedRecord, Wire};
use coffer_shared::types::next_snowflake;
use coffer_shared::{BodyId, GroupName, IdentityId};
use coffer_store::{CacheEntry, FileOrder, FileQuery, FileRecord, PendingPut};

use crate::error::{EngineError, Result};
use crate::safe::Safe;

const HEADERS: &str = "fs/headers";
const BODIES: &str = "fs/bodies";
const PAIRWISE_LABEL: &[u8] = b"coffer-fs";

/// Filters for [`FsView::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListOptions {
    pub name: Option<String>,
    pub suffix: Option<String>,
    pub content_type: Option<String>,
    pub body_id: Option<u64>,
    pub tags: Vec<String>,
    pub creator: Option<IdentityId>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub known_since: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub no_private: bool,
    pub private_id: Option<IdentityId>,
    /// `-1` recurses without bound; 0 and 1 list direct children.
    pub depth: i32,
    pub order_by: FileOrder,
    pub reverse_order: bool,
    pub offset: u32,
    /// Zero means no limit.
    pub limit: u32,
    pub error_if_not_exist: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PutOptions {
    /// Encryption domain. When empty the nearest ancestor directory's
    /// group is used, `users` at the root.
    pub group: Option<String>,
    /// Remove every other version at the destination path.
    pub replace: bool,
    /// Overwrite this entry instead of adding a version.
    pub replace_id: Option<u64>,
    pub tags: Vec<String>,
    #[serde(with = "crate::b64::option")]
    pub thumbnail: Option<Vec<u8>>,
    /// Guessed from the extension when empty.
    pub content_type: String,
    pub zip: bool,
    pub meta: serde_json::Value,
    pub source: String,
    /// Recipient of a private entry.
    pub private: Option<IdentityId>,
    /// Queue the upload and return at once; see [`FsView::has_put_completed`].
    #[serde(rename = "async")]
    pub async_put: bool,
    /// Remove the local source file once it is stored.
    pub delete_src: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FileRange {
    pub from: u64,
    /// Exclusive; zero means the end of the content.
    pub to: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetOptions {
    /// A specific version instead of the newest.
    pub body_id: Option<u64>,
    pub no_cache: bool,
    /// Cache lifetime in seconds, engine default when absent.
    pub cache_expire: Option<u64>,
    pub file_range: Option<FileRange>,
}

/// One file version as seen by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: u64,
    pub path: String,
    pub dir: String,
    pub name: String,
    pub group: GroupName,
    pub body_id: u64,
    pub size: u64,
    pub stored_size: u64,
    pub content_type: String,
    pub tags: Vec<String>,
    pub meta: serde_json::Value,
    #[serde(with = "crate::b64::option")]
    pub thumbnail: Option<Vec<u8>>,
    pub source: String,
    pub creator: IdentityId,
    pub private_id: Option<IdentityId>,
    pub key_version: u32,
    pub zipped: bool,
    pub deleted: bool,
    /// Created by a member cursed in the entry's group.
    pub quarantined: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub known_since: DateTime<Utc>,
}

impl FileEntry {
    fn from_record(record: FileRecord, quarantined: bool) -> Self {
        let path = record.path();
        Self {
            id: record.id,
            path,
            dir: record.dir,
            name: record.name,
            group: record.group,
            body_id: record.body_id.0,
            size: record.size,
            stored_size: record.stored_size,
            content_type: record.content_type,
            tags: record.tags,
            meta: record.meta,
            thumbnail: record.thumbnail,
            source: record.source,
            creator: record.creator,
            private_id: (!record.private_id.is_empty()).then(|| IdentityId(record.private_id)),
            key_version: record.key_version,
            zipped: record.zipped,
            deleted: record.deleted,
            quarantined,
            created_at: record.created_at,
            modified_at: record.modified_at,
            known_since: record.known_since,
        }
    }
}

/// Plaintext of a header record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileHeader {
    id: u64,
    dir: String,
    name: String,
    body_id: BodyId,
    body_key_version: u32,
    size: u64,
    stored_size: u64,
    body_hash: String,
    content_type: String,
    tags: Vec<String>,
    meta: serde_json::Value,
    #[serde(with = "crate::b64::option")]
    thumbnail: Option<Vec<u8>>,
    source: String,
    creator: IdentityId,
    private_to: Option<IdentityId>,
    zipped: bool,
    deleted: bool,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

pub struct FsView {
    safe: Arc<Safe>,
    // serializes writers of this view
    write_lock: Mutex<()>,
    uploads: Mutex<Option<Uploader>>,
    closed: AtomicBool,
}

// Background thread storing queued puts.
struct Uploader {
    trigger: Sender<()>,
    thread: JoinHandle<()>,
}

impl FsView {
    pub fn new(safe: Arc<Safe>) -> Self {
        Self {
            safe,
            write_lock: Mutex::new(()),
            uploads: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Stop the upload thread, letting it finish the batch in hand. Queued
    /// puts left over are stored by the next view that queues one.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let uploader = self.uploads.lock().ok().and_then(|mut slot| slot.take());
        if let Some(Uploader { trigger, thread }) = uploader {
            drop(trigger);
            if thread.join().is_err() {
                tracing::warn!(url = %self.safe.url(), "upload thread panicked");
            }
        }
        tracing::debug!(url = %self.safe.url(), "filesystem view closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Aborted);
        }
        self.safe.ensure_open()
    }

    fn sync_area(&self) -> String {
        index_area(self.safe.identity().id())
    }

    // -- index refresh --------------------------------------------------------

    /// Index headers that are new or changed in the replica and drop the
    /// ones that disappeared. `force` ignores the catalog's sync period.
    pub fn refresh(&self, force: bool) -> Result<usize> {
        self.ensure_open()?;
        let url = self.safe.url();
        let catalog = self.safe.catalog();
        let area = self.sync_area();
        if !force && !catalog.refresh_due(url, &area)? {
            return Ok(0);
        }

        let known = catalog.db()?.file_hashes(url)?;
        let mut seen = HashSet::new();
        let mut updated = 0;

        for entry in self.safe.replica().list(HEADERS)? {
            self.ensure_open()?;
            if entry.is_dir {
                continue;
            }
            let Ok(id) = entry.name.parse::<u64>() else {
                continue;
            };
            let raw = match self.safe.replica().read(&header_path(id)) {
                Ok(raw) => raw,
                Err(coffer_store::ReplicaError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            seen.insert(id);

            let hash = blake3::hash(&raw).to_hex().to_string();
            if known.get(&id) == Some(&hash) {
                continue;
            }
            match self.decode_header(&raw) {
                Ok((record, header)) => {
                    let file = to_record(url, &record, header, hash);
                    catalog.db()?.upsert_file(&file)?;
                    updated += 1;
                }
                Err(e) => {
                    tracing::debug!(id, error = %e, "header not readable, skipping");
                    if known.contains_key(&id) {
                        catalog.db()?.remove_file(url, id)?;
                        updated += 1;
                    }
                }
            }
        }

        for id in known.keys().filter(|id| !seen.contains(id)) {
            catalog.db()?.remove_file(url, *id)?;
            updated += 1;
        }

        catalog.mark_refreshed(url, &area, updated > 0)?;
        if updated > 0 {
            tracing::debug!(url, updated, "file index refreshed");
        }
        Ok(updated)
    }

    fn decode_header(&self, raw: &[u8]) -> Result<(SealedRecord, FileHeader)> {
        let record = SealedRecord::from_bytes(raw)?;
        verify_signature(&record.author, &record.signing_bytes(), &record.signature)
            .map_err(|_| EngineError::malformed("bad header signature"))?;
        let key = self.record_key(&record.group, record.key_version, record.private_to.as_ref(), &record.author)?;
        let plain = crypto::decrypt(&key, &record.data)?;
        let header: FileHeader = serde_json::from_slice(&plain)?;
        Ok((record, header))
    }

    // Key shared by the two parties of a private entry, group key otherwise.
    fn record_key(
        &self,
        group: &GroupName,
        key_version: u32,
        private_to: Option<&IdentityId>,
        party: &IdentityId,
    ) -> Result<SymmetricKey> {
        let identity = self.safe.identity();
        match private_to {
            Some(other) => {
                let peer = if identity.id() == party {
                    other
                } else if identity.id() == other {
                    party
                } else {
                    return Err(EngineError::denied("private entry of other members"));
                };
                Ok(identity.pairwise_key(peer, PAIRWISE_LABEL)?)
            }
            None => self.safe.key(group, key_version),
        }
    }

    // -- reads --------------------------------------------------------------

    pub fn list(&self, dir: &str, options: &ListOptions) -> Result<Vec<FileEntry>> {
        self.ensure_open()?;
        let dir = normalize_dir(dir)?;
        self.refresh(false)?;

        let url = self.safe.url();
        let readable = self.safe.readable_versions()?;
        let cursed = self.safe.cursed()?;
        let db = self.safe.catalog().db()?;
        if options.error_if_not_exist && !db.dir_exists(url, &dir)? {
            return Err(EngineError::not_found(format!("directory '{dir}'")));
        }

        let mut query = FileQuery::new(url, self.safe.identity().id(), &dir);
        query.readable = Some(readable);
        query.depth = options.depth;
        query.name = options.name.clone();
        query.suffix = options.suffix.clone();
        query.content_type = options.content_type.clone();
        query.body_id = options.body_id.map(BodyId);
        query.tags = options.tags.clone();
        query.creator = options.creator.clone();
        query.before = options.before;
        query.after = options.after;
        query.known_since = options.known_since;
        query.include_deleted = options.include_deleted;
        query.no_private = options.no_private;
        query.private_id = options.private_id.clone();
        query.order_by = options.order_by;
        query.reverse = options.reverse_order;
        query.offset = options.offset;
        query.limit = options.limit;
        let records = db.search_files(&query)?;
        drop(db);

        Ok(records
            .into_iter()
            .map(|record| {
                let quarantined = cursed
                    .get(&record.group)
                    .map(|ids| ids.contains(&record.creator))
                    .unwrap_or(false);
                FileEntry::from_record(record, quarantined)
            })
            .collect())
    }

    /// Newest live version at `path`.
    pub fn stat(&self, path: &str) -> Result<FileEntry> {
        self.ensure_open()?;
        let (dir, name) = split_path(path)?;
        self.refresh(false)?;
        let record = self
            .versions(&dir, &name, false)?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::not_found(format!("file '{path}'")))?;
        let quarantined = self.safe.is_cursed(&record.creator, Some(&record.group))?;
        Ok(FileEntry::from_record(record, quarantined))
    }

    // Versions at a path readable by this identity, newest first. A group
    // record needs both its header and body key versions sealed for us.
    fn versions(&self, dir: &str, name: &str, include_deleted: bool) -> Result<Vec<FileRecord>> {
        let readable: HashSet<(GroupName, u32)> = self.safe.readable_versions()?.into_iter().collect();
        let records = self.safe.catalog().db()?.files_at_path(
            self.safe.url(),
            self.safe.identity().id(),
            dir,
            name,
            include_deleted,
        )?;
        Ok(records
            .into_iter()
            .filter(|r| {
                !r.private_id.is_empty()
                    || (readable.contains(&(r.group.clone(), r.key_version))
                        && readable.contains(&(r.group.clone(), r.header_version)))
            })
            .collect())
    }

    pub fn get_data(&self, path: &str, options: &GetOptions) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let (dir, name) = split_path(path)?;
        self.refresh(false)?;

        let record = match options.body_id {
            Some(body_id) => self
                .versions(&dir, &name, true)?
                .into_iter()
                .find(|r| r.body_id.0 == body_id),
            None => self.versions(&dir, &name, false)?.into_iter().next(),
        }
        .ok_or_else(|| EngineError::not_found(format!("file '{path}'")))?;

        let content = self.content(&record, options)?;
        match options.file_range {
            Some(range) => slice_range(content, range),
            None => Ok(content),
        }
    }

    /// Write the content at `path` to the local file `dest`.
    pub fn get_file(&self, path: &str, dest: &Path, options: &GetOptions) -> Result<u64> {
        let data = self.get_data(path, options)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &data)?;
        Ok(data.len() as u64)
    }

    fn content(&self, record: &FileRecord, options: &GetOptions) -> Result<Vec<u8>> {
        let url = self.safe.url();
        let now = Utc::now();
        self.evict_cache(now)?;

        // the cache is shared by every identity of the catalog
        if record.private_id.is_empty() {
            self.safe.key(&record.group, record.header_version)?;
            self.safe.key(&record.group, record.key_version)?;
        }
        if !options.no_cache {
            let cached = self.safe.catalog().db()?.get_cache_entry(url, record.body_id, now)?;
            if let Some(entry) = cached {
                match std::fs::read(&entry.local_path) {
                    Ok(data) => return Ok(data),
                    Err(e) => tracing::debug!(path = %entry.local_path, error = %e, "cached body missing"),
                }
            }
        }

        let raw = self.read_header(record.id)?;
        let (sealed, header) = self.decode_header(&raw)?;
        let key = self.record_key(
            &sealed.group,
            header.body_key_version,
            header.private_to.as_ref(),
            &header.creator,
        )?;
        let body = self.safe.replica().read(&body_path(header.body_id))?;
        let mut data = crypto::decrypt(&key, &body)?;
        if header.zipped {
            data = inflate(&data)?;
        }
        if blake3::hash(&data).to_hex().as_str() != header.body_hash {
            return Err(EngineError::malformed(format!("body of '{}' fails its hash", record.path())));
        }

        if !options.no_cache {
            let expire = options
                .cache_expire
                .map(Duration::from_secs)
                .unwrap_or(self.safe.engine_config().cache_expire);
            self.cache_body(record.body_id, &data, expire)?;
        }
        Ok(data)
    }

    fn cache_dir(&self) -> PathBuf {
        self.safe.catalog().cache_dir().join(self.safe.local_key())
    }

    fn cache_body(&self, body_id: BodyId, data: &[u8], expire: Duration) -> Result<()> {
        if expire.is_zero() {
            return Ok(());
        }
        let dir = self.cache_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(body_id.to_key());
        std::fs::write(&path, data)?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(expire).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.safe.catalog().db()?.put_cache_entry(&CacheEntry {
            safe_url: self.safe.url().to_string(),
            body_id,
            local_path: path.to_string_lossy().into_owned(),
            size: data.len() as u64,
            expires_at,
        })?;
        Ok(())
    }

    fn evict_cache(&self, now: DateTime<Utc>) -> Result<()> {
        let expired = self.safe.catalog().db()?.evict_expired_cache(now)?;
        for entry in expired {
            if let Err(e) = std::fs::remove_file(&entry.local_path) {
                tracing::debug!(path = %entry.local_path, error = %e, "evicted cache file already gone");
            }
        }
        Ok(())
    }

    fn forget_body(&self, body_id: BodyId) -> Result<()> {
        self.safe.replica().delete(&body_path(body_id))?;
        if self.safe.catalog().db()?.remove_cache_entry(self.safe.url(), body_id)? {
            let _ = std::fs::remove_file(self.cache_dir().join(body_id.to_key()));
        }
        Ok(())
    }

    // -- writes -------------------------------------------------------------

    pub fn put_data(&self, dest: &str, data: &[u8], options: &PutOptions) -> Result<FileEntry> {
        self.ensure_open()?;
        if options.async_put {
            return self.enqueue(dest, Some(data.to_vec()), None, data.len() as u64, options);
        }
        self.store(dest, data, options, None)
    }

    /// Store the content of the local file `source`.
    pub fn put_file(&self, dest: &str, source: &Path, options: &PutOptions) -> Result<FileEntry> {
        self.ensure_open()?;
        let mut options = options.clone();
        if options.source.is_empty() {
            options.source = source.to_string_lossy().into_owned();
        }
        if options.async_put {
            let size = std::fs::metadata(source).map_err(|e| local_error(source, e))?.len();
            return self.enqueue(dest, None, Some(source), size, &options);
        }

        let data = read_local(source)?;
        let entry = self.store(dest, &data, &options, None)?;
        if options.delete_src {
            remove_local(source);
        }
        Ok(entry)
    }

    /// Whether the queued put `id` has been stored. Ids that were never
    /// queued count as completed.
    pub fn has_put_completed(&self, id: u64) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.safe.catalog().db()?.get_pending_put(self.safe.url(), id)?.is_none())
    }

    /// Store every put this identity has queued. Failed puts stay queued.
    pub fn flush_uploads(&self) -> Result<usize> {
        self.ensure_open()?;
        let url = self.safe.url();
        let ids = self.safe.catalog().db()?.pending_put_ids(url, self.safe.identity().id())?;

        let mut stored = 0;
        for id in ids {
            self.ensure_open()?;
            let Some(put) = self.safe.catalog().db()?.get_pending_put(url, id)? else {
                continue;
            };
            match self.store_pending(&put) {
                Ok(entry) => {
                    self.safe.catalog().db()?.remove_pending_put(url, id)?;
                    stored += 1;
                    tracing::debug!(url, id, path = %entry.path, "queued put stored");
                }
                Err(e) => tracing::warn!(url, id, dest = %put.dest, error = %e, "queued put failed"),
            }
        }
        Ok(stored)
    }

    fn store_pending(&self, put: &PendingPut) -> Result<FileEntry> {
        let options: PutOptions = serde_json::from_str(&put.options)?;
        match &put.data {
            Some(data) => self.store(&put.dest, data, &options, Some(put.id)),
            None => {
                let source = Path::new(&put.local_path);
                let data = read_local(source)?;
                let entry = self.store(&put.dest, &data, &options, Some(put.id))?;
                if put.delete_src {
                    remove_local(source);
                }
                Ok(entry)
            }
        }
    }

    // Validate a put, record it in the catalog and wake the upload thread.
    // The returned entry carries the id the stored version will have.
    fn enqueue(
        &self,
        dest: &str,
        data: Option<Vec<u8>>,
        source: Option<&Path>,
        size: u64,
        options: &PutOptions,
    ) -> Result<FileEntry> {
        let (dir, name) = split_path(dest)?;
        self.check_put(size, options)?;
        self.refresh(false)?;
        let group = self.resolve_group(&dir, options)?;
        self.safe.check_write(&group)?;
        let id = match options.replace_id {
            Some(id) => self.replaced_entry(&dir, &name, id)?.id,
            None => next_snowflake(),
        };

        let mut queued = options.clone();
        queued.async_put = false;
        queued.group = Some(group.to_string());
        let now = Utc::now();
        let me = self.safe.identity().id().clone();
        self.safe.catalog().db()?.insert_pending_put(&PendingPut {
            safe_url: self.safe.url().to_string(),
            id,
            identity_id: me.clone(),
            dest: dest.to_string(),
            data,
            local_path: source.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
            options: serde_json::to_string(&queued)?,
            delete_src: options.delete_src && source.is_some(),
            created_at: now,
        })?;
        self.trigger_uploads()?;
        tracing::info!(url = %self.safe.url(), path = dest, id, "put queued");

        Ok(FileEntry {
            id,
            path: join_path(&dir, &name),
            content_type: if options.content_type.is_empty() {
                guess_content_type(dest).to_string()
            } else {
                options.content_type.clone()
            },
            dir,
            name,
            group,
            body_id: 0,
            size,
            stored_size: 0,
            tags: options.tags.clone(),
            meta: options.meta.clone(),
            thumbnail: options.thumbnail.clone(),
            source: options.source.clone(),
            creator: me,
            private_id: options.private.clone(),
            key_version: 0,
            zipped: false,
            deleted: false,
            quarantined: false,
            created_at: now,
            modified_at: now,
            known_since: now,
        })
    }

    fn trigger_uploads(&self) -> Result<()> {
        let mut slot = self.uploads.lock()?;
        if let Some(uploader) = slot.as_ref() {
            if uploader.trigger.send(()).is_ok() {
                return Ok(());
            }
        }

        let (trigger, wake) = mpsc::channel::<()>();
        let worker = FsView::new(self.safe.clone());
        let thread = std::thread::Builder::new()
            .name("coffer-uploads".into())
            .spawn(move || {
                while wake.recv().is_ok() {
                    while wake.try_recv().is_ok() {}
                    if let Err(e) = worker.flush_uploads() {
                        tracing::warn!(error = %e, "queued puts not flushed");
                    }
                }
                worker.close();
            })?;
        trigger.send(()).map_err(|_| EngineError::Aborted)?;
        *slot = Some(Uploader { trigger, thread });
        Ok(())
    }

    // Limits checked before any work is done.
    fn check_put(&self, size: u64, options: &PutOptions) -> Result<()> {
        if let Some(recipient) = &options.private {
            PublicKeys::from_id(recipient)?;
        }
        let config = self.safe.engine_config();
        if size > config.max_file_size {
            return Err(EngineError::malformed(format!(
                "file of {size} bytes exceeds the {} byte limit",
                config.max_file_size
            )));
        }
        Ok(())
    }

    // Explicit group, else the group of the nearest directory holding a
    // live entry, else `users`.
    fn resolve_group(&self, dir: &str, options: &PutOptions) -> Result<GroupName> {
        if let Some(name) = options.group.as_deref().filter(|g| !g.is_empty()) {
            return GroupName::new(name).ok_or_else(|| EngineError::malformed(format!("invalid group name '{name}'")));
        }
        let db = self.safe.catalog().db()?;
        let mut current = dir;
        loop {
            if let Some(group) = db.dir_group(self.safe.url(), current)? {
                return Ok(group);
            }
            if current.is_empty() {
                return Ok(GroupName(USERS_GROUP.into()));
            }
            current = current.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
        }
    }

    // The entry `id` at this path, visible and writable by the caller.
    fn replaced_entry(&self, dir: &str, name: &str, id: u64) -> Result<FileRecord> {
        let missing = || EngineError::not_found(format!("entry {id} at '{}'", join_path(dir, name)));
        let record = self
            .versions(dir, name, true)?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(missing)?;
        self.safe.check_write(&record.group).map_err(|_| missing())?;
        Ok(record)
    }

    fn store(&self, dest: &str, data: &[u8], options: &PutOptions, assigned: Option<u64>) -> Result<FileEntry> {
        let (dir, name) = split_path(dest)?;
        self.check_put(data.len() as u64, options)?;

        let _guard = self.write_lock.lock()?;
        self.refresh(true)?;
        let group = self.resolve_group(&dir, options)?;
        self.safe.check_write(&group)?;

        let existing = self.versions(&dir, &name, true)?;
        let replaced = match options.replace_id {
            Some(id) => Some(self.replaced_entry(&dir, &name, id)?),
            None => None,
        };

        let config = self.safe.engine_config();
        let zipped = options.zip && (data.len() as u64) < config.zip_threshold;
        let payload = if zipped { deflate(data)? } else { data.to_vec() };

        let me = self.safe.identity().id().clone();
        let (key_version, key) = match &options.private {
            Some(recipient) => (0, self.safe.identity().pairwise_key(recipient, PAIRWISE_LABEL)?),
            None => self.safe.newest_key(&group)?,
        };
        let body = crypto::encrypt(&key, &payload)?;
        self.check_quota(body.len() as u64)?;

        let body_id = BodyId::new();
        self.safe.replica().write(&body_path(body_id), &body)?;

        let now = Utc::now();
        let header = FileHeader {
            id: replaced.as_ref().map(|r| r.id).or(assigned).unwrap_or_else(next_snowflake),
            dir,
            name,
            body_id,
            body_key_version: key_version,
            size: data.len() as u64,
            stored_size: body.len() as u64,
            body_hash: blake3::hash(data).to_hex().to_string(),
            content_type: if options.content_type.is_empty() {
                guess_content_type(dest).to_string()
            } else {
                options.content_type.clone()
            },
            tags: options.tags.clone(),
            meta: options.meta.clone(),
            thumbnail: options.thumbnail.clone(),
            source: options.source.clone(),
            creator: me,
            private_to: options.private.clone(),
            zipped,
            deleted: false,
            created_at: replaced.as_ref().map(|r| r.created_at).unwrap_or(now),
            modified_at: now,
        };
        let file = match self.write_header(&group, header) {
            Ok(file) => file,
            Err(e) => {
                let _ = self.safe.replica().delete(&body_path(body_id));
                return Err(e);
            }
        };

        if let Some(old) = replaced {
            if old.body_id != body_id {
                self.forget_body(old.body_id)?;
            }
        }
        if options.replace {
            for old in existing.into_iter().filter(|r| r.id != file.id) {
                self.safe.replica().delete(&header_path(old.id))?;
                self.forget_body(old.body_id)?;
                self.safe.catalog().db()?.remove_file(self.safe.url(), old.id)?;
            }
        }

        tracing::info!(
            url = %self.safe.url(),
            path = %file.path(),
            size = file.size,
            %group,
            "file written"
        );
        Ok(FileEntry::from_record(file, false))
    }

    /// Soft-delete every live version at `path`.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let (dir, name) = split_path(path)?;
        let _guard = self.write_lock.lock()?;
        self.refresh(true)?;

        let versions = self.versions(&dir, &name, false)?;
        if versions.is_empty() {
            return Err(EngineError::not_found(format!("file '{path}'")));
        }
        for version in &versions {
            self.safe.check_write(&version.group)?;
        }
        for version in versions {
            self.rewrite_header(&version, |header| header.deleted = true)?;
        }
        tracing::info!(url = %self.safe.url(), path, "file deleted");
        Ok(())
    }

    /// Move every live version at `old` to `new`, keeping bodies and tags.
    pub fn rename(&self, old: &str, new: &str) -> Result<FileEntry> {
        self.ensure_open()?;
        let (old_dir, old_name) = split_path(old)?;
        let (new_dir, new_name) = split_path(new)?;
        let _guard = self.write_lock.lock()?;
        self.refresh(true)?;

        let versions = self.versions(&old_dir, &old_name, false)?;
        if versions.is_empty() {
            return Err(EngineError::not_found(format!("file '{old}'")));
        }
        if !self.versions(&new_dir, &new_name, false)?.is_empty() {
            return Err(EngineError::AlreadyExists(format!("file '{new}'")));
        }
        for version in &versions {
            self.safe.check_write(&version.group)?;
        }

        let mut newest = None;
        for version in versions {
            let file = self.rewrite_header(&version, |header| {
                header.dir = new_dir.clone();
                header.name = new_name.clone();
            })?;
            newest.get_or_insert(file);
        }
        tracing::info!(url = %self.safe.url(), from = old, to = new, "file renamed");
        newest
            .map(|file| FileEntry::from_record(file, false))
            .ok_or_else(|| EngineError::not_found(format!("file '{old}'")))
    }

    fn read_header(&self, id: u64) -> Result<Vec<u8>> {
        Ok(self.safe.replica().read(&header_path(id))?)
    }

    fn rewrite_header(&self, record: &FileRecord, change: impl FnOnce(&mut FileHeader)) -> Result<FileRecord> {
        let raw = self.read_header(record.id)?;
        let (sealed, mut header) = self.decode_header(&raw)?;
        change(&mut header);
        header.modified_at = Utc::now();
        self.write_header(&sealed.group, header)
    }

    // Seal, sign and store a header, then index it.
    fn write_header(&self, group: &GroupName, header: FileHeader) -> Result<FileRecord> {
        let identity = self.safe.identity();
        // a private record names the author's counterpart
        let counterpart = header.private_to.as_ref().map(|recipient| {
            if recipient == identity.id() {
                header.creator.clone()
            } else {
                recipient.clone()
            }
        });
        let (key_version, key) = match &counterpart {
            Some(peer) => (0, identity.pairwise_key(peer, PAIRWISE_LABEL)?),
            None => self.safe.newest_key(group)?,
        };

        let mut record = SealedRecord {
            group: group.clone(),
            key_version,
            private_to: counterpart,
            author: identity.id().clone(),
            data: crypto::encrypt(&key, &serde_json::to_vec(&header)?)?,
            signature: Vec::new(),
        };
        record.signature = identity.sign(&record.signing_bytes())?;
        let raw = record.to_bytes()?;
        self.safe.replica().write(&header_path(header.id), &raw)?;

        let hash = blake3::hash(&raw).to_hex().to_string();
        let file = to_record(self.safe.url(), &record, header, hash);
        self.safe.catalog().db()?.upsert_file(&file)?;
        Ok(file)
    }

    fn check_quota(&self, requested: u64) -> Result<()> {
        let quota = self.safe.config().quota_bytes;
        if quota == 0 {
            return Ok(());
        }
        let used: u64 = self
            .safe
            .replica()
            .list(BODIES)?
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.size)
            .sum();
        if used.saturating_add(requested) > quota {
            return Err(EngineError::QuotaExceeded { used, quota, requested });
        }
        Ok(())
    }
}

fn header_path(id: u64) -> String {
    format!("{HEADERS}/{id:020}")
}

fn body_path(body_id: BodyId) -> String {
    format!("{BODIES}/{}", body_id.to_key())
}

fn to_record(url: &str, sealed: &SealedRecord, header: FileHeader, hash: String) -> FileRecord {
    let now = Utc::now();
    FileRecord {
        safe_url: url.to_string(),
        id: header.id,
        dir: header.dir,
        name: header.name,
        group: sealed.group.clone(),
        body_id: header.body_id,
        size: header.size,
        stored_size: header.stored_size,
        content_type: header.content_type,
        tags: header.tags,
        meta: header.meta,
        thumbnail: header.thumbnail,
        source: header.source,
        creator: header.creator,
        private_id: header.private_to.map(|id| id.0).unwrap_or_default(),
        key_version: header.body_key_version,
        header_version: sealed.key_version,
        zipped: header.zipped,
        deleted: header.deleted,
        created_at: header.created_at,
        modified_at: header.modified_at,
        known_since: now,
        header_hash: hash,
    }
}

// Directory part of a path, without leading or trailing slashes.
fn normalize_dir(dir: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in dir.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return Err(EngineError::malformed(format!("invalid path '{dir}'"))),
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

fn split_path(path: &str) -> Result<(String, String)> {
    let normalized = normalize_dir(path)?;
    match normalized.rsplit_once('/') {
        Some((dir, name)) => Ok((dir.to_string(), name.to_string())),
        None if !normalized.is_empty() => Ok((String::new(), normalized)),
        None => Err(EngineError::malformed("empty path")),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn read_local(source: &Path) -> Result<Vec<u8>> {
    std::fs::read(source).map_err(|e| local_error(source, e))
}

fn local_error(source: &Path, e: std::io::Error) -> EngineError {
    match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::not_found(format!("local file {}", source.display())),
        _ => e.into(),
    }
}

fn remove_local(source: &Path) {
    if let Err(e) = std::fs::remove_file(source) {
        tracing::warn!(path = %source.display(), error = %e, "source file not removed");
    }
}

fn slice_range(mut data: Vec<u8>, range: FileRange) -> Result<Vec<u8>> {
    let len = data.len() as u64;
    let to = if range.to == 0 { len } else { range.to.min(len) };
    if range.from > to {
        return Err(EngineError::malformed(format!("invalid range {}..{}", range.from, range.to)));
    }
    data.truncate(to as usize);
    Ok(data.split_off(range.from as usize))
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| EngineError::malformed(format!("corrupt compressed body: {e}")))?;
    Ok(out)
}

fn guess_content_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Catalog sync area of one identity's file index.
pub(crate) fn index_area(id: &IdentityId) -> String {
    format!("fs:{}", id.digest())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_normalized() {
        assert_eq!(split_path("/a/b/c.txt").unwrap(), ("a/b".to_string(), "c.txt".to_string()));
        assert_eq!(split_path("x.txt").unwrap(), (String::new(), "x.txt".to_string()));
        assert_eq!(split_path("a//b/").unwrap(), ("a".to_string(), "b".to_string()));
        assert!(split_path("/").is_err());
        assert!(split_path("a/../b").is_err());
        assert_eq!(normalize_dir("/docs/").unwrap(), "docs");
    }

    #[test]
    fn ranges_are_half_open() {
        let data = b"hello world".to_vec();
        assert_eq!(slice_range(data.clone(), FileRange { from: 6, to: 0 }).unwrap(), b"world");
        assert_eq!(slice_range(data.clone(), FileRange { from: 0, to: 5 }).unwrap(), b"hello");
        assert_eq!(slice_range(data.clone(), FileRange { from: 3, to: 100 }).unwrap(), b"lo world");
        assert!(slice_range(data, FileRange { from: 20, to: 0 }).is_err());
    }

    #[test]
    fn deflate_round_trip() {
        let data = vec![7u8; 10_000];
        let packed = deflate(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed).unwrap(), data);
        assert!(inflate(b"not deflate").is_err());
    }

    #[test]
    fn content_types_from_extension() {
        assert_eq!(guess_content_type("a/b/report.PDF"), "application/pdf");
        assert_eq!(guess_content_type("notes.txt"), "text/plain");
        assert_eq!(guess_content_type("blob"), "application/octet-stream");
        assert_eq!(guess_content_type("v1.2/blob"), "application/octet-stream");
    }

    #[test]
    fn list_options_from_json() {
        let options: ListOptions = serde_json::from_str(
            r#"{"depth": -1, "orderBy": "modTime", "reverseOrder": true, "tags": ["a"], "errorIfNotExist": true}"#,
        )
        .unwrap();
        assert_eq!(options.depth, -1);
        assert_eq!(options.order_by, FileOrder::ModTime);
        assert!(options.reverse_order && options.error_if_not_exist);
        assert_eq!(options.limit, 0);
    }
}
