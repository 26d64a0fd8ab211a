//! Domain model structs persisted in the local catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_shared::{BodyId, GroupName, IdentityId};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// An identity known to this catalog. Own identities carry their private
/// material; peers seen in safes are stored public-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredIdentity {
    pub id: IdentityId,
    pub nick: String,
    pub private_material: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Safe
// ---------------------------------------------------------------------------

/// Connection metadata of a safe this catalog has created or opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafeRecord {
    pub url: String,
    pub description: String,
    /// Zero means unlimited.
    pub quota_bytes: u64,
    pub creator: IdentityId,
    /// Founder signature over the manifest, hex-encoded.
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// File index
// ---------------------------------------------------------------------------

/// One decrypted file header, as indexed locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub safe_url: String,
    pub id: u64,
    pub dir: String,
    pub name: String,
    pub group: GroupName,
    pub body_id: BodyId,
    pub size: u64,
    /// Size of the encrypted body in the replica.
    pub stored_size: u64,
    pub content_type: String,
    pub tags: Vec<String>,
    pub meta: serde_json::Value,
    pub thumbnail: Option<Vec<u8>>,
    pub source: String,
    pub creator: IdentityId,
    /// Recipient of a private entry, empty for group entries.
    pub private_id: String,
    /// Group key version of the body.
    pub key_version: u32,
    /// Group key version the header is sealed with.
    pub header_version: u32,
    pub zipped: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// When this catalog first indexed the entry.
    pub known_since: DateTime<Utc>,
    /// BLAKE3 of the raw replica header, used to skip unchanged headers.
    pub header_hash: String,
}

impl FileRecord {
    /// Full path `dir/name` (just `name` at the root).
    pub fn path(&self) -> String {
        if self.dir.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.dir, self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileOrder {
    #[default]
    Name,
    ModTime,
}

/// Filters for [`Database::search_files`](crate::Database::search_files).
#[derive(Debug, Clone)]
pub struct FileQuery {
    pub safe_url: String,
    /// Identity doing the listing; private entries are visible only to
    /// their creator and recipient.
    pub viewer: IdentityId,
    pub dir: String,
    /// Group key versions the viewer can open. A group entry is listed only
    /// when both its header and body versions are among them; `None` skips
    /// the check.
    pub readable: Option<Vec<(GroupName, u32)>>,
    /// `-1` for unbounded recursion, otherwise the number of directory
    /// levels included (0 and 1 both mean direct children only).
    pub depth: i32,
    pub name: Option<String>,
    pub suffix: Option<String>,
    pub content_type: Option<String>,
    pub body_id: Option<BodyId>,
    pub tags: Vec<String>,
    pub creator: Option<IdentityId>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub known_since: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub no_private: bool,
    pub private_id: Option<IdentityId>,
    pub order_by: FileOrder,
    pub reverse: bool,
    pub offset: u32,
    /// Zero means no limit.
    pub limit: u32,
}

impl FileQuery {
    pub fn new(safe_url: &str, viewer: &IdentityId, dir: &str) -> Self {
        Self {
            safe_url: safe_url.to_string(),
            viewer: viewer.clone(),
            dir: dir.to_string(),
            readable: None,
            depth: -1,
            name: None,
            suffix: None,
            content_type: None,
            body_id: None,
            tags: Vec::new(),
            creator: None,
            before: None,
            after: None,
            known_since: None,
            include_deleted: false,
            no_private: false,
            private_id: None,
            order_by: FileOrder::Name,
            reverse: false,
            offset: 0,
            limit: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// A decrypted body kept on local disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub safe_url: String,
    pub body_id: BodyId,
    pub local_path: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Queued uploads
// ---------------------------------------------------------------------------

/// A put accepted by the caller and still waiting for the replica.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPut {
    pub safe_url: String,
    pub id: u64,
    pub identity_id: IdentityId,
    pub dest: String,
    pub data: Option<Vec<u8>>,
    pub local_path: String,
    /// Put options as JSON.
    pub options: String,
    pub delete_src: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sync marks
// ---------------------------------------------------------------------------

/// Last refresh of one replica area (e.g. `fs`, `groups`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncMark {
    pub safe_url: String,
    pub area: String,
    pub refreshed_at: DateTime<Utc>,
    /// Effective refresh period currently in use.
    pub period_ms: u64,
}

pub(crate) fn to_micros(at: &DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

pub(crate) fn parse_rfc3339(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
