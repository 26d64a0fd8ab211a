//! Local file index.
//!
//! Headers decrypted from a safe's replica are indexed here so that listing
//! filters run as SQL instead of replica scans.

use std::collections::HashMap;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};

use coffer_shared::{BodyId, GroupName, IdentityId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{from_micros, to_micros, FileOrder, FileQuery, FileRecord};

const FILE_COLUMNS: &str = "safe_url, id, dir, name, group_name, body_id, size, stored_size, \
     content_type, tags, meta, thumbnail, source, creator, private_id, key_version, zipped, \
     deleted, created_at, modified_at, known_since, header_hash, header_version";

impl Database {
    /// Insert or update an indexed header. `known_since` is kept from the
    /// first insert.
    pub fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO files ({FILE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21, ?22, ?23)
                 ON CONFLICT(safe_url, id) DO UPDATE SET
                    dir = excluded.dir,
                    name = excluded.name,
                    group_name = excluded.group_name,
                    body_id = excluded.body_id,
                    size = excluded.size,
                    stored_size = excluded.stored_size,
                    content_type = excluded.content_type,
                    tags = excluded.tags,
                    meta = excluded.meta,
                    thumbnail = excluded.thumbnail,
                    source = excluded.source,
                    creator = excluded.creator,
                    private_id = excluded.private_id,
                    key_version = excluded.key_version,
                    zipped = excluded.zipped,
                    deleted = excluded.deleted,
                    created_at = excluded.created_at,
                    modified_at = excluded.modified_at,
                    header_hash = excluded.header_hash,
                    header_version = excluded.header_version"
            ),
            params![
                file.safe_url,
                file.id as i64,
                file.dir,
                file.name,
                file.group.as_str(),
                file.body_id.0 as i64,
                file.size as i64,
                file.stored_size as i64,
                file.content_type,
                serde_json::to_string(&file.tags)?,
                serde_json::to_string(&file.meta)?,
                file.thumbnail,
                file.source,
                file.creator.as_str(),
                file.private_id,
                file.key_version,
                file.zipped as i32,
                file.deleted as i32,
                to_micros(&file.created_at),
                to_micros(&file.modified_at),
                to_micros(&file.known_since),
                file.header_hash,
                file.header_version,
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, safe_url: &str, id: u64) -> Result<FileRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE safe_url = ?1 AND id = ?2"),
                params![safe_url, id as i64],
                row_to_file,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Header hashes of every indexed entry of a safe, keyed by entry id.
    pub fn file_hashes(&self, safe_url: &str) -> Result<HashMap<u64, String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, header_hash FROM files WHERE safe_url = ?1")?;
        let rows = stmt.query_map(params![safe_url], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
        })?;

        let mut hashes = HashMap::new();
        for row in rows {
            let (id, hash) = row?;
            hashes.insert(id, hash);
        }
        Ok(hashes)
    }

    /// Entries at an exact path visible to `viewer`, newest first.
    pub fn files_at_path(
        &self,
        safe_url: &str,
        viewer: &IdentityId,
        dir: &str,
        name: &str,
        include_deleted: bool,
    ) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE safe_url = ?1 AND dir = ?2 AND name = ?3
               AND (?4 OR deleted = 0)
               AND (private_id = '' OR creator = ?5 OR private_id = ?5)
             ORDER BY modified_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(
            params![safe_url, dir, name, include_deleted, viewer.as_str()],
            row_to_file,
        )?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Run a filtered listing.
    pub fn search_files(&self, query: &FileQuery) -> Result<Vec<FileRecord>> {
        let mut sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE safe_url = ?");
        let mut args: Vec<Value> = vec![Value::Text(query.safe_url.clone())];

        // visibility of private entries
        sql.push_str(" AND (private_id = '' OR creator = ? OR private_id = ?)");
        args.push(Value::Text(query.viewer.0.clone()));
        args.push(Value::Text(query.viewer.0.clone()));

        if let Some(readable) = &query.readable {
            // private entries are keyed per pair, not per group
            if readable.is_empty() {
                sql.push_str(" AND private_id != ''");
            } else {
                let marks = vec!["?"; readable.len()].join(", ");
                sql.push_str(&format!(
                    " AND (private_id != '' OR ((group_name || '#' || key_version) IN ({marks}) \
                     AND (group_name || '#' || header_version) IN ({marks})))"
                ));
                for _ in 0..2 {
                    args.extend(readable.iter().map(|(g, v)| Value::Text(version_key(g, *v))));
                }
            }
        }

        // directory scope
        if query.dir.is_empty() {
            if query.depth >= 0 {
                sql.push_str(&format!(" AND {} < ?", LEVEL_SQL));
                args.push(Value::Integer(query.depth.max(1) as i64));
            }
        } else {
            sql.push_str(" AND (dir = ? OR substr(dir, 1, length(?) + 1) = ? || '/')");
            args.push(Value::Text(query.dir.clone()));
            args.push(Value::Text(query.dir.clone()));
            args.push(Value::Text(query.dir.clone()));
            if query.depth >= 0 {
                sql.push_str(&format!(" AND {} - ? < ?", LEVEL_SQL));
                args.push(Value::Integer(dir_level(&query.dir)));
                args.push(Value::Integer(query.depth.max(1) as i64));
            }
        }

        if !query.include_deleted {
            sql.push_str(" AND deleted = 0");
        }
        if let Some(name) = &query.name {
            sql.push_str(" AND name = ?");
            args.push(Value::Text(name.clone()));
        }
        if let Some(suffix) = &query.suffix {
            sql.push_str(" AND substr(name, -length(?)) = ?");
            args.push(Value::Text(suffix.clone()));
            args.push(Value::Text(suffix.clone()));
        }
        if let Some(content_type) = &query.content_type {
            sql.push_str(" AND content_type = ?");
            args.push(Value::Text(content_type.clone()));
        }
        if let Some(body_id) = query.body_id {
            sql.push_str(" AND body_id = ?");
            args.push(Value::Integer(body_id.0 as i64));
        }
        for tag in &query.tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(files.tags) WHERE json_each.value = ?)");
            args.push(Value::Text(tag.clone()));
        }
        if let Some(creator) = &query.creator {
            sql.push_str(" AND creator = ?");
            args.push(Value::Text(creator.0.clone()));
        }
        if let Some(before) = &query.before {
            sql.push_str(" AND modified_at < ?");
            args.push(Value::Integer(to_micros(before)));
        }
        if let Some(after) = &query.after {
            sql.push_str(" AND modified_at > ?");
            args.push(Value::Integer(to_micros(after)));
        }
        if let Some(known_since) = &query.known_since {
            sql.push_str(" AND known_since >= ?");
            args.push(Value::Integer(to_micros(known_since)));
        }
        if query.no_private {
            sql.push_str(" AND private_id = ''");
        }
        if let Some(peer) = &query.private_id {
            sql.push_str(
                " AND ((creator = ? AND private_id = ?) OR (creator = ? AND private_id = ?))",
            );
            args.push(Value::Text(query.viewer.0.clone()));
            args.push(Value::Text(peer.0.clone()));
            args.push(Value::Text(peer.0.clone()));
            args.push(Value::Text(query.viewer.0.clone()));
        }

        let direction = if query.reverse { "DESC" } else { "ASC" };
        match query.order_by {
            FileOrder::Name => sql.push_str(&format!(
                " ORDER BY dir {direction}, name {direction}, id {direction}"
            )),
            FileOrder::ModTime => {
                sql.push_str(&format!(" ORDER BY modified_at {direction}, id {direction}"))
            }
        }

        if query.limit > 0 || query.offset > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            let limit = if query.limit > 0 { query.limit as i64 } else { -1 };
            args.push(Value::Integer(limit));
            args.push(Value::Integer(query.offset as i64));
        }

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Whether any live entry sits in `dir` or below it. The root always exists.
    pub fn dir_exists(&self, safe_url: &str, dir: &str) -> Result<bool> {
        if dir.is_empty() {
            return Ok(true);
        }
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM files
                 WHERE safe_url = ?1 AND deleted = 0
                   AND (dir = ?2 OR substr(dir, 1, length(?2) + 1) = ?2 || '/')
                 LIMIT 1",
                params![safe_url, dir],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Group of the newest live group entry directly in `dir`.
    pub fn dir_group(&self, safe_url: &str, dir: &str) -> Result<Option<GroupName>> {
        let group: Option<String> = self
            .conn()
            .query_row(
                "SELECT group_name FROM files
                 WHERE safe_url = ?1 AND dir = ?2 AND deleted = 0 AND private_id = ''
                 ORDER BY modified_at DESC, id DESC
                 LIMIT 1",
                params![safe_url, dir],
                |row| row.get(0),
            )
            .optional()?;
        Ok(group.map(GroupName))
    }

    pub fn remove_file(&self, safe_url: &str, id: u64) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM files WHERE safe_url = ?1 AND id = ?2",
            params![safe_url, id as i64],
        )?;
        Ok(affected > 0)
    }
}

// number of path segments in `dir`, the root being level 0
const LEVEL_SQL: &str =
    "(CASE WHEN dir = '' THEN 0 ELSE length(dir) - length(replace(dir, '/', '')) + 1 END)";

fn version_key(group: &GroupName, version: u32) -> String {
    format!("{group}#{version}")
}

fn dir_level(dir: &str) -> i64 {
    if dir.is_empty() {
        0
    } else {
        dir.matches('/').count() as i64 + 1
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let tags_json: String = row.get(9)?;
    let meta_json: String = row.get(10)?;

    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let meta: serde_json::Value = serde_json::from_str(&meta_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(FileRecord {
        safe_url: row.get(0)?,
        id: row.get::<_, i64>(1)? as u64,
        dir: row.get(2)?,
        name: row.get(3)?,
        group: GroupName(row.get(4)?),
        body_id: BodyId(row.get::<_, i64>(5)? as u64),
        size: row.get::<_, i64>(6)?.max(0) as u64,
        stored_size: row.get::<_, i64>(7)?.max(0) as u64,
        content_type: row.get(8)?,
        tags,
        meta,
        thumbnail: row.get(11)?,
        source: row.get(12)?,
        creator: IdentityId(row.get(13)?),
        private_id: row.get(14)?,
        key_version: row.get(15)?,
        zipped: row.get::<_, i32>(16)? != 0,
        deleted: row.get::<_, i32>(17)? != 0,
        created_at: from_micros(row.get(18)?),
        modified_at: from_micros(row.get(19)?),
        known_since: from_micros(row.get(20)?),
        header_hash: row.get(21)?,
        header_version: row.get(22)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::models::SafeRecord;

    const URL: &str = "mem://files-test";

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("catalog.db")).unwrap();
        db.upsert_safe(&SafeRecord {
            url: URL.into(),
            description: String::new(),
            quota_bytes: 0,
            creator: IdentityId::from("alice.A"),
            signature: String::new(),
            created_at: Utc::now(),
            opened_at: None,
        })
        .unwrap();
        (dir, db)
    }

    fn record(id: u64, dir: &str, name: &str) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            safe_url: URL.into(),
            id,
            dir: dir.into(),
            name: name.into(),
            group: GroupName("users".into()),
            body_id: BodyId(id * 10),
            size: 5,
            stored_size: 45,
            content_type: "text/plain".into(),
            tags: vec![],
            meta: serde_json::Value::Null,
            thumbnail: None,
            source: String::new(),
            creator: IdentityId::from("alice.A"),
            private_id: String::new(),
            key_version: 1,
            header_version: 1,
            zipped: false,
            deleted: false,
            created_at: now,
            modified_at: now + Duration::microseconds(id as i64),
            known_since: now,
            header_hash: format!("h{id}"),
        }
    }

    fn names(files: &[FileRecord]) -> Vec<String> {
        files.iter().map(FileRecord::path).collect()
    }

    #[test]
    fn depth_limits_recursion() {
        let (_dir, db) = test_db();
        db.upsert_file(&record(1, "", "top.txt")).unwrap();
        db.upsert_file(&record(2, "docs", "a.txt")).unwrap();
        db.upsert_file(&record(3, "docs/deep", "b.txt")).unwrap();
        db.upsert_file(&record(4, "docsx", "c.txt")).unwrap();

        let viewer = IdentityId::from("alice.A");
        let mut query = FileQuery::new(URL, &viewer, "");
        assert_eq!(db.search_files(&query).unwrap().len(), 4);

        query.depth = 1;
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["top.txt"]);

        let mut query = FileQuery::new(URL, &viewer, "docs");
        assert_eq!(
            names(&db.search_files(&query).unwrap()),
            vec!["docs/a.txt", "docs/deep/b.txt"]
        );
        query.depth = 1;
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["docs/a.txt"]);
        query.depth = 2;
        assert_eq!(db.search_files(&query).unwrap().len(), 2);
    }

    #[test]
    fn filters_and_pagination() {
        let (_dir, db) = test_db();
        let mut tagged = record(1, "", "photo.jpg");
        tagged.tags = vec!["holiday".into(), "2024".into()];
        tagged.content_type = "image/jpeg".into();
        db.upsert_file(&tagged).unwrap();
        db.upsert_file(&record(2, "", "notes.txt")).unwrap();
        let mut deleted = record(3, "", "old.txt");
        deleted.deleted = true;
        db.upsert_file(&deleted).unwrap();

        let viewer = IdentityId::from("alice.A");
        let mut query = FileQuery::new(URL, &viewer, "");
        query.tags = vec!["holiday".into()];
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["photo.jpg"]);

        let mut query = FileQuery::new(URL, &viewer, "");
        query.suffix = Some(".txt".into());
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["notes.txt"]);
        query.include_deleted = true;
        assert_eq!(db.search_files(&query).unwrap().len(), 2);

        let mut query = FileQuery::new(URL, &viewer, "");
        query.order_by = FileOrder::ModTime;
        query.reverse = true;
        query.limit = 1;
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["notes.txt"]);
        query.offset = 1;
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["photo.jpg"]);
    }

    #[test]
    fn private_entries_hidden_from_others() {
        let (_dir, db) = test_db();
        let mut private = record(1, "", "secret.txt");
        private.private_id = "bob.B".into();
        db.upsert_file(&private).unwrap();
        db.upsert_file(&record(2, "", "public.txt")).unwrap();

        let mut admins_only = FileQuery::new(URL, &IdentityId::from("alice.A"), "");
        admins_only.readable = Some(vec![(GroupName("admin".into()), 1)]);
        assert_eq!(names(&db.search_files(&admins_only).unwrap()), vec!["secret.txt"]);
        admins_only.readable = Some(Vec::new());
        assert_eq!(names(&db.search_files(&admins_only).unwrap()), vec!["secret.txt"]);

        let carol = IdentityId::from("carol.C");
        assert_eq!(
            names(&db.search_files(&FileQuery::new(URL, &carol, "")).unwrap()),
            vec!["public.txt"]
        );

        let bob = IdentityId::from("bob.B");
        let mut query = FileQuery::new(URL, &bob, "");
        assert_eq!(db.search_files(&query).unwrap().len(), 2);
        query.private_id = Some(IdentityId::from("alice.A"));
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["secret.txt"]);
        query.private_id = None;
        query.no_private = true;
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["public.txt"]);
    }

    #[test]
    fn only_openable_versions_are_listed() {
        let (_dir, db) = test_db();
        db.upsert_file(&record(1, "", "old.txt")).unwrap();
        let mut newer = record(2, "", "new.txt");
        newer.key_version = 2;
        newer.header_version = 2;
        db.upsert_file(&newer).unwrap();
        // body from before a rotation, header rewritten after it
        let mut renamed = record(3, "", "moved.txt");
        renamed.header_version = 2;
        db.upsert_file(&renamed).unwrap();

        let users = GroupName("users".into());
        let mut query = FileQuery::new(URL, &IdentityId::from("alice.A"), "");
        query.readable = Some(vec![(users.clone(), 1)]);
        assert_eq!(names(&db.search_files(&query).unwrap()), vec!["old.txt"]);

        query.readable = Some(vec![(users.clone(), 1), (users, 2)]);
        assert_eq!(db.search_files(&query).unwrap().len(), 3);
    }

    #[test]
    fn directory_group_is_the_newest_entry() {
        let (_dir, db) = test_db();
        assert_eq!(db.dir_group(URL, "docs").unwrap(), None);

        let mut first = record(1, "docs", "a.txt");
        first.group = GroupName("team".into());
        db.upsert_file(&first).unwrap();
        assert_eq!(db.dir_group(URL, "docs").unwrap(), Some(GroupName("team".into())));

        let mut private = record(2, "docs", "b.txt");
        private.group = GroupName("other".into());
        private.private_id = "bob.B".into();
        db.upsert_file(&private).unwrap();
        assert_eq!(db.dir_group(URL, "docs").unwrap(), Some(GroupName("team".into())));
        assert_eq!(db.dir_group(URL, "").unwrap(), None);
    }

    #[test]
    fn upsert_keeps_known_since() {
        let (_dir, db) = test_db();
        let first = record(1, "docs", "a.txt");
        db.upsert_file(&first).unwrap();

        let mut renamed = first.clone();
        renamed.name = "b.txt".into();
        renamed.known_since = first.known_since + Duration::hours(1);
        db.upsert_file(&renamed).unwrap();

        let stored = db.get_file(URL, 1).unwrap();
        assert_eq!(stored.name, "b.txt");
        assert_eq!(stored.known_since.timestamp_micros(), first.known_since.timestamp_micros());
        assert!(db.dir_exists(URL, "docs").unwrap());
        assert!(!db.dir_exists(URL, "doc").unwrap());
        assert_eq!(db.file_hashes(URL).unwrap().get(&1).map(String::as_str), Some("h1"));

        let viewer = IdentityId::from("alice.A");
        assert_eq!(db.files_at_path(URL, &viewer, "docs", "b.txt", false).unwrap().len(), 1);
        assert!(db.remove_file(URL, 1).unwrap());
        assert!(matches!(db.get_file(URL, 1), Err(StoreError::NotFound)));
    }
}
