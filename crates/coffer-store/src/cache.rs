use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use coffer_shared::BodyId;

use crate::database::Database;
use crate::error::Result;
use crate::models::{from_micros, to_micros, CacheEntry};

impl Database {
    pub fn put_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO file_cache (safe_url, body_id, local_path, size, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.safe_url,
                entry.body_id.0 as i64,
                entry.local_path,
                entry.size as i64,
                to_micros(&entry.expires_at),
            ],
        )?;
        Ok(())
    }

    /// Cache entry for a body, `None` when absent or expired at `now`.
    pub fn get_cache_entry(
        &self,
        safe_url: &str,
        body_id: BodyId,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT safe_url, body_id, local_path, size, expires_at
                 FROM file_cache
                 WHERE safe_url = ?1 AND body_id = ?2 AND expires_at > ?3",
                params![safe_url, body_id.0 as i64, to_micros(&now)],
                row_to_cache_entry,
            )
            .optional()?)
    }

    /// Remove expired entries and return them so the caller can delete the
    /// local files.
    pub fn evict_expired_cache(&self, now: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT safe_url, body_id, local_path, size, expires_at
             FROM file_cache
             WHERE expires_at <= ?1",
        )?;
        let rows = stmt.query_map(params![to_micros(&now)], row_to_cache_entry)?;

        let mut expired = Vec::new();
        for row in rows {
            expired.push(row?);
        }

        self.conn().execute(
            "DELETE FROM file_cache WHERE expires_at <= ?1",
            params![to_micros(&now)],
        )?;
        Ok(expired)
    }

    pub fn remove_cache_entry(&self, safe_url: &str, body_id: BodyId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM file_cache WHERE safe_url = ?1 AND body_id = ?2",
            params![safe_url, body_id.0 as i64],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_cache_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        safe_url: row.get(0)?,
        body_id: BodyId(row.get::<_, i64>(1)? as u64),
        local_path: row.get(2)?,
        size: row.get::<_, i64>(3)?.max(0) as u64,
        expires_at: from_micros(row.get(4)?),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn expired_entries_are_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("catalog.db")).unwrap();
        let now = Utc::now();

        db.put_cache_entry(&CacheEntry {
            safe_url: "mem://c".into(),
            body_id: BodyId(1),
            local_path: "/tmp/1".into(),
            size: 3,
            expires_at: now + Duration::seconds(60),
        })
        .unwrap();
        db.put_cache_entry(&CacheEntry {
            safe_url: "mem://c".into(),
            body_id: BodyId(2),
            local_path: "/tmp/2".into(),
            size: 3,
            expires_at: now - Duration::seconds(1),
        })
        .unwrap();

        assert!(db.get_cache_entry("mem://c", BodyId(1), now).unwrap().is_some());
        assert!(db.get_cache_entry("mem://c", BodyId(2), now).unwrap().is_none());

        let evicted = db.evict_expired_cache(now).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].local_path, "/tmp/2");

        assert!(db.remove_cache_entry("mem://c", BodyId(1)).unwrap());
    }
}
