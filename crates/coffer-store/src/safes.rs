use chrono::{DateTime, Utc};
use rusqlite::params;

use coffer_shared::IdentityId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{parse_rfc3339, SafeRecord};

const SAFE_COLUMNS: &str =
    "url, description, quota_bytes, creator, signature, created_at, opened_at";

impl Database {
    /// Insert or refresh a safe's connection metadata.
    pub fn upsert_safe(&self, safe: &SafeRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO safes (url, description, quota_bytes, creator, signature, created_at, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(url) DO UPDATE SET
                description = excluded.description,
                quota_bytes = excluded.quota_bytes,
                creator     = excluded.creator,
                signature   = excluded.signature,
                created_at  = excluded.created_at,
                opened_at   = COALESCE(excluded.opened_at, safes.opened_at)",
            params![
                safe.url,
                safe.description,
                safe.quota_bytes as i64,
                safe.creator.as_str(),
                safe.signature,
                safe.created_at.to_rfc3339(),
                safe.opened_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_safe(&self, url: &str) -> Result<SafeRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {SAFE_COLUMNS} FROM safes WHERE url = ?1"),
                params![url],
                row_to_safe,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Known safes, most recently opened first.
    pub fn list_safes(&self) -> Result<Vec<SafeRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SAFE_COLUMNS} FROM safes ORDER BY opened_at DESC, url"
        ))?;

        let rows = stmt.query_map([], row_to_safe)?;

        let mut safes = Vec::new();
        for row in rows {
            safes.push(row?);
        }
        Ok(safes)
    }

    pub fn touch_safe(&self, url: &str, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE safes SET opened_at = ?2 WHERE url = ?1",
            params![url, at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Forget a safe and everything indexed for it.
    pub fn delete_safe(&self, url: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM safes WHERE url = ?1", params![url])?;
        Ok(affected > 0)
    }
}

fn row_to_safe(row: &rusqlite::Row<'_>) -> rusqlite::Result<SafeRecord> {
    let url: String = row.get(0)?;
    let description: String = row.get(1)?;
    let quota: i64 = row.get(2)?;
    let creator: String = row.get(3)?;
    let signature: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let opened_str: Option<String> = row.get(6)?;

    let created_at = parse_rfc3339(5, &created_str)?;
    let opened_at = match opened_str {
        Some(s) => Some(parse_rfc3339(6, &s)?),
        None => None,
    };

    Ok(SafeRecord {
        url,
        description,
        quota_bytes: quota.max(0) as u64,
        creator: IdentityId(creator),
        signature,
        created_at,
        opened_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_safe(url: &str) -> SafeRecord {
        SafeRecord {
            url: url.to_string(),
            description: "team".into(),
            quota_bytes: 1024,
            creator: IdentityId::from("alice.AAAA"),
            signature: "00ff".into(),
            created_at: Utc::now(),
            opened_at: None,
        }
    }

    #[test]
    fn safe_crud() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("catalog.db")).unwrap();

        db.upsert_safe(&sample_safe("mem://a")).unwrap();
        db.upsert_safe(&sample_safe("mem://b")).unwrap();
        assert!(db.touch_safe("mem://b", Utc::now()).unwrap());

        let safes = db.list_safes().unwrap();
        assert_eq!(safes.len(), 2);
        assert_eq!(safes[0].url, "mem://b");
        assert!(safes[0].opened_at.is_some());

        // refreshing metadata keeps the last open time
        db.upsert_safe(&sample_safe("mem://b")).unwrap();
        assert!(db.get_safe("mem://b").unwrap().opened_at.is_some());
        assert!(matches!(db.get_safe("mem://c"), Err(StoreError::NotFound)));

        assert!(db.delete_safe("mem://a").unwrap());
        assert!(!db.delete_safe("mem://a").unwrap());
        assert_eq!(db.list_safes().unwrap().len(), 1);
    }
}
