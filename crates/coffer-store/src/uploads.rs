//! Queued uploads.
//!
//! An asynchronous put is recorded here before the caller gets its entry
//! id, so the upload survives a restart and completion can be polled.

use rusqlite::{params, OptionalExtension};

use coffer_shared::IdentityId;

use crate::database::Database;
use crate::error::Result;
use crate::models::{from_micros, to_micros, PendingPut};

const PENDING_COLUMNS: &str =
    "safe_url, id, identity_id, dest, data, local_path, options, delete_src, created_at";

impl Database {
    pub fn insert_pending_put(&self, put: &PendingPut) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO pending_puts ({PENDING_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                put.safe_url,
                put.id as i64,
                put.identity_id.as_str(),
                put.dest,
                put.data,
                put.local_path,
                put.options,
                put.delete_src as i32,
                to_micros(&put.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_pending_put(&self, safe_url: &str, id: u64) -> Result<Option<PendingPut>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_puts WHERE safe_url = ?1 AND id = ?2"),
                params![safe_url, id as i64],
                row_to_pending,
            )
            .optional()?)
    }

    /// Ids of the puts queued by `identity`, oldest first.
    pub fn pending_put_ids(&self, safe_url: &str, identity: &IdentityId) -> Result<Vec<u64>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM pending_puts
             WHERE safe_url = ?1 AND identity_id = ?2
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![safe_url, identity.as_str()], |row| {
            row.get::<_, i64>(0)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row? as u64);
        }
        Ok(ids)
    }

    pub fn remove_pending_put(&self, safe_url: &str, id: u64) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM pending_puts WHERE safe_url = ?1 AND id = ?2",
            params![safe_url, id as i64],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingPut> {
    Ok(PendingPut {
        safe_url: row.get(0)?,
        id: row.get::<_, i64>(1)? as u64,
        identity_id: IdentityId(row.get(2)?),
        dest: row.get(3)?,
        data: row.get(4)?,
        local_path: row.get(5)?,
        options: row.get(6)?,
        delete_src: row.get::<_, i32>(7)? != 0,
        created_at: from_micros(row.get(8)?),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::SafeRecord;

    const URL: &str = "mem://uploads-test";

    #[test]
    fn queue_round() {
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

        let alice = IdentityId::from("alice.A");
        for id in [7u64, 3] {
            db.insert_pending_put(&PendingPut {
                safe_url: URL.into(),
                id,
                identity_id: alice.clone(),
                dest: format!("f{id}.txt"),
                data: Some(vec![1, 2, 3]),
                local_path: String::new(),
                options: "{}".into(),
                delete_src: false,
                created_at: Utc::now(),
            })
            .unwrap();
        }

        assert_eq!(db.pending_put_ids(URL, &alice).unwrap(), vec![7, 3]);
        assert!(db.pending_put_ids(URL, &IdentityId::from("bob.B")).unwrap().is_empty());
        let queued = db.get_pending_put(URL, 3).unwrap().unwrap();
        assert_eq!(queued.data.as_deref(), Some(&[1u8, 2, 3][..]));

        assert!(db.remove_pending_put(URL, 3).unwrap());
        assert!(db.get_pending_put(URL, 3).unwrap().is_none());
        assert!(!db.remove_pending_put(URL, 3).unwrap());
    }
}
