//! Read positions of message streams and replica refresh marks.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use coffer_shared::IdentityId;

use crate::database::Database;
use crate::error::Result;
use crate::models::{from_micros, to_micros, SyncMark};

impl Database {
    /// Last message id delivered on a stream, 0 when nothing was read yet.
    pub fn read_position(&self, safe_url: &str, identity: &IdentityId, stream: &str) -> Result<u64> {
        let position: Option<i64> = self
            .conn()
            .query_row(
                "SELECT position FROM read_positions
                 WHERE safe_url = ?1 AND identity_id = ?2 AND stream = ?3",
                params![safe_url, identity.as_str(), stream],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position.unwrap_or(0).max(0) as u64)
    }

    pub fn set_read_position(
        &self,
        safe_url: &str,
        identity: &IdentityId,
        stream: &str,
        position: u64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO read_positions (safe_url, identity_id, stream, position)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(safe_url, identity_id, stream) DO UPDATE SET position = excluded.position",
            params![safe_url, identity.as_str(), stream, position as i64],
        )?;
        Ok(())
    }

    /// Every stream position an identity holds in a safe.
    pub fn list_read_positions(
        &self,
        safe_url: &str,
        identity: &IdentityId,
    ) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn().prepare(
            "SELECT stream, position FROM read_positions
             WHERE safe_url = ?1 AND identity_id = ?2
             ORDER BY stream",
        )?;
        let rows = stmt.query_map(params![safe_url, identity.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_sync_mark(&self, safe_url: &str, area: &str) -> Result<Option<SyncMark>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT safe_url, area, refreshed_at, period_ms FROM sync_marks
                 WHERE safe_url = ?1 AND area = ?2",
                params![safe_url, area],
                |row| {
                    Ok(SyncMark {
                        safe_url: row.get(0)?,
                        area: row.get(1)?,
                        refreshed_at: from_micros(row.get(2)?),
                        period_ms: row.get::<_, i64>(3)?.max(0) as u64,
                    })
                },
            )
            .optional()?)
    }

    pub fn set_sync_mark(
        &self,
        safe_url: &str,
        area: &str,
        refreshed_at: DateTime<Utc>,
        period_ms: u64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_marks (safe_url, area, refreshed_at, period_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(safe_url, area) DO UPDATE SET
                refreshed_at = excluded.refreshed_at,
                period_ms = excluded.period_ms",
            params![safe_url, area, to_micros(&refreshed_at), period_ms as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_default_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("catalog.db")).unwrap();
        let me = IdentityId::from("a.A");

        assert_eq!(db.read_position("mem://p", &me, "users").unwrap(), 0);
        db.set_read_position("mem://p", &me, "users", 42).unwrap();
        db.set_read_position("mem://p", &me, "users", 41).unwrap();
        assert_eq!(db.read_position("mem://p", &me, "users").unwrap(), 41);
        assert_eq!(db.read_position("mem://p", &me, "admin").unwrap(), 0);

        db.set_read_position("mem://p", &me, "bob.B", 7).unwrap();
        db.set_read_position("mem://q", &me, "users", 3).unwrap();
        assert_eq!(
            db.list_read_positions("mem://p", &me).unwrap(),
            vec![("bob.B".to_string(), 7), ("users".to_string(), 41)]
        );
    }

    #[test]
    fn sync_marks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("catalog.db")).unwrap();

        assert!(db.get_sync_mark("mem://p", "fs").unwrap().is_none());
        let now = Utc::now();
        db.set_sync_mark("mem://p", "fs", now, 2000).unwrap();
        let mark = db.get_sync_mark("mem://p", "fs").unwrap().unwrap();
        assert_eq!(mark.period_ms, 2000);
        assert_eq!(mark.refreshed_at.timestamp_micros(), now.timestamp_micros());
    }
}
