//! Retained group key material.
//!
//! Rows hold key bytes already sealed by the caller with the owning
//! identity's catalog key; the store never sees plaintext keys.

use rusqlite::params;

use coffer_shared::{GroupName, IdentityId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn store_group_key(
        &self,
        safe_url: &str,
        group: &GroupName,
        version: u32,
        identity: &IdentityId,
        sealed: &[u8],
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO group_keys (safe_url, group_name, version, identity_id, material)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![safe_url, group.as_str(), version, identity.as_str(), sealed],
        )?;
        Ok(())
    }

    /// Retained versions of a group for an identity, oldest first.
    pub fn list_group_keys(
        &self,
        safe_url: &str,
        group: &GroupName,
        identity: &IdentityId,
    ) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut stmt = self.conn().prepare(
            "SELECT version, material
             FROM group_keys
             WHERE safe_url = ?1 AND group_name = ?2 AND identity_id = ?3
             ORDER BY version ASC",
        )?;

        let rows = stmt.query_map(params![safe_url, group.as_str(), identity.as_str()], |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}
