use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use coffer_shared::IdentityId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{parse_rfc3339, StoredIdentity};

impl Database {
    /// Insert an identity, or upgrade a public-only row with private
    /// material. Never downgrades an own identity to public-only.
    pub fn upsert_identity(&self, identity: &StoredIdentity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO identities (id, nick, private_material, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                private_material = COALESCE(excluded.private_material, identities.private_material)",
            params![
                identity.id.as_str(),
                identity.nick,
                identity.private_material,
                identity.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Record a peer identity seen in a safe, if not already known.
    pub fn remember_identity(&self, id: &IdentityId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO identities (id, nick, private_material, created_at)
             VALUES (?1, ?2, NULL, ?3)",
            params![id.as_str(), id.nick(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_identity(&self, id: &IdentityId) -> Result<StoredIdentity> {
        self.conn()
            .query_row(
                "SELECT id, nick, private_material, created_at
                 FROM identities
                 WHERE id = ?1",
                params![id.as_str()],
                row_to_identity,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn find_identity(&self, id: &IdentityId) -> Result<Option<StoredIdentity>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, nick, private_material, created_at
                 FROM identities
                 WHERE id = ?1",
                params![id.as_str()],
                row_to_identity,
            )
            .optional()?)
    }

    /// All identities, own ones (with private material) first.
    pub fn list_identities(&self) -> Result<Vec<StoredIdentity>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, nick, private_material, created_at
             FROM identities
             ORDER BY private_material IS NULL, nick, id",
        )?;

        let rows = stmt.query_map([], row_to_identity)?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(row?);
        }
        Ok(identities)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredIdentity> {
    let id: String = row.get(0)?;
    let nick: String = row.get(1)?;
    let private_material: Option<String> = row.get(2)?;
    let created_str: String = row.get(3)?;
    let created_at: DateTime<Utc> = parse_rfc3339(3, &created_str)?;

    Ok(StoredIdentity {
        id: IdentityId(id),
        nick,
        private_material,
        created_at,
    })
}
