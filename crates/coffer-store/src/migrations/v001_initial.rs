//! v001 -- Initial catalog schema.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identities (own identities carry private material)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identities (
    id               TEXT PRIMARY KEY NOT NULL,   -- "<nick>.<fingerprint>"
    nick             TEXT NOT NULL,
    private_material TEXT,                        -- base64url, NULL for peers
    created_at       TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Settings
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Known safes
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS safes (
    url          TEXT PRIMARY KEY NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    quota_bytes  INTEGER NOT NULL DEFAULT 0,
    creator      TEXT NOT NULL,
    signature    TEXT NOT NULL,                   -- hex-encoded Ed25519 signature
    created_at   TEXT NOT NULL,
    opened_at    TEXT
);

-- ----------------------------------------------------------------
-- Retained group keys, sealed with the owning identity's catalog key
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_keys (
    safe_url     TEXT NOT NULL,
    group_name   TEXT NOT NULL,
    version      INTEGER NOT NULL,
    identity_id  TEXT NOT NULL,
    material     BLOB NOT NULL,

    PRIMARY KEY (safe_url, group_name, version, identity_id),
    FOREIGN KEY (safe_url) REFERENCES safes(url) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- File index (decrypted headers)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    safe_url      TEXT NOT NULL,
    id            INTEGER NOT NULL,
    dir           TEXT NOT NULL,
    name          TEXT NOT NULL,
    group_name    TEXT NOT NULL,
    body_id       INTEGER NOT NULL,
    size          INTEGER NOT NULL,
    stored_size   INTEGER NOT NULL,
    content_type  TEXT NOT NULL DEFAULT '',
    tags          TEXT NOT NULL DEFAULT '[]',     -- JSON array
    meta          TEXT NOT NULL DEFAULT 'null',   -- JSON value
    thumbnail     BLOB,
    source        TEXT NOT NULL DEFAULT '',
    creator       TEXT NOT NULL,
    private_id    TEXT NOT NULL DEFAULT '',
    key_version   INTEGER NOT NULL,
    zipped        INTEGER NOT NULL DEFAULT 0,
    deleted       INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL,               -- unix micros
    modified_at   INTEGER NOT NULL,
    known_since   INTEGER NOT NULL,
    header_hash   TEXT NOT NULL,

    PRIMARY KEY (safe_url, id),
    FOREIGN KEY (safe_url) REFERENCES safes(url) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_files_path
    ON files (safe_url, dir, name);

-- ----------------------------------------------------------------
-- Decrypted content cache
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS file_cache (
    safe_url    TEXT NOT NULL,
    body_id     INTEGER NOT NULL,
    local_path  TEXT NOT NULL,
    size        INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL,                 -- unix micros

    PRIMARY KEY (safe_url, body_id)
);

-- ----------------------------------------------------------------
-- Message read positions per (safe, identity, stream)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS read_positions (
    safe_url     TEXT NOT NULL,
    identity_id  TEXT NOT NULL,
    stream       TEXT NOT NULL,                   -- group name or sender id
    position     INTEGER NOT NULL,

    PRIMARY KEY (safe_url, identity_id, stream)
);

-- ----------------------------------------------------------------
-- Replica refresh bookkeeping
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_marks (
    safe_url      TEXT NOT NULL,
    area          TEXT NOT NULL,
    refreshed_at  INTEGER NOT NULL,               -- unix micros
    period_ms     INTEGER NOT NULL,

    PRIMARY KEY (safe_url, area)
);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
