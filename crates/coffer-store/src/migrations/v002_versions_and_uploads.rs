//! v002 -- Header key versions in the file index, queued uploads.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- key version the header itself is sealed with; 0 for private entries
ALTER TABLE files ADD COLUMN header_version INTEGER NOT NULL DEFAULT 0;
-- forces every header to be decoded again on the next refresh
UPDATE files SET header_hash = '';

CREATE INDEX IF NOT EXISTS idx_files_dir
    ON files (safe_url, dir, deleted);

-- ----------------------------------------------------------------
-- Puts accepted but not yet written to the replica
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS pending_puts (
    safe_url     TEXT NOT NULL,
    id           INTEGER NOT NULL,                -- entry id handed to the caller
    identity_id  TEXT NOT NULL,
    dest         TEXT NOT NULL,
    data         BLOB,                            -- NULL when reading local_path
    local_path   TEXT NOT NULL DEFAULT '',
    options      TEXT NOT NULL,                   -- JSON put options
    delete_src   INTEGER NOT NULL DEFAULT 0,
    created_at   INTEGER NOT NULL,                -- unix micros

    PRIMARY KEY (safe_url, id),
    FOREIGN KEY (safe_url) REFERENCES safes(url) ON DELETE CASCADE
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
