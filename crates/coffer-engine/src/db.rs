//! Database view: a group-scoped SQLite database replicated through the
//! safe.
//!
//! Statements run against a local database file first and are queued as
//! pending transactions. `sync` seals the queue into the replica under
//! `db/<group>/<txId>` and replays transactions written by other members.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Statement};
use serde::{Deserialize, Serialize};

use coffer_shared::crypto;
use coffer_shared::identity::verify_signature;
use coffer_shared::protocol::{SealedRecord, Wire};
use coffer_shared::types::next_snowflake;
use coffer_shared::{GroupName, IdentityId};

use crate::cursor::Cursor;
use crate::error::{EngineError, Result};
use crate::safe::Safe;

pub type Params = serde_json::Map<String, serde_json::Value>;

const INTERNAL_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _coffer_ddl (
    version     INTEGER PRIMARY KEY NOT NULL,
    applied_at  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS _coffer_pending (
    id         INTEGER PRIMARY KEY NOT NULL,
    statement  TEXT NOT NULL,
    params     TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS _coffer_applied (
    id      INTEGER PRIMARY KEY NOT NULL,
    author  TEXT NOT NULL
);
"#;

/// One replicated statement, sealed as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbTransaction {
    id: u64,
    author: IdentityId,
    statement: String,
    params: Params,
    created_at: DateTime<Utc>,
}

pub struct DbView {
    safe: Arc<Safe>,
    group: GroupName,
    path: PathBuf,
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl DbView {
    /// Open the local database of `group`, applying schema batches in
    /// ascending version order. Versions already applied are skipped.
    pub fn open(safe: Arc<Safe>, group: &str, ddls: &BTreeMap<u32, String>) -> Result<Self> {
        safe.ensure_open()?;
        let group = GroupName::new(group)
            .ok_or_else(|| EngineError::malformed(format!("invalid group name '{group}'")))?;
        safe.check_member(&group)?;

        let dir = safe
            .catalog()
            .databases_dir()
            .join(safe.local_key())
            .join(safe.identity().id().digest());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{group}.db"));

        let mut conn = open_connection(&path)?;
        conn.execute_batch(INTERNAL_SQL)?;
        for (version, batch) in ddls {
            let done: Option<i64> = conn
                .query_row(
                    "SELECT version FROM _coffer_ddl WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()?;
            if done.is_some() {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(batch)
                .map_err(|e| EngineError::malformed(format!("schema version {version}: {e}")))?;
            tx.execute(
                "INSERT INTO _coffer_ddl (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().timestamp_micros()],
            )?;
            tx.commit()?;
            tracing::info!(%group, version, "database schema applied");
        }

        tracing::debug!(url = %safe.url(), %group, path = %path.display(), "database opened");
        Ok(Self {
            safe,
            group,
            path,
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        })
    }

    pub fn group(&self) -> &GroupName {
        &self.group
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(group = %self.group, "database closed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Aborted);
        }
        self.safe.ensure_open()
    }

    /// Run a mutating statement and queue it for replication. Returns the
    /// number of rows affected.
    pub fn exec(&self, statement: &str, params: &Params) -> Result<usize> {
        self.ensure_open()?;
        self.safe.check_write(&self.group)?;

        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        let affected = execute(&tx, statement, params)
            .map_err(|e| EngineError::malformed(format!("statement failed: {e}")))?;
        tx.execute(
            "INSERT INTO _coffer_pending (id, statement, params, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                next_snowflake() as i64,
                statement,
                serde_json::to_string(params)?,
                Utc::now().timestamp_micros()
            ],
        )?;
        tx.commit()?;

        tracing::debug!(group = %self.group, affected, "statement executed");
        Ok(affected)
    }

    /// Open a cursor over a query. Rows are produced one at a time.
    pub fn query(&self, statement: &str, params: &Params) -> Result<Cursor> {
        self.ensure_open()?;
        Cursor::spawn(&self.path, statement, params)
    }

    /// Sum of the increments recorded under `key` in the counter table
    /// `table`; zero when nothing was recorded yet.
    pub fn get_counter(&self, table: &str, key: &str) -> Result<i64> {
        self.ensure_open()?;
        let table = counter_table(table)?;
        let conn = self.conn.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(0);
        }
        Ok(conn.query_row(
            &format!("SELECT COALESCE(SUM(value), 0) FROM {table} WHERE key = ?1"),
            params![key],
            |row| row.get(0),
        )?)
    }

    /// Record an increment of `value` under `key`. Increments are rows, so
    /// concurrent members never conflict; the table is created on first use
    /// and the creation is replicated ahead of the row.
    pub fn inc_counter(&self, table: &str, key: &str, value: i64) -> Result<()> {
        self.ensure_open()?;
        let table = counter_table(table)?;
        let exists = {
            let conn = self.conn.lock()?;
            table_exists(&conn, &table)?
        };
        if !exists {
            self.exec(
                &format!("CREATE TABLE IF NOT EXISTS {table} (key TEXT NOT NULL, value INTEGER NOT NULL)"),
                &Params::new(),
            )?;
            self.exec(&format!("CREATE INDEX IF NOT EXISTS {table}_key ON {table} (key)"), &Params::new())?;
        }

        let mut params = Params::new();
        params.insert("key".into(), key.into());
        params.insert("value".into(), value.into());
        self.exec(&format!("INSERT INTO {table} (key, value) VALUES (:key, :value)"), &params)?;
        Ok(())
    }

    /// Push pending transactions and apply foreign ones. Returns the number
    /// of foreign transactions applied.
    pub fn sync(&self) -> Result<usize> {
        self.ensure_open()?;
        let deadline = Instant::now() + self.safe.engine_config().sync_timeout;
        let mut conn = self.conn.lock()?;

        let pushed = self.push(&mut conn, deadline)?;
        let applied = self.pull(&mut conn, deadline)?;

        tracing::info!(group = %self.group, pushed, applied, "database synced");
        Ok(applied)
    }

    fn check_deadline(&self, deadline: Instant) -> Result<()> {
        self.ensure_open()?;
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout(format!(
                "sync of {} exceeded {:?}",
                self.group,
                self.safe.engine_config().sync_timeout
            )));
        }
        Ok(())
    }

    fn push(&self, conn: &mut Connection, deadline: Instant) -> Result<usize> {
        let pending: Vec<(i64, String, String, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT id, statement, params, created_at FROM _coffer_pending ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let identity = self.safe.identity();
        let (key_version, key) = self.safe.newest_key(&self.group)?;
        for (id, statement, params_json, created_at) in &pending {
            self.check_deadline(deadline)?;
            let transaction = DbTransaction {
                id: *id as u64,
                author: identity.id().clone(),
                statement: statement.clone(),
                params: serde_json::from_str(params_json)?,
                created_at: DateTime::from_timestamp_micros(*created_at).unwrap_or_default(),
            };
            let mut record = SealedRecord {
                group: self.group.clone(),
                key_version,
                private_to: None,
                author: identity.id().clone(),
                data: crypto::encrypt(&key, &serde_json::to_vec(&transaction)?)?,
                signature: Vec::new(),
            };
            record.signature = identity.sign(&record.signing_bytes())?;
            self.safe
                .replica()
                .write(&transaction_path(&self.group, transaction.id), &record.to_bytes()?)?;

            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO _coffer_applied (id, author) VALUES (?1, ?2)",
                params![id, identity.id().as_str()],
            )?;
            tx.execute("DELETE FROM _coffer_pending WHERE id = ?1", params![id])?;
            tx.commit()?;
        }
        Ok(pending.len())
    }

    fn pull(&self, conn: &mut Connection, deadline: Instant) -> Result<usize> {
        let dir = format!("db/{}", self.group);
        let mut applied = 0;

        for entry in self.safe.replica().list(&dir)? {
            self.check_deadline(deadline)?;
            let Ok(id) = entry.name.parse::<u64>() else {
                continue;
            };
            let known: Option<i64> = conn
                .query_row(
                    "SELECT id FROM _coffer_applied WHERE id = ?1",
                    params![id as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_some() {
                continue;
            }

            let raw = self.safe.replica().read(&transaction_path(&self.group, id))?;
            let transaction = match self.open_transaction(&raw) {
                Ok(transaction) => transaction,
                Err(e) => {
                    // never readable by this identity; do not retry
                    tracing::warn!(group = %self.group, id, error = %e, "skipping transaction");
                    conn.execute(
                        "INSERT OR IGNORE INTO _coffer_applied (id, author) VALUES (?1, '')",
                        params![id as i64],
                    )?;
                    continue;
                }
            };

            let tx = conn.transaction()?;
            execute(&tx, &transaction.statement, &transaction.params).map_err(|e| {
                EngineError::SyncConflict(format!("transaction {id} from {}: {e}", transaction.author.short()))
            })?;
            tx.execute(
                "INSERT INTO _coffer_applied (id, author) VALUES (?1, ?2)",
                params![id as i64, transaction.author.as_str()],
            )?;
            tx.commit()?;
            applied += 1;
        }
        Ok(applied)
    }

    fn open_transaction(&self, raw: &[u8]) -> Result<DbTransaction> {
        let record = SealedRecord::from_bytes(raw)?;
        if record.group != self.group {
            return Err(EngineError::malformed(format!("transaction of group {}", record.group)));
        }
        verify_signature(&record.author, &record.signing_bytes(), &record.signature)
            .map_err(|_| EngineError::malformed("bad transaction signature"))?;
        let key = self.safe.key(&record.group, record.key_version)?;
        let transaction: DbTransaction = serde_json::from_slice(&crypto::decrypt(&key, &record.data)?)?;
        if transaction.author != record.author {
            return Err(EngineError::malformed("transaction author does not match its signer"));
        }
        Ok(transaction)
    }
}

// Counter tables are plain identifiers outside the internal namespace.
fn counter_table(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.to_ascii_lowercase().starts_with("_coffer");
    if !valid {
        return Err(EngineError::malformed(format!("invalid counter table '{name}'")));
    }
    Ok(name.to_ascii_lowercase())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn transaction_path(group: &GroupName, id: u64) -> String {
    format!("db/{group}/{id:020}")
}

pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Bind the named parameters a statement uses. Keys may omit the `:` prefix;
/// keys the statement does not mention are ignored.
pub(crate) fn bind(stmt: &mut Statement<'_>, params: &Params) -> rusqlite::Result<()> {
    for (key, value) in params {
        let name = if key.starts_with([':', '@', '$']) {
            key.clone()
        } else {
            format!(":{key}")
        };
        if let Some(index) = stmt.parameter_index(&name)? {
            stmt.raw_bind_parameter(index, to_sql(value))?;
        }
    }
    Ok(())
}

fn execute(conn: &Connection, statement: &str, params: &Params) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(statement)?;
    bind(&mut stmt, params)?;
    stmt.raw_execute()
}

fn to_sql(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(*b as i64),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(value: serde_json::Value) -> Params {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[test]
    fn binds_only_mentioned_names() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER, b TEXT, c REAL)").unwrap();

        let affected = execute(
            &conn,
            "INSERT INTO t (a, b, c) VALUES (:a, :b, $c)",
            &params(json!({"a": 1, ":b": "x", "$c": 1.5, "unused": true})),
        )
        .unwrap();
        assert_eq!(affected, 1);

        let (a, b, c): (i64, String, f64) = conn
            .query_row("SELECT a, b, c FROM t", [], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap();
        assert_eq!((a, b.as_str(), c), (1, "x", 1.5));
    }

    #[test]
    fn json_values_map_to_sql() {
        assert_eq!(to_sql(&json!(null)), Value::Null);
        assert_eq!(to_sql(&json!(true)), Value::Integer(1));
        assert_eq!(to_sql(&json!(2.5)), Value::Real(2.5));
        assert_eq!(to_sql(&json!([1, 2])), Value::Text("[1,2]".into()));
        assert_eq!(to_sql(&json!({"k": "v"})), Value::Text(r#"{"k":"v"}"#.into()));
    }

    #[test]
    fn counter_tables_are_identifiers() {
        assert_eq!(counter_table("Visits").unwrap(), "visits");
        assert_eq!(counter_table("page_views2").unwrap(), "page_views2");
        for bad in ["", "2fast", "a b", "x;DROP TABLE y", "_coffer_pending"] {
            assert!(matches!(counter_table(bad), Err(EngineError::MalformedInput(_))), "{bad}");
        }
    }

    #[test]
    fn bad_statements_fail() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(execute(&conn, "INSERT INTO nowhere VALUES (1)", &Params::new()).is_err());
        assert!(execute(&conn, "SELEC 1", &Params::new()).is_err());
    }
}
