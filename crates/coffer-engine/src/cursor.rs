//! Query cursors.
//!
//! A cursor owns a worker thread holding its own read connection and the
//! prepared statement. Each `next` is one request/reply round trip, so rows
//! are produced lazily and never buffered. Once the result set is exhausted
//! the worker exits and the cursor keeps answering end-of-sequence.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;

use rusqlite::types::ValueRef;
use rusqlite::OpenFlags;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::db::{bind, Params};
use crate::error::{EngineError, Result};

/// One result row: column names with their values, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<(String, serde_json::Value)>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.columns.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

enum Request {
    Next,
    Close,
}

enum Reply {
    Ready,
    Row(Row),
    End,
    Failed(String),
}

struct Worker {
    requests: Sender<Request>,
    replies: Receiver<Reply>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn stop(mut self) {
        let _ = self.requests.send(Request::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("cursor worker panicked");
            }
        }
    }
}

pub struct Cursor {
    worker: Mutex<Option<Worker>>,
    closed: AtomicBool,
}

impl Cursor {
    /// Prepare `statement` on a fresh connection to `path`. Statement errors
    /// surface here, before any row is requested.
    pub fn spawn(path: &Path, statement: &str, params: &Params) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let path = path.to_path_buf();
        let statement = statement.to_string();
        let params = params.clone();

        let thread = std::thread::Builder::new()
            .name("coffer-cursor".into())
            .spawn(move || run(&path, &statement, &params, request_rx, reply_tx))?;

        let mut worker = Worker {
            requests: request_tx,
            replies: reply_rx,
            thread: Some(thread),
        };
        match worker.replies.recv() {
            Ok(Reply::Ready) => Ok(Self {
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
            }),
            Ok(Reply::Failed(message)) => {
                if let Some(thread) = worker.thread.take() {
                    let _ = thread.join();
                }
                Err(EngineError::malformed(format!("query failed: {message}")))
            }
            _ => {
                worker.stop();
                Err(EngineError::Aborted)
            }
        }
    }

    /// Next row, `None` once the result set is exhausted (and on every call
    /// after that).
    pub fn next(&self) -> Result<Option<Row>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Aborted);
        }
        let mut slot = self.worker.lock()?;
        let Some(worker) = slot.as_ref() else {
            return Ok(None);
        };

        let reply = match worker.requests.send(Request::Next) {
            Ok(()) => worker.replies.recv().ok(),
            Err(_) => None,
        };
        match reply {
            Some(Reply::Row(row)) => Ok(Some(row)),
            Some(Reply::End) => {
                if let Some(worker) = slot.take() {
                    worker.stop();
                }
                tracing::trace!("cursor exhausted");
                Ok(None)
            }
            Some(Reply::Failed(message)) => {
                if let Some(worker) = slot.take() {
                    worker.stop();
                }
                Err(EngineError::malformed(format!("query failed: {message}")))
            }
            Some(Reply::Ready) | None => {
                if let Some(worker) = slot.take() {
                    worker.stop();
                }
                Err(EngineError::Aborted)
            }
        }
    }

    /// Whether the worker has been released.
    pub fn is_exhausted(&self) -> bool {
        self.worker.lock().map(|w| w.is_none()).unwrap_or(true)
    }

    /// Stop the worker. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let worker = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            worker.stop();
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close();
    }
}

fn run(path: &Path, statement: &str, params: &Params, requests: Receiver<Request>, replies: Sender<Reply>) {
    let conn = match rusqlite::Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = replies.send(Reply::Failed(e.to_string()));
            return;
        }
    };
    let mut stmt = match conn.prepare(statement) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = replies.send(Reply::Failed(e.to_string()));
            return;
        }
    };
    if let Err(e) = bind(&mut stmt, params) {
        let _ = replies.send(Reply::Failed(e.to_string()));
        return;
    }
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();

    let mut rows = stmt.raw_query();
    if replies.send(Reply::Ready).is_err() {
        return;
    }

    while let Ok(Request::Next) = requests.recv() {
        let reply = match rows.next() {
            Ok(Some(row)) => match read_row(&names, row) {
                Ok(row) => Reply::Row(row),
                Err(e) => Reply::Failed(e.to_string()),
            },
            Ok(None) => Reply::End,
            Err(e) => Reply::Failed(e.to_string()),
        };
        let last = !matches!(reply, Reply::Row(_));
        if replies.send(reply).is_err() || last {
            return;
        }
    }
}

fn read_row(names: &[String], row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let mut columns = Vec::with_capacity(names.len());
    for (index, name) in names.iter().enumerate() {
        let value = match row.get_ref(index)? {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Integer(i) => serde_json::Value::from(i),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Text(text) => serde_json::Value::String(String::from_utf8_lossy(text).into_owned()),
            ValueRef::Blob(blob) => serde_json::Value::String(crate::b64::encode(blob)),
        };
        columns.push((name.clone(), value));
    }
    Ok(Row { columns })
}
