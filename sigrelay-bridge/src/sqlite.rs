//! Read-only SQLite resolver.
//!
//! Owns a dedicated OS thread that holds the `rusqlite::Connection`. Async
//! callers send [`DbCommand`] messages via `std::sync::mpsc::sync_channel`
//! and await a `tokio::sync::oneshot` reply. The async executor is never
//! blocked on SQLite; the reader thread is never awaited.
//!
//! The connection is opened read-only with `query_only` pinned on, so the
//! bridge can sit next to a live writer (WAL) without ever taking a write
//! lock.

use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};
use tracing::debug;

use sigrelay_protocol::clamp_limit;

use crate::resolver::{BoxFuture, ResolveError, ResourceResolver};

// ---------------------------------------------------------------------------
// Command enum — sent from async callers to the reader thread
// ---------------------------------------------------------------------------

enum DbCommand {
    Query {
        resource: String,
        limit: u32,
        reply: tokio::sync::oneshot::Sender<Result<Value, ResolveError>>,
    },
}

// ---------------------------------------------------------------------------
// SqliteResolver — the public API
// ---------------------------------------------------------------------------

/// SQLite-backed [`ResourceResolver`].
///
/// `Clone` is cheap — it only clones the `mpsc::SyncSender` handle. The
/// reader thread shuts down automatically when all handles are dropped.
#[derive(Clone)]
pub struct SqliteResolver {
    tx: std::sync::mpsc::SyncSender<DbCommand>,
}

impl SqliteResolver {
    /// Open the database at `path` read-only and start the reader thread.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ResolveError> {
        // Bound of 64 provides backpressure without being too aggressive.
        let (tx, rx) = std::sync::mpsc::sync_channel::<DbCommand>(64);

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(storage)?;

        // Tolerate a concurrent writer; refuse any accidental write.
        conn.pragma_update(None, "busy_timeout", 2000).map_err(storage)?;
        conn.pragma_update(None, "query_only", "ON").map_err(storage)?;

        std::thread::Builder::new()
            .name("sigrelay-sqlite".to_string())
            .spawn(move || run_db_thread(conn, rx))
            .map_err(|e| ResolveError::Storage(e.to_string()))?;

        Ok(Self { tx })
    }
}

impl ResourceResolver for SqliteResolver {
    fn resolve<'a>(
        &'a self,
        resource: &'a str,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Value, ResolveError>> {
        Box::pin(async move {
            let limit = clamp_limit(params.get("limit").and_then(Value::as_i64));

            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            self.tx
                .send(DbCommand::Query {
                    resource: resource.to_string(),
                    limit,
                    reply: reply_tx,
                })
                .map_err(|_| ResolveError::Storage("reader thread terminated".to_string()))?;

            reply_rx
                .await
                .map_err(|_| ResolveError::Storage("reader thread dropped reply".to_string()))?
        })
    }
}

// ---------------------------------------------------------------------------
// Reader thread — blocking event loop
// ---------------------------------------------------------------------------

fn run_db_thread(conn: Connection, rx: std::sync::mpsc::Receiver<DbCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DbCommand::Query {
                resource,
                limit,
                reply,
            } => {
                let _ = reply.send(query(&conn, &resource, limit));
            }
        }
    }
    debug!("sqlite reader thread exiting");
}

fn query(conn: &Connection, resource: &str, limit: u32) -> Result<Value, ResolveError> {
    let sql = match resource {
        "probabilities" => {
            "SELECT ts, prob_short, prob_neutral, prob_long, trend, raw_signal, \
                    final_signal, threshold
             FROM probabilities
             ORDER BY ts DESC
             LIMIT ?1"
        }
        "trades" => {
            "SELECT ts, event, side, entry_price, close_price, size, pnl_pct, \
                    pnl_abs, symbol, note
             FROM trades
             ORDER BY ts DESC
             LIMIT ?1"
        }
        _ => return Err(ResolveError::UnknownResource),
    };

    let mut stmt = conn.prepare(sql).map_err(storage)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt.query(rusqlite::params![limit]).map_err(storage)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(storage)? {
        let mut record = Map::new();
        for (i, name) in columns.iter().enumerate() {
            let cell = row.get_ref(i).map_err(storage)?;
            record.insert(name.clone(), column_value(cell));
        }
        records.push(Value::Object(record));
    }

    Ok(Value::Array(records))
}

fn column_value(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

fn storage(e: rusqlite::Error) -> ResolveError {
    ResolveError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
