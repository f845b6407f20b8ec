//! SQLite storage layer.
//!
//! Owns the connection, the record table and the transaction state.
//! WAL mode lets other handles read the last committed state while a
//! writer holds an open transaction. All mutations require an open
//! transaction; reads go through the same connection and therefore see
//! the open transaction's own writes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use tracing::Span;

use crate::config::StoreOptions;
use crate::error::{Error, Result};
use crate::model::{Payload, Record, RecordId, Selection};
use crate::telemetry::metrics;
use crate::telemetry::txn::{TxnOutcome, record_outcome, start_txn_span};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        input           TEXT NOT NULL,
        output          TEXT,
        created_at      TEXT NOT NULL,
        completed_at    TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_records_pending ON records(id)
        WHERE output IS NULL;
";

/// Transaction manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Open,
}

/// Bookkeeping for the open transaction.
struct OpenTxn {
    span: Span,
    mutations: u64,
}

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
    /// `None` for in-memory stores.
    path: Option<PathBuf>,
    txn: Option<OpenTxn>,
}

impl Storage {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let mut storage = Self {
            conn,
            path: Some(path.to_path_buf()),
            txn: None,
        };
        storage.init(options)?;
        Ok(storage)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self {
            conn,
            path: None,
            txn: None,
        };
        storage.init(&StoreOptions::default())?;
        Ok(storage)
    }

    fn init(&mut self, options: &StoreOptions) -> Result<()> {
        // A second writer must fail immediately instead of waiting.
        self.conn.busy_timeout(Duration::ZERO)?;
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(&format!(
            "PRAGMA synchronous={};",
            options.synchronous.as_pragma()
        ))?;
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn label(&self) -> String {
        self.path
            .as_ref()
            .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn state(&self) -> TxState {
        if self.txn.is_some() {
            TxState::Open
        } else {
            TxState::Idle
        }
    }

    /// Idle -> Open. No nesting; a second writer on the same file fails fast.
    pub fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::State("a transaction is already open".to_string()));
        }

        // A failed rollback can leave SQLite inside a transaction we no
        // longer track; discard it before starting a new one.
        if !self.conn.is_autocommit() {
            tracing::warn!(store = %self.label(), "discarding stale transaction");
            self.conn.execute_batch("ROLLBACK")?;
        }

        match self.conn.execute_batch("BEGIN IMMEDIATE") {
            Ok(()) => {}
            Err(e) if is_lock_contention(&e) => {
                return Err(Error::State(format!(
                    "store {} is locked by another transaction",
                    self.label()
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let span = start_txn_span(&self.label());
        span.in_scope(|| tracing::debug!("transaction opened"));
        self.txn = Some(OpenTxn { span, mutations: 0 });
        Ok(())
    }

    /// Open -> Idle, persisting every buffered mutation atomically.
    ///
    /// On failure the buffered mutations are discarded and the manager is
    /// back in Idle; the caller restarts from `begin`.
    pub fn commit(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or_else(no_active_transaction)?;

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => {
                finalize(&txn, TxnOutcome::Committed);
                Ok(())
            }
            Err(e) => {
                // A failed COMMIT can leave SQLite's transaction open.
                if !self.conn.is_autocommit() {
                    if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                        tracing::error!(error = %rollback_err, "rollback after failed commit failed");
                    }
                }
                finalize(&txn, TxnOutcome::CommitFailed);
                Err(e.into())
            }
        }
    }

    /// Open -> Idle, discarding every buffered mutation.
    pub fn rollback(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or_else(no_active_transaction)?;
        let result = self.conn.execute_batch("ROLLBACK");
        finalize(&txn, TxnOutcome::RolledBack);
        result.map_err(Error::from)
    }

    fn require_open(&mut self) -> Result<&mut OpenTxn> {
        self.txn.as_mut().ok_or_else(no_active_transaction)
    }

    /// Run `f` against a connection that sees only committed state.
    ///
    /// With no transaction open that is the store's own connection. A
    /// file-backed store with an open transaction is read through a fresh
    /// read-only connection; an in-memory one cannot be, so that case fails.
    pub fn with_committed<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        match (self.state(), &self.path) {
            (TxState::Idle, _) => f(&self.conn),
            (TxState::Open, Some(path)) => {
                let reader = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                f(&reader)
            }
            (TxState::Open, None) => Err(Error::State(
                "in-memory store cannot read committed state while a transaction is open"
                    .to_string(),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Insert a new pending record and return its assigned id.
    pub fn insert(&mut self, input: &Payload, created_at: DateTime<Utc>) -> Result<RecordId> {
        self.require_open()?;
        self.conn.execute(
            "INSERT INTO records (input, created_at) VALUES (?1, ?2)",
            params![serde_json::to_string(input)?, created_at.to_rfc3339()],
        )?;
        let id = RecordId(self.conn.last_insert_rowid());
        self.require_open()?.mutations += 1;
        metrics::records_added().add(1, &[]);
        tracing::debug!(record.id = %id, "record inserted");
        Ok(id)
    }

    /// Write a record under its id, replacing any stored version.
    pub fn put(&mut self, record: &Record) -> Result<()> {
        self.require_open()?;
        put_on(&self.conn, record)?;
        self.require_open()?.mutations += 1;
        tracing::debug!(record.id = %record.id, status = %record.status(), "record written");
        Ok(())
    }

    /// Delete a record. Returns false if it did not exist.
    pub fn delete(&mut self, id: RecordId) -> Result<bool> {
        self.require_open()?;
        let deleted = self
            .conn
            .execute("DELETE FROM records WHERE id = ?1", params![id.0])?;
        if deleted > 0 {
            self.require_open()?.mutations += 1;
            tracing::debug!(record.id = %id, "record deleted");
        }
        Ok(deleted > 0)
    }

    /// Get a record by id.
    pub fn get(&self, id: RecordId) -> Result<Record> {
        get_on(&self.conn, id)?.ok_or(Error::NotFound(id))
    }

    /// Snapshot of the selected records, in creation order.
    pub fn scan(&self, selection: Selection) -> Result<Scan> {
        let mut records = Vec::new();
        visit_on(&self.conn, selection, |record| {
            records.push(record);
            Ok(())
        })?;
        Ok(Scan {
            inner: records.into_iter(),
        })
    }

    /// Number of selected records.
    pub fn count(&self, selection: Selection) -> Result<usize> {
        count_on(&self.conn, selection)
    }

    /// Total and completed counts, read by a single statement.
    pub fn counts(&self) -> Result<Counts> {
        let (total, completed): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(output) FROM records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Counts {
            total: total as usize,
            completed: completed as usize,
        })
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.txn.is_some() {
            tracing::warn!(store = %self.label(), "rolling back uncommitted transaction");
            if let Err(e) = self.rollback() {
                tracing::error!(error = %e, "implicit rollback failed");
            }
        }
    }
}

/// Record counts taken from one consistent read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub total: usize,
    pub completed: usize,
}

impl Counts {
    pub fn pending(&self) -> usize {
        self.total - self.completed
    }
}

/// Owned, finite iterator over a scan snapshot.
#[derive(Debug)]
pub struct Scan {
    inner: std::vec::IntoIter<Record>,
}

impl Iterator for Scan {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Scan {}

fn finalize(txn: &OpenTxn, outcome: TxnOutcome) {
    record_outcome(&txn.span, outcome, txn.mutations);
    metrics::transactions().add(
        1,
        &[opentelemetry::KeyValue::new("outcome", outcome.as_str())],
    );
}

fn no_active_transaction() -> Error {
    Error::State("no active transaction".to_string())
}

fn is_lock_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

// ---------------------------------------------------------------------------
// Inner functions. They take &Connection so the exporter can run them on a
// separate read-only connection.
// ---------------------------------------------------------------------------

fn put_on(conn: &Connection, record: &Record) -> Result<()> {
    let output = record
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO records (id, input, output, created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            input = excluded.input,
            output = excluded.output,
            created_at = excluded.created_at,
            completed_at = excluded.completed_at",
        params![
            record.id.0,
            serde_json::to_string(&record.input)?,
            output,
            record.created_at.to_rfc3339(),
            record.completed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn get_on(conn: &Connection, id: RecordId) -> Result<Option<Record>> {
    conn.query_row(
        "SELECT id, input, output, created_at, completed_at FROM records WHERE id = ?1",
        params![id.0],
        RawRecord::from_row,
    )
    .optional()?
    .map(RawRecord::decode)
    .transpose()
}

/// Stream the selected records in creation order.
pub(crate) fn visit_on<F>(conn: &Connection, selection: Selection, mut f: F) -> Result<()>
where
    F: FnMut(Record) -> Result<()>,
{
    let sql = format!(
        "SELECT id, input, output, created_at, completed_at FROM records {} ORDER BY id ASC",
        where_clause(selection)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        f(RawRecord::from_row(row)?.decode()?)?;
    }
    Ok(())
}

fn count_on(conn: &Connection, selection: Selection) -> Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM records {}", where_clause(selection));
    let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(n as usize)
}

fn where_clause(selection: Selection) -> &'static str {
    match selection {
        Selection::All => "",
        Selection::Pending => "WHERE output IS NULL",
        Selection::Complete => "WHERE output IS NOT NULL",
    }
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

/// Columns as stored, before JSON and timestamp decoding.
struct RawRecord {
    id: i64,
    input: String,
    output: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            input: row.get(1)?,
            output: row.get(2)?,
            created_at: row.get(3)?,
            completed_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<Record> {
        let id = RecordId(self.id);
        Ok(Record {
            id,
            input: serde_json::from_str(&self.input)?,
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: parse_timestamp(id, &self.created_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|s| parse_timestamp(id, s))
                .transpose()?,
        })
    }
}

fn parse_timestamp(id: RecordId, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp on record {id}: {e}")))
}
