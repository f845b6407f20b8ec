//! The work database. The public API for enqueuing, processing and
//! exporting work.
//!
//! A caller opens a store, begins a transaction, adds or updates records,
//! and commits. Dropping (or closing) the handle with a transaction still
//! open rolls it back, so unacknowledged writes never become durable.

use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use crate::config::StoreOptions;
use crate::dedup;
use crate::error::{Error, Result};
use crate::model::{Payload, Record, RecordId, Selection, into_payload};
use crate::storage::{Counts, Scan, Storage, TxState};
use crate::telemetry::metrics;

/// Handle to one store. Owns the storage and its transaction state.
pub struct WorkDatabase {
    storage: Storage,
}

impl WorkDatabase {
    /// Open or create a store file with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let storage = Storage::open(path.as_ref(), options)?;
        tracing::debug!(path = %path.as_ref().display(), "work database opened");
        Ok(Self { storage })
    }

    /// Create a store that lives only as long as the handle (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            storage: Storage::in_memory()?,
        })
    }

    /// Release the store, rolling back any transaction that is still open.
    pub fn close(mut self) -> Result<()> {
        if self.in_transaction() {
            tracing::warn!("closing with an open transaction; rolling back");
            self.storage.rollback()?;
        }
        Ok(())
    }

    /// Store file, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.storage.path()
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        self.storage.begin()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.storage.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.storage.rollback()
    }

    pub fn in_transaction(&self) -> bool {
        self.storage.state() == TxState::Open
    }

    /// Execute a closure within a transaction.
    ///
    /// Commits if the closure returns Ok, rolls back on Err and returns the
    /// closure's error.
    pub fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if self.in_transaction() {
                    if let Err(rollback_err) = self.rollback() {
                        tracing::error!(error = %rollback_err, "rollback after failure failed");
                    }
                }
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Work protocol
    // -----------------------------------------------------------------------

    /// Enqueue a pending record. `input` must be a JSON object.
    pub fn add(&mut self, input: Value) -> Result<RecordId> {
        let input = into_payload(input)?;
        self.storage.insert(&input, Utc::now())
    }

    /// Get a record by ID.
    pub fn get(&self, id: RecordId) -> Result<Record> {
        self.storage.get(id)
    }

    /// Pending records as `(id, input)`, in creation order.
    ///
    /// The sequence is a snapshot taken now, so the caller may `update`
    /// records while iterating. Each call takes a fresh snapshot.
    pub fn incomplete(&self) -> Result<Incomplete> {
        let counts = self.storage.counts()?;
        let scan = self.storage.scan(Selection::Pending)?;
        tracing::info!(
            total = counts.total,
            completed = counts.completed,
            pending = scan.len(),
            "processing records"
        );
        Ok(Incomplete { scan })
    }

    /// All records matching `selection`, in creation order.
    pub fn records(&self, selection: Selection) -> Result<Scan> {
        self.storage.scan(selection)
    }

    /// Attach an output to a pending record, marking it complete.
    ///
    /// Fails with `NotFound` for an unknown id and `Conflict` if the record
    /// already has an output; the stored output is left untouched.
    pub fn update(&mut self, id: RecordId, output: Value) -> Result<()> {
        if !self.in_transaction() {
            return Err(Error::State("no active transaction".to_string()));
        }
        let output = into_payload(output)?;

        let mut record = self.storage.get(id)?;
        if record.output.is_some() {
            return Err(Error::Conflict(id));
        }

        record.output = Some(output);
        record.completed_at = Some(Utc::now());
        self.storage.put(&record)?;
        metrics::records_completed().add(1, &[]);
        Ok(())
    }

    /// Delete every record whose input equals an earlier record's input.
    ///
    /// The earliest record of each group survives whatever its status. A
    /// later duplicate is removed even if complete, and its output is lost;
    /// run this before processing. Returns the number removed.
    pub fn remove_duplicates(&mut self) -> Result<usize> {
        if !self.in_transaction() {
            return Err(Error::State("no active transaction".to_string()));
        }

        let records: Vec<Record> = self.storage.scan(Selection::All)?.collect();
        let duplicates = dedup::duplicate_ids(records.iter().map(|r| (r.id, &r.input)))?;

        for id in &duplicates {
            self.storage.delete(*id)?;
        }

        metrics::records_removed().add(duplicates.len() as u64, &[]);
        tracing::info!(
            scanned = records.len(),
            removed = duplicates.len(),
            "duplicate records removed"
        );
        Ok(duplicates.len())
    }

    /// Total number of records.
    pub fn len(&self) -> Result<usize> {
        self.storage.count(Selection::All)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of records with an output.
    pub fn completed_len(&self) -> Result<usize> {
        self.storage.count(Selection::Complete)
    }

    /// Total and completed counts from one consistent read.
    pub fn counts(&self) -> Result<Counts> {
        self.storage.counts()
    }
}

/// Snapshot iterator over pending records.
#[derive(Debug)]
pub struct Incomplete {
    scan: Scan,
}

impl Iterator for Incomplete {
    type Item = (RecordId, Payload);

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next().map(|r| (r.id, r.input))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.scan.size_hint()
    }
}

impl ExactSizeIterator for Incomplete {}
