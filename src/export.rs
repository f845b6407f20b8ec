//! JSONL export of completed records.
//!
//! One JSON object per line, in creation order, UTF-8, no envelope. The
//! default line merges input and output; on a key collision the output
//! value wins. Lines go to a temporary file next to the destination, which
//! is renamed over it only after everything was written.

use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::Result;
use crate::model::{Payload, Record, Selection};
use crate::storage::visit_on;
use crate::telemetry::metrics;
use crate::work::WorkDatabase;

/// Union of `input` and `output`. Output values override input values;
/// input keys keep their position, new output keys follow.
pub fn merge(input: &Payload, output: &Payload) -> Payload {
    let mut merged = input.clone();
    for (key, value) in output {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Default line shape: the merged payload of a completed record.
pub fn merged_line(record: &Record) -> Value {
    match &record.output {
        Some(output) => Value::Object(merge(&record.input, output)),
        None => Value::Object(record.input.clone()),
    }
}

impl WorkDatabase {
    /// Write every completed record to `path` as merged JSON lines.
    /// Returns the number of lines written.
    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<usize> {
        self.write_jsonl_with(path, merged_line)
    }

    /// Like [`write_jsonl`](Self::write_jsonl), with each line produced by `f`.
    ///
    /// Reads committed state only; buffered writes of an open transaction
    /// are not exported.
    pub fn write_jsonl_with<F>(&self, path: impl AsRef<Path>, mut f: F) -> Result<usize>
    where
        F: FnMut(&Record) -> Value,
    {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let tmp = NamedTempFile::new_in(dir)?;
        let mut writer = BufWriter::new(tmp);

        let written = self.storage().with_committed(|conn| {
            let mut written = 0usize;
            visit_on(conn, Selection::Complete, |record| {
                let mut line = serde_json::to_vec(&f(&record))?;
                line.push(b'\n');
                writer.write_all(&line)?;
                written += 1;
                Ok(())
            })?;
            Ok(written)
        })?;

        let tmp = writer.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        metrics::records_exported().add(written as u64, &[]);
        tracing::info!(path = %path.display(), records = written, "export written");
        Ok(written)
    }
}
