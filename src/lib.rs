//! # workdb
//!
//! Embedded SQLite-backed store for tracking units of computational work.
//!
//! Inputs are enqueued as pending records, claimed through
//! [`WorkDatabase::incomplete`], completed with [`WorkDatabase::update`],
//! and exported as merged JSON lines with [`WorkDatabase::write_jsonl`].
//! Writes are grouped into explicit transactions; an uncommitted
//! transaction is rolled back when the handle goes away.

pub mod config;
pub mod dedup;
pub mod error;
pub mod export;
pub mod model;
pub mod storage;
pub mod telemetry;
pub mod work;

pub use error::{Error, Result};
pub use model::{Payload, Record, RecordId, Selection, Status};
pub use storage::Counts;
pub use work::{Incomplete, WorkDatabase};
