//! Core data model.
//!
//! A record is one unit of work: an input payload, an optional output
//! payload, and the timestamps of its creation and completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// JSON object with insertion-ordered keys.
pub type Payload = Map<String, Value>;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A unit of work tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Assigned on insert, never reused.
    pub id: RecordId,

    /// What to compute. Set once by `add`.
    pub input: Payload,

    /// What was computed. Absent until `update`.
    pub output: Option<Payload>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn status(&self) -> Status {
        if self.output.is_some() {
            Status::Complete
        } else {
            Status::Pending
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status() == Status::Complete
    }

    /// `{"id", "input", "output"}` view of the record, for exports that
    /// keep input and output apart.
    pub fn envelope(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "input": self.input,
            "output": self.output,
        })
    }
}

/// Newtype for record IDs. Wraps the storage rowid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(RecordId)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Processing status, derived from the presence of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Complete,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Which records a scan yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    All,
    Pending,
    Complete,
}

/// Unwrap a JSON value into a payload. Only objects are accepted.
pub fn into_payload(value: Value) -> Result<Payload> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidPayload(format!(
            "expected a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
