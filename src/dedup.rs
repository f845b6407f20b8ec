//! Structural identity of payloads.
//!
//! Two payloads are duplicates when they are deeply equal, regardless of
//! the order their keys were inserted in. The canonical key is the compact
//! JSON rendering with every object's keys sorted.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::{Payload, RecordId};

/// Canonical string form of a payload.
pub fn canonical_key(payload: &Payload) -> Result<String> {
    Ok(serde_json::to_string(&sort_object(payload))?)
}

fn sort_object(map: &Map<String, Value>) -> Value {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut out = Map::with_capacity(map.len());
    for key in keys {
        out.insert(key.clone(), sort_value(&map[key]));
    }
    Value::Object(out)
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => sort_object(map),
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// Tracks which inputs have been seen during a creation-order pass.
#[derive(Debug, Default)]
struct SeenInputs {
    seen: HashSet<String>,
}

impl SeenInputs {
    /// Returns true when an equal input was already observed.
    fn is_duplicate(&mut self, input: &Payload) -> Result<bool> {
        Ok(!self.seen.insert(canonical_key(input)?))
    }
}

/// Ids that a dedup pass removes: every record whose input equals an
/// earlier record's input. `records` must be in creation order.
pub fn duplicate_ids<'a, I>(records: I) -> Result<Vec<RecordId>>
where
    I: IntoIterator<Item = (RecordId, &'a Payload)>,
{
    let mut seen = SeenInputs::default();
    let mut duplicates = Vec::new();
    for (id, input) in records {
        if seen.is_duplicate(input)? {
            duplicates.push(id);
        }
    }
    Ok(duplicates)
}
