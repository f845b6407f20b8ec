//! Metric instrument factories for workdb.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an installed provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workdb")
}

/// Counter: records inserted by `add`.
pub fn records_added() -> Counter<u64> {
    meter()
        .u64_counter("workdb.records.added")
        .with_description("Number of records added")
        .build()
}

/// Counter: records given an output by `update`.
pub fn records_completed() -> Counter<u64> {
    meter()
        .u64_counter("workdb.records.completed")
        .with_description("Number of records completed")
        .build()
}

/// Counter: records deleted as duplicates.
pub fn records_removed() -> Counter<u64> {
    meter()
        .u64_counter("workdb.records.removed")
        .with_description("Number of duplicate records removed")
        .build()
}

/// Counter: lines written by the exporter.
pub fn records_exported() -> Counter<u64> {
    meter()
        .u64_counter("workdb.records.exported")
        .with_description("Number of records exported")
        .build()
}

/// Counter: finalized transactions.
/// Labels: `outcome` ("committed" | "rolled_back" | "commit_failed").
pub fn transactions() -> Counter<u64> {
    meter()
        .u64_counter("workdb.transactions")
        .with_description("Number of finalized transactions")
        .build()
}
