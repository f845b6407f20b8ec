//! Transaction span helpers.
//!
//! Every write transaction runs inside a `workdb.txn` span. The outcome and
//! the number of buffered mutations are recorded when it finalizes.

use tracing::Span;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    RolledBack,
    CommitFailed,
}

impl TxnOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnOutcome::Committed => "committed",
            TxnOutcome::RolledBack => "rolled_back",
            TxnOutcome::CommitFailed => "commit_failed",
        }
    }
}

/// Start a span for a write transaction on `store`.
///
/// `txn.outcome` and `txn.mutations` are declared empty and filled in by
/// [`record_outcome`].
pub fn start_txn_span(store: &str) -> Span {
    tracing::info_span!(
        "workdb.txn",
        "store" = store,
        "txn.outcome" = tracing::field::Empty,
        "txn.mutations" = tracing::field::Empty,
    )
}

/// Record how the transaction ended, emitting an event inside its span.
pub fn record_outcome(span: &Span, outcome: TxnOutcome, mutations: u64) {
    span.record("txn.outcome", outcome.as_str());
    span.record("txn.mutations", mutations);
    span.in_scope(|| match outcome {
        TxnOutcome::Committed => tracing::info!(mutations, "transaction committed"),
        TxnOutcome::RolledBack => tracing::debug!(mutations, "transaction rolled back"),
        TxnOutcome::CommitFailed => tracing::warn!(mutations, "transaction commit failed"),
    });
}
