//! Dispatch span helpers.
//!
//! One span per work item, opened by the worker that executes it.

use tracing::Span;

use crate::model::{WorkId, WorkerId};

/// Start a span for executing a work item on a worker.
///
/// The `work.state` field is declared empty and is filled in by
/// [`record_transition`].
pub fn dispatch_span(work_id: WorkId, worker: WorkerId) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.id" = %work_id,
        "work.worker" = %worker,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit it as an event.
pub fn record_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
