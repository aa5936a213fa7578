//! Metric instrument factories for dispatchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider installed these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("dispatchq")
}

/// Counter: items handed to a worker queue.
/// Labels: `worker`.
pub fn work_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.work.dispatched")
        .with_description("Number of work items dispatched to a worker")
        .build()
}

/// Counter: completion signals received by the dispatcher.
/// Labels: `worker`.
pub fn work_completed() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.work.completed")
        .with_description("Number of work items completed by a worker")
        .build()
}

/// Counter: items failed back to the producer without running.
/// Labels: `reason` ("saturated" | "closed").
pub fn work_rejected() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.work.rejected")
        .with_description("Number of work items rejected at dispatch")
        .build()
}

/// Counter: items whose producer gave up before a result was delivered.
/// Labels: `stage` ("queued" | "running").
pub fn work_cancelled() -> Counter<u64> {
    meter()
        .u64_counter("dispatchq.work.cancelled")
        .with_description("Number of work items cancelled by their producer")
        .build()
}

/// Histogram: operation run time in milliseconds.
/// Labels: `result` ("ok" | "error" | "panic").
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatchq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
