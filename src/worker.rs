//! Workers: a private inbound queue drained by one task, one item at a time.

use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, warn};

use crate::error::{Error, Result};
use crate::model::WorkerId;
use crate::telemetry::dispatch::{dispatch_span, record_transition};
use crate::telemetry::metrics;
use crate::work::WorkItem;

/// Dispatcher-side handle to a worker task.
pub struct WorkerHandle<T> {
    id: WorkerId,
    tx: Option<mpsc::Sender<WorkItem<T>>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawn a worker whose inbound queue holds up to `capacity` items.
    ///
    /// After each item the worker sends its id on `done`.
    pub fn spawn(id: WorkerId, capacity: usize, done: mpsc::UnboundedSender<WorkerId>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(id, rx, done));
        Self {
            id,
            tx: Some(tx),
            task: Some(task),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Hand an item to this worker without waiting.
    ///
    /// If the queue is full or the worker is gone, the item is failed back to
    /// its producer and the error is returned so the caller can leave the
    /// worker's load unchanged.
    pub fn enqueue(&self, item: WorkItem<T>) -> Result<()> {
        let Some(tx) = &self.tx else {
            item.reject(Error::Closed);
            return Err(Error::Closed);
        };
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                item.reject(Error::Saturated { worker: self.id });
                Err(Error::Saturated { worker: self.id })
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                item.reject(Error::Closed);
                Err(Error::Closed)
            }
        }
    }

    /// Stop accepting items. The worker drains what is already queued.
    pub fn close(&mut self) {
        self.tx.take();
    }

    /// Wait for the worker task to finish. Call after [`close`](Self::close).
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(worker = %self.id, "worker task ended abnormally: {e}");
            }
        }
    }
}

/// The worker loop: take, execute, reply, signal. Exits once the inbound
/// queue is closed and empty.
async fn run<T: Send + 'static>(
    id: WorkerId,
    mut rx: mpsc::Receiver<WorkItem<T>>,
    done: mpsc::UnboundedSender<WorkerId>,
) {
    debug!(worker = %id, "worker started");

    while let Some(item) = rx.recv().await {
        execute(id, item).await;

        // One signal per item taken, whatever its outcome.
        if done.send(id).is_err() {
            warn!(worker = %id, "dispatcher gone, worker stopping");
            break;
        }
    }

    debug!(worker = %id, "worker stopped");
}

async fn execute<T: Send + 'static>(worker: WorkerId, item: WorkItem<T>) {
    let waited_ms = item.age().as_millis() as u64;
    let (work_id, operation, mut responder) = item.into_parts();
    let span = dispatch_span(work_id, worker);
    let outer = span.clone();

    async move {
        if responder.is_closed() {
            record_transition(&span, "queued", "cancelled");
            metrics::work_cancelled().add(1, &[KeyValue::new("stage", "queued")]);
            return;
        }

        record_transition(&span, "queued", "running");
        let blocking = operation.is_blocking();
        let start = Instant::now();
        let mut task = operation.spawn();

        // Blocking closures cannot be interrupted, so they always run out.
        let joined = if blocking {
            Some((&mut task).await)
        } else {
            tokio::select! {
                joined = &mut task => Some(joined),
                _ = responder.closed() => None,
            }
        };

        let Some(joined) = joined else {
            task.abort();
            record_transition(&span, "running", "cancelled");
            metrics::work_cancelled().add(1, &[KeyValue::new("stage", "running")]);
            return;
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let result = match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Operation(e)),
            Err(e) => Err(join_failure(e)),
        };
        let label = match &result {
            Ok(_) => "ok",
            Err(Error::Panicked(_)) => "panic",
            Err(_) => "error",
        };
        metrics::operation_duration_ms().record(elapsed_ms, &[KeyValue::new("result", label)]);

        match &result {
            Ok(_) => record_transition(&span, "running", "completed"),
            Err(e) => {
                warn!(%work_id, worker = %worker, waited_ms, error = %e, "operation failed");
                record_transition(&span, "running", "failed");
            }
        }

        if !responder.send(result) {
            debug!(%work_id, "producer went away before the result arrived");
        }
    }
    .instrument(outer)
    .await
}

fn join_failure(e: JoinError) -> Error {
    if !e.is_panic() {
        return Error::Cancelled;
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    Error::Panicked(message)
}
