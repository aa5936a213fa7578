//! Units of work and their result channels.
//!
//! A [`WorkItem`] carries an operation and the sending half of a oneshot
//! channel. The producer keeps the receiving half as a [`Ticket`]. Dropping
//! the ticket closes the channel, which the executing worker observes as a
//! cancellation.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::model::WorkId;

type BoxFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

/// What a worker runs for one item.
pub enum Operation<T> {
    /// Produces a future, polled on the async runtime.
    Async(Box<dyn FnOnce() -> BoxFuture<T> + Send + 'static>),
    /// Runs to completion on the blocking thread pool.
    Blocking(Box<dyn FnOnce() -> anyhow::Result<T> + Send + 'static>),
}

impl<T: Send + 'static> Operation<T> {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Operation::Async(Box::new(move || Box::pin(f())))
    }

    pub fn from_blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Operation::Blocking(Box::new(f))
    }

    /// Start the operation on its own task so a panic stays contained.
    pub(crate) fn spawn(self) -> JoinHandle<anyhow::Result<T>> {
        match self {
            Operation::Async(f) => tokio::spawn(f()),
            Operation::Blocking(f) => tokio::task::spawn_blocking(f),
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Operation::Blocking(_))
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Async(_) => f.write_str("Operation::Async"),
            Operation::Blocking(_) => f.write_str("Operation::Blocking"),
        }
    }
}

/// An operation in flight between a producer and a worker.
pub struct WorkItem<T> {
    pub id: WorkId,
    pub operation: Operation<T>,
    respond_to: oneshot::Sender<Result<T>>,
    submitted_at: Instant,
}

impl<T> WorkItem<T> {
    /// Pair a new item with the ticket its producer waits on.
    pub fn new(operation: Operation<T>) -> (Self, Ticket<T>) {
        let (tx, rx) = oneshot::channel();
        let id = WorkId::new();
        (
            Self {
                id,
                operation,
                respond_to: tx,
                submitted_at: Instant::now(),
            },
            Ticket { id, rx },
        )
    }

    /// The producer dropped its ticket.
    pub fn is_cancelled(&self) -> bool {
        self.respond_to.is_closed()
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Split into the operation and the response half.
    pub(crate) fn into_parts(self) -> (WorkId, Operation<T>, Responder<T>) {
        (
            self.id,
            self.operation,
            Responder {
                tx: self.respond_to,
            },
        )
    }

    /// Fail the item back to its producer without running it.
    pub(crate) fn reject(self, error: Error) {
        let _ = self.respond_to.send(Err(error));
    }
}

impl<T> std::fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

/// Sending half of an item's result channel. Consumed by `send`.
pub(crate) struct Responder<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Responder<T> {
    /// Resolves once the producer drops its ticket.
    pub(crate) async fn closed(&mut self) {
        self.tx.closed().await
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Deliver the result. Returns false if nobody is listening anymore.
    pub(crate) fn send(self, result: Result<T>) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Producer handle for one submitted item.
///
/// Dropping the ticket cancels the item: a worker that has not started it
/// skips it, and an async operation already running is aborted.
#[derive(Debug)]
pub struct Ticket<T> {
    id: WorkId,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    pub fn id(&self) -> WorkId {
        self.id
    }

    /// Wait for the result.
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            // The item was dropped without a reply, e.g. during shutdown.
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Wait for the result, giving up after `limit`. Giving up drops the
    /// ticket, which cancels the item.
    pub async fn wait_timeout(self, limit: Duration) -> Result<T> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        }
    }

    /// Explicitly give up on the item.
    pub fn cancel(self) {}
}
