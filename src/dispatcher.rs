//! The balancer: routes each submitted item to the least loaded worker.
//!
//! A single task owns the [`WorkerPool`] and is its only writer. It waits on
//! two sources at once: commands from producers (new work, snapshot requests,
//! shutdown) and completion signals from workers. Every pool mutation happens
//! on that task, so the pool needs no locking.
//!
//! Shutdown drains rather than drops: the loop stops accepting commands,
//! dispatches whatever was already buffered, closes every worker queue, and
//! keeps servicing completions until every worker has exited.

use std::future::Future;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{PoolSnapshot, WorkerId};
use crate::pool::WorkerPool;
use crate::telemetry::metrics;
use crate::work::{Operation, Ticket, WorkItem};
use crate::worker::WorkerHandle;

/// Pool sizing and producer-facing limits.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Fixed number of workers.
    pub workers: usize,
    /// Capacity of each worker's inbound queue. Sized to the number of
    /// producers so each can have one item queued on any worker.
    pub max_producers: usize,
    /// Capacity of the shared submission channel.
    pub submission_capacity: usize,
    /// Default limit for [`DispatcherHandle::submit`]. `None` waits forever.
    pub submit_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_producers: 64,
            submission_capacity: 1024,
            submit_timeout: None,
        }
    }
}

/// Everything the dispatcher task can be asked to do by a producer.
enum Command<T> {
    Submit(WorkItem<T>),
    Snapshot(oneshot::Sender<PoolSnapshot>),
    Shutdown,
}

/// The dispatcher task state.
pub struct Dispatcher<T> {
    pool: WorkerPool<WorkerHandle<T>>,
    commands: mpsc::Receiver<Command<T>>,
    completions: mpsc::UnboundedReceiver<WorkerId>,
    dispatched: u64,
    completions_seen: u64,
    finished: watch::Sender<Option<PoolSnapshot>>,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Spawn the workers and build the dispatcher, without starting its loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &DispatchConfig) -> Result<(Self, DispatcherHandle<T>)> {
        if config.workers == 0 {
            return Err(Error::Config("worker count must be at least 1".to_string()));
        }
        if config.submission_capacity == 0 {
            return Err(Error::Config(
                "submission capacity must be at least 1".to_string(),
            ));
        }

        let (done, completions) = mpsc::unbounded_channel();
        let workers = (0..config.workers)
            .map(|i| WorkerHandle::spawn(WorkerId(i), config.max_producers, done.clone()));
        let pool = WorkerPool::new(workers);
        // Only workers hold completion senders from here on.
        drop(done);

        let (tx, commands) = mpsc::channel(config.submission_capacity);
        let (finished, finished_rx) = watch::channel(None);

        let dispatcher = Self {
            pool,
            commands,
            completions,
            dispatched: 0,
            completions_seen: 0,
            finished,
        };
        let handle = DispatcherHandle {
            tx,
            finished: finished_rx,
            submit_timeout: config.submit_timeout,
        };
        Ok((dispatcher, handle))
    }

    /// Build the dispatcher and run its loop on a background task.
    pub fn spawn(config: &DispatchConfig) -> Result<DispatcherHandle<T>> {
        let (dispatcher, handle) = Self::new(config)?;
        tokio::spawn(dispatcher.run());
        Ok(handle)
    }

    /// Run until shutdown is requested or every handle is dropped, then
    /// drain. Returns the final snapshot.
    pub async fn run(mut self) -> PoolSnapshot {
        info!(workers = self.pool.len(), "dispatcher started");

        loop {
            // No bias: neither source can be starved by the select itself.
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(item)) => self.dispatch(item),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown) => {
                        info!("dispatcher shutdown requested");
                        break;
                    }
                    None => {
                        info!("all dispatcher handles dropped");
                        break;
                    }
                },
                Some(worker) = self.completions.recv() => self.completed(worker),
            }
        }

        self.drain().await
    }

    /// Assign an item to the least loaded worker.
    fn dispatch(&mut self, item: WorkItem<T>) {
        if item.is_cancelled() {
            debug!(work_id = %item.id, "dropping item cancelled before dispatch");
            metrics::work_cancelled().add(1, &[KeyValue::new("stage", "submitted")]);
            return;
        }

        let Some(worker) = self.pool.remove_least_loaded() else {
            item.reject(Error::Closed);
            return;
        };

        let work_id = item.id;
        let enqueued = match self.pool.get(worker) {
            Some(handle) => handle.enqueue(item),
            None => Err(Error::Closed),
        };

        match enqueued {
            Ok(()) => {
                self.pool.incr(worker);
                self.dispatched += 1;
                metrics::work_dispatched().add(1, &[KeyValue::new("worker", worker.0 as i64)]);
                debug!(
                    %work_id,
                    worker = %worker,
                    pending = self.pool.pending(worker).unwrap_or_default(),
                    "dispatched"
                );
            }
            Err(e) => {
                let reason = match e {
                    Error::Saturated { .. } => "saturated",
                    _ => "closed",
                };
                metrics::work_rejected().add(1, &[KeyValue::new("reason", reason)]);
                warn!(%work_id, worker = %worker, error = %e, "dispatch rejected");
            }
        }

        self.pool.insert(worker);
    }

    /// A worker finished one item: lower its load and reposition it.
    fn completed(&mut self, worker: WorkerId) {
        // The worker may sit anywhere in the heap, not just at the root.
        let Some(position) = self.pool.position(worker) else {
            warn!(worker = %worker, "completion from a worker not in the pool");
            return;
        };
        self.pool.remove_at(position);
        self.pool.decr(worker);
        self.pool.insert(worker);
        self.completions_seen += 1;

        metrics::work_completed().add(1, &[KeyValue::new("worker", worker.0 as i64)]);
        debug!(
            worker = %worker,
            pending = self.pool.pending(worker).unwrap_or_default(),
            "completed"
        );
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            workers: self.pool.loads(),
            dispatched: self.dispatched,
            completed: self.completions_seen,
            heap_ordered: self.pool.is_heap(),
        }
    }

    async fn drain(mut self) -> PoolSnapshot {
        self.commands.close();

        // Submissions that were buffered before the close still get a worker.
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Submit(item) => self.dispatch(item),
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown => {}
            }
        }

        for worker in self.pool.members_mut() {
            worker.close();
        }

        // Ends once every worker has drained its queue and dropped its sender.
        while let Some(worker) = self.completions.recv().await {
            self.completed(worker);
        }

        let snapshot = self.snapshot();
        for worker in self.pool.into_members() {
            debug!(worker = %worker.id(), "joining worker");
            worker.join().await;
        }

        info!(
            dispatched = snapshot.dispatched,
            completed = snapshot.completed,
            "dispatcher stopped"
        );
        self.finished.send_replace(Some(snapshot.clone()));
        snapshot
    }
}

/// Producer-facing handle to a running dispatcher. Cheap to clone.
pub struct DispatcherHandle<T> {
    tx: mpsc::Sender<Command<T>>,
    finished: watch::Receiver<Option<PoolSnapshot>>,
    submit_timeout: Option<Duration>,
}

impl<T> Clone for DispatcherHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            finished: self.finished.clone(),
            submit_timeout: self.submit_timeout,
        }
    }
}

impl<T: Send + 'static> DispatcherHandle<T> {
    /// Hand an operation to the dispatcher and return its ticket.
    ///
    /// Waits only for room on the submission channel, never for the result.
    pub async fn enqueue(&self, operation: Operation<T>) -> Result<Ticket<T>> {
        let (item, ticket) = WorkItem::new(operation);
        self.tx
            .send(Command::Submit(item))
            .await
            .map_err(|_| Error::Closed)?;
        Ok(ticket)
    }

    /// Submit an async operation and wait for its result, bounded by the
    /// configured submit timeout if any.
    pub async fn submit<F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit_operation(Operation::from_async(f)).await
    }

    /// Submit a blocking closure and wait for its result.
    pub async fn submit_blocking<F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_operation(Operation::from_blocking(f)).await
    }

    /// Submit with an explicit limit covering both submission and execution.
    /// On timeout the item is cancelled.
    pub async fn submit_with_timeout<F, Fut>(&self, f: F, limit: Duration) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.round_trip(Operation::from_async(f), Some(limit)).await
    }

    pub async fn submit_operation(&self, operation: Operation<T>) -> Result<T> {
        self.round_trip(operation, self.submit_timeout).await
    }

    async fn round_trip(&self, operation: Operation<T>, limit: Option<Duration>) -> Result<T> {
        let exchange = async {
            let ticket = self.enqueue(operation).await?;
            ticket.wait().await
        };
        match limit {
            // Dropping the exchange drops the ticket, which cancels the item.
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => exchange.await,
        }
    }

    /// Consistent view of the pool, taken on the dispatcher task. After
    /// shutdown this is the final snapshot.
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(reply)).await.is_ok() {
            if let Ok(snapshot) = rx.await {
                return Ok(snapshot);
            }
        }
        self.final_snapshot().await
    }

    /// Stop accepting work, drain everything already accepted, and return
    /// the final snapshot. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<PoolSnapshot> {
        let _ = self.tx.send(Command::Shutdown).await;
        self.final_snapshot().await
    }

    /// Whether the dispatcher has stopped accepting submissions.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn final_snapshot(&self) -> Result<PoolSnapshot> {
        let mut finished = self.finished.clone();
        let snapshot = finished
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Closed)?;
        snapshot.clone().ok_or(Error::Closed)
    }
}
