//! Core data model.
//!
//! Identifiers for work items and workers, plus the serializable view of the
//! pool that the dispatcher hands out on request.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

/// Dense worker index, `0..N` for a pool of N workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Load bookkeeping for one worker at the time of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub worker: WorkerId,
    /// Items handed to the worker that have not signalled completion.
    pub pending: usize,
    /// Items handed to the worker since startup.
    pub dispatched: u64,
    /// Index in the heap array. `None` only while the dispatcher holds the
    /// worker detached, which never outlives a single transition.
    pub position: Option<usize>,
}

/// Point-in-time view of the pool, taken on the dispatcher's own task so it
/// is always consistent with the ordering structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Ordered by worker id.
    pub workers: Vec<WorkerLoad>,
    /// Items handed to a worker queue since startup.
    pub dispatched: u64,
    /// Completion signals received since startup.
    pub completed: u64,
    /// Whether every parent's pending count is <= its children's.
    pub heap_ordered: bool,
}

impl PoolSnapshot {
    pub fn total_pending(&self) -> usize {
        self.workers.iter().map(|w| w.pending).sum()
    }

    /// Difference between the most and least loaded worker.
    pub fn spread(&self) -> usize {
        let max = self.workers.iter().map(|w| w.pending).max().unwrap_or(0);
        let min = self.workers.iter().map(|w| w.pending).min().unwrap_or(0);
        max - min
    }

    /// Sum of pending counts equals dispatched minus completed.
    pub fn is_conserved(&self) -> bool {
        self.dispatched >= self.completed
            && self.total_pending() as u64 == self.dispatched - self.completed
    }

    pub fn dispatched_to(&self, worker: WorkerId) -> Option<u64> {
        self.workers
            .iter()
            .find(|w| w.worker == worker)
            .map(|w| w.dispatched)
    }

    pub fn pending_of(&self, worker: WorkerId) -> Option<usize> {
        self.workers
            .iter()
            .find(|w| w.worker == worker)
            .map(|w| w.pending)
    }
}
