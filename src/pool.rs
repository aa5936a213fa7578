//! Worker pool ordered by pending load.
//!
//! Built on [`bheap::BinaryMaxHeap`], which tracks each entry's heap index by
//! uid. That index is what lets a worker anywhere in the heap be pulled out
//! after its load changes, instead of only the root.
//!
//! The pool is owned by the dispatcher task and is never shared, so it has no
//! internal locking. Pending counts can only be changed on a detached member
//! (one that has been removed from the heap), which keeps the heap property
//! intact by construction.

use std::cmp::Ordering;

use bheap::{BinaryMaxHeap, Uid};

use crate::model::{WorkerId, WorkerLoad};

/// Heap entry for one attached worker. The greatest entry sits at the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    worker: WorkerId,
    pending: usize,
    dispatched: u64,
    /// Set just before the entry is lifted out of the middle of the heap.
    leaving: bool,
}

impl Uid for Entry {
    fn uid(&self) -> u64 {
        self.worker.0 as u64
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Fewer pending wins. Ties go to the worker handed fewer items so
        // far, then to the lower id.
        self.leaving
            .cmp(&other.leaving)
            .then_with(|| other.pending.cmp(&self.pending))
            .then_with(|| other.dispatched.cmp(&self.dispatched))
            .then_with(|| other.worker.cmp(&self.worker))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Member<W> {
    handle: W,
    pending: usize,
    dispatched: u64,
    attached: bool,
}

impl<W> Member<W> {
    fn entry(&self, worker: WorkerId) -> Entry {
        Entry {
            worker,
            pending: self.pending,
            dispatched: self.dispatched,
            leaving: false,
        }
    }
}

/// Min-heap of pool members keyed by pending count.
pub struct WorkerPool<W> {
    members: Vec<Member<W>>,
    heap: BinaryMaxHeap<Entry>,
}

impl<W> WorkerPool<W> {
    /// Build a pool with every member attached and zero pending.
    ///
    /// Members are assigned ids in iteration order.
    pub fn new(members: impl IntoIterator<Item = W>) -> Self {
        let members: Vec<Member<W>> = members
            .into_iter()
            .map(|handle| Member {
                handle,
                pending: 0,
                dispatched: 0,
                attached: true,
            })
            .collect();
        let mut heap = BinaryMaxHeap::new();
        for (i, member) in members.iter().enumerate() {
            heap.push(member.entry(WorkerId(i)));
        }
        Self { members, heap }
    }

    /// Number of members, attached or not.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of members currently in the heap.
    pub fn attached(&self) -> usize {
        self.heap.len()
    }

    pub fn get(&self, id: WorkerId) -> Option<&W> {
        self.members.get(id.0).map(|m| &m.handle)
    }

    pub fn pending(&self, id: WorkerId) -> Option<usize> {
        self.members.get(id.0).map(|m| m.pending)
    }

    /// Heap index of an attached member.
    pub fn position(&self, id: WorkerId) -> Option<usize> {
        let member = self.members.get(id.0)?;
        if !member.attached {
            return None;
        }
        self.heap.index_in_heap_from_uid(id.0 as u64)
    }

    /// The member with the fewest pending items, without removing it.
    pub fn peek_least_loaded(&self) -> Option<WorkerId> {
        self.heap.peek().map(|e| e.worker)
    }

    /// Detach the least loaded member.
    pub fn remove_least_loaded(&mut self) -> Option<WorkerId> {
        let entry = self.heap.pop()?;
        self.members[entry.worker.0].attached = false;
        Some(entry.worker)
    }

    /// Detach the member stored at `position` in the heap.
    pub fn remove_at(&mut self, position: usize) -> Option<WorkerId> {
        if position >= self.heap.len() {
            return None;
        }
        let entry = self.heap.get(position)?;
        entry.leaving = true;
        let worker = entry.worker;

        // A leaving entry outranks everything, so it rises to the root.
        self.heap.restore_heap_property(position);
        let popped = self.heap.pop()?;
        debug_assert_eq!(popped.worker, worker);

        self.members[worker.0].attached = false;
        Some(worker)
    }

    /// Re-attach a detached member. Returns false if `id` is unknown or
    /// already in the heap.
    pub fn insert(&mut self, id: WorkerId) -> bool {
        let Some(member) = self.members.get_mut(id.0) else {
            return false;
        };
        if member.attached {
            return false;
        }
        member.attached = true;
        self.heap.push(member.entry(id));
        true
    }

    /// Record a dispatch on a detached member.
    pub(crate) fn incr(&mut self, id: WorkerId) {
        let member = &mut self.members[id.0];
        debug_assert!(!member.attached, "load changed while attached");
        member.pending += 1;
        member.dispatched += 1;
    }

    /// Record a completion on a detached member.
    pub(crate) fn decr(&mut self, id: WorkerId) {
        let member = &mut self.members[id.0];
        debug_assert!(!member.attached, "load changed while attached");
        member.pending = member.pending.saturating_sub(1);
    }

    /// Check `pending[parent] <= pending[child]` over the whole heap, using
    /// the positions the heap reports for each attached member.
    pub fn is_heap(&self) -> bool {
        let mut keys = vec![None; self.heap.len()];
        for (i, member) in self.members.iter().enumerate() {
            if !member.attached {
                continue;
            }
            match self.position(WorkerId(i)) {
                Some(at) if at < keys.len() && keys[at].is_none() => keys[at] = Some(member.pending),
                _ => return false,
            }
        }
        (1..keys.len()).all(|i| match (keys[(i - 1) / 2], keys[i]) {
            (Some(parent), Some(child)) => parent <= child,
            _ => false,
        })
    }

    /// Per-member load, ordered by id.
    pub fn loads(&self) -> Vec<WorkerLoad> {
        self.members
            .iter()
            .enumerate()
            .map(|(i, m)| WorkerLoad {
                worker: WorkerId(i),
                pending: m.pending,
                dispatched: m.dispatched,
                position: self.position(WorkerId(i)),
            })
            .collect()
    }

    /// Consume the pool, yielding members in id order.
    pub fn into_members(self) -> impl Iterator<Item = W> {
        self.members.into_iter().map(|m| m.handle)
    }

    pub fn members_mut(&mut self) -> impl Iterator<Item = &mut W> {
        self.members.iter_mut().map(|m| &mut m.handle)
    }
}
