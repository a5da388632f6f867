//! The Sharded Adaptive Queue: N independent [`UnboundedQueue`]s behind
//! one handle, with thread-affine producer routing and a per-consumer-
//! thread polling order that adapts toward whichever subqueues keep
//! paying off.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::ulq::UnboundedQueue;

/// Rust's `thread_local!` is keyed by the static item, not by queue
/// instance, so a single thread-local slot can't serve several
/// independent `ShardedQueue`s sharing a thread. Each queue gets a
/// process-wide unique id at construction and the thread-local state is
/// a small map keyed by that id instead.
static NEXT_INSTANCE_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static PRODUCER_SHARD: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
    static CONSUMER_HITLIST: RefCell<HashMap<usize, Vec<usize>>> = RefCell::new(HashMap::new());
}

/// N independent unbounded queues. Producers are pinned to one subqueue
/// on first use; each consumer thread keeps its own permutation of
/// subqueue indices ("hitlist") that it reorders toward whatever keeps
/// yielding elements.
///
/// Each instance's thread-local routing and hitlist state is reclaimed on
/// `Drop`, but only for the thread that drops the queue — `Drop` can't
/// reach into other threads' thread-local storage. A thread that touches a
/// queue and then never touches another one (and never drops this one
/// itself) keeps that queue's thread-local entry until the thread exits.
pub struct ShardedQueue<T> {
    shards: Box<[CachePadded<UnboundedQueue<T>>]>,
    next_shard: AtomicUsize,
    id: usize,
}

impl<T> ShardedQueue<T> {
    /// Creates a queue with `shard_count` independent subqueues.
    ///
    /// # Panics
    ///
    /// Panics if `shard_count` is zero.
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count >= 1, "ShardedQueue needs at least one shard");
        let shards = (0..shard_count)
            .map(|_| CachePadded::new(UnboundedQueue::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ShardedQueue {
            shards,
            next_shard: AtomicUsize::new(0),
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of subqueues.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn producer_shard(&self) -> usize {
        PRODUCER_SHARD.with(|slots| {
            *slots
                .borrow_mut()
                .entry(self.id)
                .or_insert_with(|| self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len())
        })
    }

    /// Appends `v`, routing to the calling thread's assigned subqueue
    /// (assigned once, on that thread's first enqueue, and reused for the
    /// thread's lifetime).
    pub fn enqueue(&self, v: T) {
        let idx = self.producer_shard();
        self.shards[idx].mp_enqueue(v);
    }

    /// Appends `v` to a caller-chosen subqueue, bypassing auto-assignment.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.shard_count()`.
    pub fn enqueue_to(&self, v: T, index: usize) {
        self.shards[index].mp_enqueue(v);
    }

    fn with_hitlist<R>(&self, f: impl FnOnce(&mut Vec<usize>) -> R) -> R {
        CONSUMER_HITLIST.with(|map| {
            let mut map = map.borrow_mut();
            let perm = map
                .entry(self.id)
                .or_insert_with(|| (0..self.shards.len()).collect());
            f(perm)
        })
    }

    /// Moves a hit at permutation position `pos` one step toward the
    /// front: a single transpose with its predecessor, so a subqueue that
    /// keeps winning walks to the front over several hits rather than
    /// jumping there in one.
    fn promote(perm: &mut [usize], pos: usize) {
        if pos > 0 {
            perm.swap(pos, pos - 1);
        }
    }

    /// Removes the front element of whichever subqueue yields one first,
    /// scanning in this thread's learned order. The caller guarantees no
    /// other consumer runs concurrently on this queue.
    pub fn sc_dequeue(&self) -> Option<T> {
        self.with_hitlist(|perm| {
            for i in 0..perm.len() {
                let idx = perm[i];
                if let Some(v) = self.shards[idx].sc_dequeue() {
                    Self::promote(perm, i);
                    return Some(v);
                }
            }
            None
        })
    }

    /// Removes the front element of whichever subqueue yields one first.
    /// Safe under arbitrary consumer concurrency. Makes a first pass over
    /// every subqueue with the non-spinning dequeue to skim for easy
    /// wins, then a second pass with the spinning dequeue to wait out
    /// contention.
    pub fn mc_dequeue(&self) -> Option<T> {
        self.with_hitlist(|perm| {
            for i in 0..perm.len() {
                let idx = perm[i];
                if let Some(v) = self.shards[idx].mc_dequeue_light() {
                    Self::promote(perm, i);
                    return Some(v);
                }
            }
            for i in 0..perm.len() {
                let idx = perm[i];
                if let Some(v) = self.shards[idx].mc_dequeue() {
                    Self::promote(perm, i);
                    return Some(v);
                }
            }
            None
        })
    }
}

impl<T> Drop for ShardedQueue<T> {
    /// Removes this queue's entry from the dropping thread's thread-local
    /// routing/hitlist maps. This only reclaims the dropping thread's own
    /// slot: any other thread that touched this queue keeps a stale
    /// `self.id` entry in its `PRODUCER_SHARD`/`CONSUMER_HITLIST` map until
    /// that thread itself drops a queue (which runs this same cleanup) or
    /// exits. A long-running program that touches many short-lived
    /// `ShardedQueue`s from a fixed pool of long-lived threads will not
    /// leak; one that creates queues on one thread and only ever uses them
    /// from other threads will accumulate one stale entry per queue per
    /// other thread.
    fn drop(&mut self) {
        PRODUCER_SHARD.with(|slots| {
            slots.borrow_mut().remove(&self.id);
        });
        CONSUMER_HITLIST.with(|map| {
            map.borrow_mut().remove(&self.id);
        });
    }
}
