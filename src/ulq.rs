//! The Unbounded Linked Queue: a Michael–Scott lock-free FIFO with an
//! embedded freelist for node recycling.

use std::ptr;

#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, Ordering};
#[cfg(not(loom))]
use std::thread;

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, Ordering};
#[cfg(loom)]
use loom::thread;

use crossbeam::utils::CachePadded;

/// A node on either the main list or the freelist. `data` is only
/// meaningful while the node is a live member of the main list (between
/// `tail` and `head`); freelist nodes always hold `None`.
struct Node<T> {
    data: Option<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            data: None,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// A Treiber-style freelist used only to recycle nodes between the main
/// list's dequeue and enqueue sides. Enqueue mirrors the main list's MP
/// enqueue (swap `head`, then link the predecessor). Dequeue walks the
/// sentinel's `next` and advances `tail` with a compare-exchange retry
/// loop: unlike a strict single-consumer dequeue, multiple producers can
/// race here via `acquire_or_allocate`, so the loop — not a single CAS
/// attempt — is what keeps it correct.
struct Freelist<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
}

impl<T> Freelist<T> {
    fn new() -> Self {
        let sentinel = Node::sentinel();
        Freelist {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
        }
    }

    /// Publish `node` onto the freelist. `node` must not be reachable from
    /// anywhere else once this call starts.
    fn push(&self, node: *mut Node<T>) {
        // SAFETY: caller has exclusive ownership of `node` (it was just
        // unlinked from the main list by its one permitted owner).
        unsafe {
            (*node).data = None;
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        let prev = self.head.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` was a live freelist node (the prior head), never
        // freed while the freelist exists.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Pop a node for reuse, or `None` if the freelist is empty.
    fn try_pop(&self) -> Option<*mut Node<T>> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: `tail` is always a live freelist node.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                return None;
            }
            if self
                .tail
                .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(tail);
            }
            // Lost the race to another acquirer; reload and retry.
        }
    }

    /// Drain and free every node reachable from `tail`.
    fn drain_and_drop(&mut self) {
        let mut cur = self.tail.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: each node on the freelist is owned by exactly this
            // list and freed exactly once, here.
            unsafe {
                let next = (*cur).next.load(Ordering::Relaxed);
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
    }
}

/// An unbounded, lock-free FIFO queue.
///
/// Every operation is named for the concurrency it requires of its
/// caller: `sp_*`/`sc_*` assume a single producer/consumer respectively
/// and skip the synchronization a concurrent peer would need; `mp_*`/
/// `mc_*` are safe under arbitrary producer/consumer concurrency. Mixing,
/// e.g., `sp_enqueue` calls from two different threads at once is
/// undefined behavior — the caller is responsible for the guarantee the
/// chosen operation assumes.
pub struct UnboundedQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    free: Freelist<T>,
}

// The queue moves `T` across threads but never lets two threads touch the
// same live `T` concurrently; `Sync` requires `T: Send`, not `T: Sync`.
unsafe impl<T: Send> Send for UnboundedQueue<T> {}
unsafe impl<T: Send> Sync for UnboundedQueue<T> {}

impl<T> UnboundedQueue<T> {
    /// Creates a new, empty queue.
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        UnboundedQueue {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            free: Freelist::new(),
        }
    }

    /// Obtain a node for a fresh payload, preferring the freelist over a
    /// new allocation.
    fn acquire_or_allocate(&self, v: T) -> *mut Node<T> {
        match self.free.try_pop() {
            Some(node) => {
                // SAFETY: `node` was just detached from the freelist; we
                // are its sole owner until we publish it below.
                unsafe {
                    (*node).data = Some(v);
                    (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
                }
                node
            }
            None => Box::into_raw(Box::new(Node {
                data: Some(v),
                next: AtomicPtr::new(ptr::null_mut()),
            })),
        }
    }

    /// Appends `v`. The caller guarantees no other producer runs
    /// concurrently on this queue.
    pub fn sp_enqueue(&self, v: T) {
        let n = self.acquire_or_allocate(v);
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: `head` is live; no concurrent producer can be mutating
        // its `next` under the single-producer contract.
        unsafe { (*head).next.store(n, Ordering::Release) };
        self.head.store(n, Ordering::Relaxed);
    }

    /// Appends `v`. Safe under arbitrary producer concurrency.
    pub fn mp_enqueue(&self, v: T) {
        let n = self.acquire_or_allocate(v);
        let prev = self.head.swap(n, Ordering::AcqRel);
        // There is a brief window here where `prev` is unreachable from
        // `head` (we already swung it past `prev`) but `prev.next` isn't
        // linked yet. Consumers treat a null `next` on the current front
        // as empty-or-transient and simply don't observe `n` until this
        // store lands.
        // SAFETY: `prev` was live at the time of the swap and is never
        // freed while reachable as a predecessor awaiting its link.
        unsafe { (*prev).next.store(n, Ordering::Release) };
    }

    /// Removes the front element if any. The caller guarantees no other
    /// consumer runs concurrently on this queue.
    pub fn sc_dequeue(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        // SAFETY: `tail` is live; no concurrent consumer under the
        // single-consumer contract.
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // SAFETY: `next` was just published by an enqueue with Release
        // ordering, matched by the Acquire load above.
        let v = unsafe { (*next).data.take() };
        self.tail.store(next, Ordering::Release);
        self.free.push(tail);
        v
    }

    /// Removes the front element if any. Safe under arbitrary consumer
    /// concurrency; spins (yielding the scheduling quantum) while another
    /// consumer holds the tail.
    pub fn mc_dequeue(&self) -> Option<T> {
        loop {
            let tail = self.tail.swap(ptr::null_mut(), Ordering::AcqRel);
            if tail.is_null() {
                thread::yield_now();
                continue;
            }
            // SAFETY: we now hold exclusive ownership of `tail` (every
            // other consumer will see `null` and either spin or bail).
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                // Empty: nothing to consume, hand `tail` back.
                self.tail.store(tail, Ordering::Release);
                return None;
            }
            let v = unsafe { (*next).data.take() };
            self.tail.store(next, Ordering::Release);
            self.free.push(tail);
            return v;
        }
    }

    /// Removes the front element if any. Safe under arbitrary consumer
    /// concurrency; never blocks. Returns `None` both on an empty queue
    /// and when another consumer currently holds the tail — callers
    /// cannot (and need not) distinguish the two.
    pub fn mc_dequeue_light(&self) -> Option<T> {
        let tail = self.tail.swap(ptr::null_mut(), Ordering::AcqRel);
        if tail.is_null() {
            // Another consumer holds the tail right now.
            return None;
        }
        // SAFETY: see `mc_dequeue`.
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            self.tail.store(tail, Ordering::Release);
            return None;
        }
        let v = unsafe { (*next).data.take() };
        self.tail.store(next, Ordering::Release);
        self.free.push(tail);
        v
    }
}

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UnboundedQueue<T> {
    fn drop(&mut self) {
        let mut cur = self.tail.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: every node reachable from `tail` at drop time is
            // owned solely by this queue and freed exactly once.
            unsafe {
                let next = (*cur).next.load(Ordering::Relaxed);
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
        self.free.drain_and_drop();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc::channel;

    #[test]
    fn single_threaded_round_trip() {
        let q = UnboundedQueue::new();
        q.sp_enqueue(1);
        q.sp_enqueue(2);
        q.sp_enqueue(3);
        assert_eq!(q.sc_dequeue(), Some(1));
        assert_eq!(q.sc_dequeue(), Some(2));
        assert_eq!(q.sc_dequeue(), Some(3));
        assert_eq!(q.sc_dequeue(), None);
    }

    #[test]
    fn liveness_under_no_contention() {
        let q = UnboundedQueue::new();
        q.sp_enqueue(42);
        assert_eq!(q.sc_dequeue(), Some(42));
    }

    #[test]
    fn mc_dequeue_light_on_empty_is_none() {
        let q: UnboundedQueue<i32> = UnboundedQueue::new();
        assert_eq!(q.mc_dequeue_light(), None);
        assert_eq!(q.mc_dequeue(), None);
    }

    #[test]
    fn freelist_reuse_after_drain_and_refill() {
        // Not a precise allocation count (we don't instrument the
        // allocator here), but a behavioral proxy: after K enqueues and K
        // dequeues, the queue must still function correctly for another K
        // enqueues, exercising every recycled node.
        let q = UnboundedQueue::new();
        for i in 0..1000 {
            q.sp_enqueue(i);
        }
        for i in 0..1000 {
            assert_eq!(q.sc_dequeue(), Some(i));
        }
        for i in 1000..2000 {
            q.sp_enqueue(i);
        }
        for i in 1000..2000 {
            assert_eq!(q.sc_dequeue(), Some(i));
        }
        assert_eq!(q.sc_dequeue(), None);
    }

    #[test]
    fn spsc_stress() {
        const COUNT: i64 = 999_999;
        let q = Arc::new(UnboundedQueue::new());
        let producer = q.clone();
        let (done_tx, done_rx) = channel();
        let handle = std::thread::spawn(move || {
            for i in 0..=COUNT {
                producer.mp_enqueue(i);
            }
            done_tx.send(()).unwrap();
        });

        let mut next = 0;
        loop {
            if let Some(v) = q.mc_dequeue_light() {
                assert_eq!(v, next);
                next += 1;
                if next > COUNT {
                    break;
                }
            }
        }
        done_rx.recv().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn mpmc_conservation() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        const PER_PRODUCER: i32 = 50_000;
        const PRODUCERS: i32 = 4;
        const TOTAL: i32 = PER_PRODUCER * PRODUCERS;

        let q = Arc::new(UnboundedQueue::new());
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let remaining = Arc::new(std::sync::atomic::AtomicI32::new(TOTAL));

        crossbeam::thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let q = q.clone();
                scope.spawn(move |_| {
                    let base = p * PER_PRODUCER;
                    for i in 0..PER_PRODUCER {
                        q.mp_enqueue(base + i);
                    }
                });
            }

            for _ in 0..4 {
                let q = q.clone();
                let seen = seen.clone();
                let remaining = remaining.clone();
                scope.spawn(move |_| {
                    while remaining.load(Ordering::Relaxed) > 0 {
                        if let Some(v) = q.mc_dequeue() {
                            let mut seen = seen.lock().unwrap();
                            assert!(seen.insert(v), "duplicate dequeue of {v}");
                            drop(seen);
                            remaining.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        })
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), TOTAL as usize);
        for v in 0..TOTAL {
            assert!(seen.contains(&v));
        }
    }

    #[test]
    fn contention_signalling_mc_dequeue_light_on_empty() {
        // Two consumers hammering mc_dequeue_light on an empty queue: each
        // must observe at least one None, whether from the queue being
        // empty or from losing the tail-swap race to the other thread.
        let q: Arc<UnboundedQueue<i32>> = Arc::new(UnboundedQueue::new());
        crossbeam::thread::scope(|scope| {
            for _ in 0..2 {
                let q = q.clone();
                scope.spawn(move |_| {
                    let mut saw_none = false;
                    for _ in 0..10_000 {
                        if q.mc_dequeue_light().is_none() {
                            saw_none = true;
                        }
                    }
                    assert!(saw_none);
                });
            }
        })
        .unwrap();
    }

    #[test]
    fn destruction_safety() {
        let q = UnboundedQueue::new();
        for i in 0..10 {
            q.sp_enqueue(Box::new(i));
        }
        for _ in 0..5 {
            q.sc_dequeue();
        }
        drop(q);
    }
}
