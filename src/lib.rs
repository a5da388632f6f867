//! Lock-free concurrent queues for high-throughput producer/consumer
//! coordination between threads.
//!
//! Two building blocks are exported:
//!
//! - [`UnboundedQueue`]: a single Michael–Scott-style lock-free FIFO with
//!   an embedded freelist for node recycling. Supports both single- and
//!   multi-producer enqueue, and single- and multi-consumer dequeue, as
//!   distinct operations the caller picks based on what concurrency it can
//!   actually guarantee at a given call site.
//! - [`ShardedQueue`]: N independent [`UnboundedQueue`]s behind one handle.
//!   Producer threads are pinned to a subqueue on first use; consumer
//!   threads keep a per-thread polling order that adapts toward whichever
//!   subqueues keep paying off.
//!
//! Neither type guarantees strict FIFO order across distinct producers, or
//! fairness between consumers, and neither blocks — callers drive their
//! own wait strategy (spin, yield, or back off) around a `None` result.

mod saq;
mod ulq;

pub use saq::ShardedQueue;
pub use ulq::UnboundedQueue;
