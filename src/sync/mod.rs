//! The sync module provides the synchronization primitives the streaming pipeline is built from.
//!
//! - [`ring_buffer`] provides a fixed-capacity circular buffer with atomic cursors.
//! - [`queue`] builds the two work queues of the pipeline on top of it: a lock-free round-robin queue from one
//! writer to many readers, and a mutex-guarded queue from many writers to one reader.
//! - [`condition`] provides [`Condition`](condition::Condition), used to put the coordinator and workers to sleep
//! until there is work.
//! - [`latch`] provides [`Latch`](latch::Latch), the one-shot completion signal of a single asset.

pub mod condition;
pub mod latch;
pub mod queue;
pub mod ring_buffer;
