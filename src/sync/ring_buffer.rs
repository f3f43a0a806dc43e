//! Fixed-capacity circular buffers.
//!
//! Both cursors increase monotonically and are only wrapped (modulo the capacity) when a slot is accessed,
//! so `write - read` is always the number of items in the ring. A ring with a single producer and a single
//! consumer needs no locking at all, which is what the worker queues in [`queue`](crate::sync::queue) rely on.
//!
//! # Example
//! ```
//! use deimos::sync::ring_buffer::RingBuffer;
//!
//! let mut ring = RingBuffer::new(2);
//! ring.push(1).unwrap();
//! ring.push(2).unwrap();
//! // The ring is full, so the item is handed back instead of overwriting old data.
//! assert_eq!(ring.push(3).unwrap_err().into_inner(), 3);
//! assert_eq!(ring.pop(), Some(1));
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returned when pushing into a full queue. Contains the rejected item so it can be retried or dropped.
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    /// Obtain the item that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is at capacity")
    }
}

impl<T> std::error::Error for QueueFull<T> {}

/// Shared ring storage. Safe wrappers decide who may push and who may pop.
pub(crate) struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    read: AtomicUsize,
    write: AtomicUsize,
}

// SAFETY: Items are moved in by the producer and moved out by the consumer. Every slot is owned by exactly one
// side at a time, which is tracked by the cursors.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be at least one");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Push an item, or hand it back if the ring is full.
    /// # Safety
    /// No other thread may call [`Self::push()`] concurrently.
    pub(crate) unsafe fn push(&self, item: T) -> Result<(), QueueFull<T>> {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        if write.wrapping_sub(read) >= self.capacity() {
            return Err(QueueFull(item));
        }
        let slot = &self.slots[write % self.capacity()];
        (*slot.get()).write(item);
        self.write.store(write.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop the oldest item.
    /// # Safety
    /// No other thread may call [`Self::pop()`] concurrently.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let slot = &self.slots[read % self.capacity()];
        let item = (*slot.get()).assume_init_read();
        self.read.store(read.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // SAFETY: We have exclusive access.
        while unsafe { self.pop() }.is_some() {}
    }
}

/// A fixed-capacity FIFO queue with exclusive access.
///
/// Pushing into a full ring fails with [`QueueFull`] and never overwrites unread items.
pub struct RingBuffer<T> {
    ring: Ring<T>,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer that can hold `capacity` items.
    /// # Panics
    /// Panics if the capacity is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::new(capacity),
        }
    }

    /// Drop all unread items and change the capacity.
    pub fn reset(&mut self, capacity: usize) {
        self.ring = Ring::new(capacity);
    }

    /// Push an item to the back of the queue.
    /// # Errors
    /// Fails and returns the item if the queue is full.
    pub fn push(&mut self, item: T) -> Result<(), QueueFull<T>> {
        // SAFETY: We hold a unique reference.
        unsafe { self.ring.push(item) }
    }

    /// Remove and return the oldest unread item.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: We hold a unique reference.
        unsafe { self.ring.pop() }
    }

    /// Number of unread items.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_wrap_around_the_storage() {
        let mut ring = RingBuffer::new(3);
        for round in 0..10 {
            ring.push(round).unwrap();
            ring.push(round + 100).unwrap();
            assert_eq!(ring.pop(), Some(round));
            assert_eq!(ring.pop(), Some(round + 100));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn unread_items_are_dropped() {
        use std::sync::Arc;
        let item = Arc::new(());
        {
            let mut ring = RingBuffer::new(4);
            ring.push(item.clone()).unwrap();
            ring.push(item.clone()).unwrap();
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }
}
