//! Work distribution queues built on top of [`RingBuffer`](crate::sync::ring_buffer::RingBuffer).
//!
//! - [`SingleWriterManyReadersQueue`] is used by the coordinator to hand tasks to workers. Every reader owns one
//!   ring, so pushing and popping never takes a lock.
//! - [`ManyWritersSingleReaderQueue`] is used to collect work from many threads into one consumer. It guards a
//!   single ring with a mutex.
//!
//! Neither queue ever blocks or grows. A full queue rejects the push with [`QueueFull`] and the caller decides
//! how to apply backpressure.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::sync::ring_buffer::{QueueFull, Ring, RingBuffer};

/// Writing half of a single producer, multiple consumer queue. Every reader owns a private ring.
///
/// # Example
/// ```
/// use deimos::sync::queue::SingleWriterManyReadersQueue;
///
/// let (mut writer, mut readers) = SingleWriterManyReadersQueue::new(2, 4);
/// writer.push("a").unwrap();
/// writer.push("b").unwrap();
/// assert_eq!(readers[0].pop(), Some("a"));
/// assert_eq!(readers[1].pop(), Some("b"));
/// ```
pub struct SingleWriterManyReadersQueue<T> {
    rings: Arc<[Ring<T>]>,
    next: usize,
}

/// Reading half of a [`SingleWriterManyReadersQueue`]. Each reader sees only the items pushed to its own ring.
pub struct QueueReader<T> {
    rings: Arc<[Ring<T>]>,
    index: usize,
}

impl<T: Send> SingleWriterManyReadersQueue<T> {
    /// Create a queue with `readers` reader rings that can each hold `capacity` items.
    /// # Panics
    /// Panics if there are no readers or the capacity is zero.
    pub fn new(readers: usize, capacity: usize) -> (Self, Vec<QueueReader<T>>) {
        assert!(readers > 0, "queue needs at least one reader");
        let rings: Arc<[Ring<T>]> = (0..readers).map(|_| Ring::new(capacity)).collect();
        let handles = (0..readers)
            .map(|index| QueueReader {
                rings: rings.clone(),
                index,
            })
            .collect();
        (Self { rings, next: 0 }, handles)
    }

    /// Push an item to the next reader in round-robin order. If that reader's ring is full, the following
    /// readers are tried in order. Returns the index of the reader that received the item.
    /// # Errors
    /// Fails and returns the item if every reader ring is full.
    pub fn push(&mut self, item: T) -> Result<usize, QueueFull<T>> {
        let mut item = item;
        for attempt in 0..self.rings.len() {
            let index = (self.next + attempt) % self.rings.len();
            // SAFETY: The writer is unique and pushing requires a mutable reference to it.
            match unsafe { self.rings[index].push(item) } {
                Ok(()) => {
                    self.next = (index + 1) % self.rings.len();
                    return Ok(index);
                }
                Err(QueueFull(rejected)) => item = rejected,
            }
        }
        Err(QueueFull(item))
    }

    /// Push an item to one specific reader.
    /// # Errors
    /// Fails and returns the item if that reader's ring is full.
    pub fn push_to(&mut self, reader: usize, item: T) -> Result<(), QueueFull<T>> {
        // SAFETY: The writer is unique and pushing requires a mutable reference to it.
        unsafe { self.rings[reader].push(item) }
    }

    /// Push one item produced by `make` to every reader. Returns the readers whose ring was full, which
    /// did not receive an item. An empty result means the broadcast was delivered everywhere.
    pub fn broadcast(&mut self, mut make: impl FnMut() -> T) -> Vec<usize> {
        (0..self.rings.len())
            .filter(|&reader| self.push_to(reader, make()).is_err())
            .collect()
    }

    /// Number of readers.
    pub fn readers(&self) -> usize {
        self.rings.len()
    }

    /// Returns true if at least one reader ring can accept an item.
    pub fn has_space(&self) -> bool {
        self.rings.iter().any(|ring| !ring.is_full())
    }

    /// Returns true if the given reader ring can accept an item.
    pub fn has_space_for(&self, reader: usize) -> bool {
        !self.rings[reader].is_full()
    }

    /// Number of unread items in a reader's ring.
    pub fn len_of(&self, reader: usize) -> usize {
        self.rings[reader].len()
    }
}

impl<T> QueueReader<T> {
    /// Pop the oldest item from this reader's ring.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: Every reader is unique for its ring and popping requires a mutable reference to it.
        unsafe { self.rings[self.index].pop() }
    }

    pub fn len(&self) -> usize {
        self.rings[self.index].len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings[self.index].is_empty()
    }

    /// Index of this reader in the queue.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> fmt::Debug for SingleWriterManyReadersQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleWriterManyReadersQueue")
            .field("readers", &self.rings.len())
            .field("next", &self.next)
            .finish()
    }
}

impl<T> fmt::Debug for QueueReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueReader")
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

/// Multiple producer, single consumer queue. Any thread may push, one thread is expected to pop.
pub struct ManyWritersSingleReaderQueue<T> {
    ring: Mutex<RingBuffer<T>>,
}

impl<T> ManyWritersSingleReaderQueue<T> {
    /// Create a new queue that can hold `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingBuffer<T>> {
        // A panic while holding the lock cannot leave the ring in an inconsistent state.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an item to the back of the queue.
    /// # Errors
    /// Fails and returns the item if the queue is full.
    pub fn push(&self, item: T) -> Result<(), QueueFull<T>> {
        self.lock().push(item)
    }

    /// Remove and return the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.lock().pop()
    }

    /// Remove all items currently in the queue, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut ring = self.lock();
        let mut items = Vec::with_capacity(ring.len());
        while let Some(item) = ring.pop() {
            items.push(item);
        }
        items
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().is_full()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}

impl<T> fmt::Debug for ManyWritersSingleReaderQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManyWritersSingleReaderQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
