//! State shared by the coordinator and the workers of one run of the loader.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::Device;
use crate::loader::task::Batch;
use crate::loader::Shared;
use crate::sync::condition::Condition;
use crate::sync::queue::ManyWritersSingleReaderQueue;

/// The coordinator's side of one worker.
pub(crate) struct WorkerLink<D: Device> {
    /// Batches pushed by the worker that did not execute yet.
    pub in_flight: AtomicUsize,
    /// Notified whenever `in_flight` decreases. Only the owning worker waits on it.
    pub drained: Condition,
    /// Executed command buffers, to be freed by the worker that recorded them.
    pub retired: Mutex<Vec<D::CommandBuffer>>,
}

impl<D: Device> WorkerLink<D> {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            drained: Condition::new(),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn retired(&self) -> MutexGuard<'_, Vec<D::CommandBuffer>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the coordinator once `batches` batches of this worker executed.
    pub fn batches_done(&self, batches: usize, commands: impl IntoIterator<Item = D::CommandBuffer>) {
        self.retired().extend(commands);
        self.in_flight.fetch_sub(batches, Ordering::AcqRel);
        self.drained.notify_one();
    }
}

pub(crate) struct Pipeline<D: Device> {
    pub shared: Arc<Shared<D>>,
    /// Set by [`Loader::stop()`](crate::Loader::stop).
    pub stop: AtomicBool,
    /// Recorded batches waiting for execution.
    pub completed: ManyWritersSingleReaderQueue<Batch<D>>,
    /// Wakes the coordinator, the only thread waiting on it.
    pub wake: Condition,
    /// Wakes the workers.
    pub tasks_available: Condition,
    pub links: Vec<WorkerLink<D>>,
    pub live_workers: AtomicUsize,
}

impl<D: Device> Pipeline<D> {
    pub fn new(shared: Arc<Shared<D>>) -> Self {
        let workers = shared.settings.workers;
        // Every worker stops pushing at its in flight limit, so pushes to this queue never fail.
        let capacity = workers * shared.settings.max_batches_in_flight;
        Self {
            shared,
            stop: AtomicBool::new(false),
            completed: ManyWritersSingleReaderQueue::new(capacity),
            wake: Condition::new(),
            tasks_available: Condition::new(),
            links: (0..workers).map(|_| WorkerLink::new()).collect(),
            live_workers: AtomicUsize::new(0),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }
}
