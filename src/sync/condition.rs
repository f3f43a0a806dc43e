//! Exposes [`Condition`], a mutex and condition variable pair used to put loader threads to sleep.

use std::sync::{Condvar, Mutex, PoisonError};

/// Wakes threads that wait for a predicate over state that lives outside of the condition, such as the
/// lock-free rings of a [`SingleWriterManyReadersQueue`](crate::sync::queue::SingleWriterManyReadersQueue).
///
/// Producers must change the state first and notify afterwards. Notifying takes the internal lock, so a
/// waiter that evaluated the predicate just before the change is guaranteed to be asleep and will observe it.
#[derive(Debug, Default)]
pub struct Condition {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `ready` returns true. The predicate is evaluated with the internal lock held.
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !ready() {
            guard = self.cvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake a single waiter. Use this for conditions with exactly one waiting thread.
    pub fn notify_one(&self) {
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.cvar.notify_one();
    }

    /// Wake all waiters.
    pub fn notify_all(&self) {
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn notify_one_wakes_the_waiter() {
        let condition = Arc::new(Condition::new());
        let ready = Arc::new(AtomicBool::new(false));
        let waiter = {
            let condition = condition.clone();
            let ready = ready.clone();
            thread::spawn(move || condition.wait_until(|| ready.load(Ordering::Acquire)))
        };
        ready.store(true, Ordering::Release);
        condition.notify_one();
        waiter.join().unwrap();
    }
}
