//! One-shot completion signal carrying the outcome of a streamed asset.
//!
//! Every [`Model`](crate::Model) and [`Texture`](crate::Texture) owns its own latch, so waking the waiters of one
//! asset never wakes those of another.
//!
//! # Example
//! ```
//! use deimos::sync::latch::Latch;
//!
//! let latch = Latch::new();
//! assert!(latch.signal(Ok(())));
//! // Only the first signal counts.
//! assert!(!latch.signal(Err(deimos::AssetError::Stopped)));
//! assert_eq!(latch.wait(), Ok(()));
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::AssetError;

#[derive(Debug, Default)]
struct LatchState {
    outcome: Option<Result<(), AssetError>>,
    wakers: Vec<Waker>,
}

/// A signal that can be set exactly once and waited on by any number of threads or tasks.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cvar: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the outcome and wake all waiters. Returns false if the latch was already signaled, in which case
    /// the earlier outcome is kept.
    pub fn signal(&self, outcome: Result<(), AssetError>) -> bool {
        let wakers = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.wakers)
        };
        self.cvar.notify_all();
        wakers.into_iter().for_each(Waker::wake);
        true
    }

    /// The outcome, if the latch was signaled.
    pub fn outcome(&self) -> Option<Result<(), AssetError>> {
        self.lock().outcome.clone()
    }

    /// Block the calling thread until the latch is signaled.
    pub fn wait(&self) -> Result<(), AssetError> {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self.cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the latch is signaled or the timeout expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), AssetError>> {
        let state = self.lock();
        let (state, _) = self
            .cvar
            .wait_timeout_while(state, timeout, |state| state.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.outcome.clone()
    }

    /// Obtain a future that resolves to the outcome once the latch is signaled.
    pub fn wait_async(&self) -> LatchFuture<'_> {
        LatchFuture { latch: self }
    }
}

/// Future returned from [`Latch::wait_async()`].
#[derive(Debug)]
pub struct LatchFuture<'l> {
    latch: &'l Latch,
}

impl Future for LatchFuture<'_> {
    type Output = Result<(), AssetError>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.latch.lock();
        match &state.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                if !state.wakers.iter().any(|waker| waker.will_wake(ctx.waker())) {
                    state.wakers.push(ctx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
