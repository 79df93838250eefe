//! At-most-one-concurrent execution of an async initializer.
//!
//! Callers that arrive while an attempt is running wait for it and receive
//! its outcome instead of starting their own. Once the attempt has finished,
//! the next caller starts a fresh one, so a failed attempt can be retried.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

pub struct SingleFlight<T> {
    last_outcome: Mutex<Option<T>>,
    completed: AtomicU64,
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            last_outcome: Mutex::new(None),
            completed: AtomicU64::new(0),
        }
    }

    /// Runs `work` unless another caller's attempt completed while this one
    /// was waiting for the gate, in which case that outcome is returned.
    ///
    /// If the running future is dropped before finishing, no outcome is
    /// recorded and the next waiter runs `work` itself.
    pub async fn run<F, Fut>(&self, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let observed = self.completed.load(Ordering::Acquire);
        let mut last = self.last_outcome.lock().await;

        if self.completed.load(Ordering::Acquire) != observed {
            if let Some(outcome) = last.as_ref() {
                return outcome.clone();
            }
        }

        let outcome = work().await;
        *last = Some(outcome.clone());
        self.completed.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Number of attempts that have run to completion.
    pub fn completed_attempts(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
