//! Dedicated worker threads for blocking backend calls.
//!
//! Model loads and inference are synchronous from the ensemble's point of
//! view. They run here so that async callers never block a runtime thread.
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("inference pool is shut down")]
    Closed,
    #[error("inference job panicked")]
    Panicked,
}

struct WorkerThread {
    name: String,
    thread_handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    fn spawn(name: String, mut receiver: mpsc::UnboundedReceiver<Job>) -> anyhow::Result<Self> {
        let thread_handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                job();
            }
        })?;

        debug!("Spawned inference worker: {}", name);
        Ok(Self {
            name,
            thread_handle: Some(thread_handle),
        })
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            // A job that releases the last pool handle must not join its own thread.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                debug!("Inference worker {} exited abnormally", self.name);
            }
        }
    }
}

/// Round-robin pool of named threads. Dropping the pool closes every queue
/// and joins the workers once their pending jobs have drained.
pub struct InferencePool {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    workers: Vec<WorkerThread>,
    next_worker: AtomicUsize,
}

impl InferencePool {
    pub fn new(threads: usize) -> anyhow::Result<Self> {
        let threads = threads.max(1);
        let mut senders = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(WorkerThread::spawn(format!("ensemble-infer-{}", i), rx)?);
            senders.push(tx);
        }

        info!("Inference pool started with {} workers", threads);
        Ok(Self {
            senders,
            workers,
            next_worker: AtomicUsize::new(0),
        })
    }

    /// Pool sized from the machine's core count.
    pub fn with_default_threads() -> anyhow::Result<Self> {
        Self::new(default_thread_count())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Runs `job` on a worker thread and waits for its result. A panic inside
    /// the job is caught and reported as `PoolError::Panicked`.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job));
            let _ = tx.send(outcome);
        });

        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index]
            .send(wrapped)
            .map_err(|_| PoolError::Closed)?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PoolError::Panicked),
            Err(_) => Err(PoolError::Closed),
        }
    }
}

impl Drop for InferencePool {
    fn drop(&mut self) {
        self.senders.clear();
        self.workers.clear();
        debug!("Inference pool shut down");
    }
}

/// Half the available cores, between 1 and 4. Inference backends are
/// usually internally parallel, so more workers only adds contention.
pub fn default_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, 4)
}
