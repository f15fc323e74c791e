//! Fixed-size worker pool.
//!
//! Workers pull boxed closures off a shared crossbeam channel. `destroy`
//! closes the sending side, lets the workers drain whatever is still queued
//! and joins them, so when it returns no job from this pool is running or
//! will ever run again.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, trace};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors from pool creation and submission.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been destroyed and accepts no more work
    #[error("pool '{0}' is shut down")]
    ShutDown(&'static str),

    /// A pool needs at least one worker
    #[error("pool '{0}' needs at least one worker")]
    NoWorkers(&'static str),

    #[error("failed to spawn worker for pool '{name}': {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    active: AtomicUsize,
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
    pub active: usize,
    pub queued: usize,
}

/// A named pool of worker threads.
///
/// # Example
///
/// ```
/// use pipekv::pool::JobPool;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let pool = JobPool::new("example", 2).unwrap();
/// let done = Arc::new(AtomicUsize::new(0));
/// for _ in 0..10 {
///     let done = Arc::clone(&done);
///     pool.submit(move || {
///         done.fetch_add(1, Ordering::SeqCst);
///     })
///     .unwrap();
/// }
///
/// pool.destroy();
/// assert_eq!(done.load(Ordering::SeqCst), 10);
/// assert!(pool.submit(|| {}).is_err());
/// ```
pub struct JobPool {
    name: &'static str,
    size: usize,
    sender: RwLock<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("open", &self.is_open())
            .finish()
    }
}

impl JobPool {
    /// Spawns `size` workers named `pipekv-<name>-<n>`.
    pub fn new(name: &'static str, size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::NoWorkers(name));
        }

        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = receiver.clone();
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("pipekv-{}-{}", name, id))
                .spawn(move || run_worker(name, receiver, counters))
                .map_err(|source| PoolError::Spawn { name, source })?;
            workers.push(handle);
        }

        debug!(pool = name, workers = size, "Job pool started");

        Ok(Self {
            name,
            size,
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    pub fn is_open(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Queues `job` for execution on one of the workers.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.read();
        let sender = sender.as_ref().ok_or(PoolError::ShutDown(self.name))?;

        sender
            .send(Box::new(job))
            .map_err(|_| PoolError::ShutDown(self.name))?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stops accepting work, waits for every queued and running job to
    /// finish, then joins the workers. Safe to call more than once.
    ///
    /// Must not be called from one of this pool's own workers.
    pub fn destroy(&self) {
        // Dropping the only sender disconnects the channel once it is empty
        let sender = self.sender.write().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!(pool = self.name, "Worker thread panicked outside a job");
            }
        }

        debug!(
            pool = self.name,
            completed = self.counters.completed.load(Ordering::Relaxed),
            "Job pool destroyed"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self.sender.read().as_ref().map(Sender::len).unwrap_or(0);
        PoolStats {
            workers: self.size,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            queued,
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run_worker(name: &'static str, receiver: Receiver<Job>, counters: Arc<Counters>) {
    // recv keeps yielding queued jobs after disconnection until the queue is empty
    while let Ok(job) = receiver.recv() {
        counters.active.fetch_add(1, Ordering::SeqCst);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!(pool = name, panic = panic_message(payload.as_ref()), "Job panicked");
        }
        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }
    trace!(pool = name, "Worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_runs_all_jobs() {
        let pool = JobPool::new("test", 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.destroy();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.stats().completed, 100);
    }

    #[test]
    fn test_destroy_waits_for_in_flight_jobs() {
        let pool = JobPool::new("slow", 2).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let finished = Arc::clone(&finished);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(20));
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.destroy();
        assert_eq!(finished.load(Ordering::SeqCst), 6);
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_submit_after_destroy_fails() {
        let pool = JobPool::new("closed", 1).unwrap();
        pool.destroy();
        pool.destroy();

        assert!(!pool.is_open());
        assert!(matches!(pool.submit(|| {}), Err(PoolError::ShutDown("closed"))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(JobPool::new("empty", 0), Err(PoolError::NoWorkers("empty"))));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = JobPool::new("panicky", 1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("boom")).unwrap();
        let after = Arc::clone(&ran);
        pool.submit(move || {
            after.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.destroy();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().panicked, 1);
    }

    #[test]
    fn test_workers_run_in_parallel() {
        let workers = 4;
        let pool = JobPool::new("parallel", workers).unwrap();
        // Deadlocks unless every worker is inside a job at the same time
        let barrier = Arc::new(Barrier::new(workers));

        for _ in 0..workers {
            let barrier = Arc::clone(&barrier);
            pool.submit(move || {
                barrier.wait();
            })
            .unwrap();
        }

        pool.destroy();
        assert_eq!(pool.stats().completed, workers as u64);
    }

    #[test]
    fn test_job_can_submit_to_another_pool_while_draining() {
        let first = Arc::new(JobPool::new("first", 1).unwrap());
        let second = Arc::new(JobPool::new("second", 1).unwrap());
        let hops = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let second = Arc::clone(&second);
            let hops = Arc::clone(&hops);
            first
                .submit(move || {
                    thread::sleep(Duration::from_millis(2));
                    second
                        .submit(move || {
                            hops.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                })
                .unwrap();
        }

        // Upstream first, then downstream
        first.destroy();
        second.destroy();
        assert_eq!(hops.load(Ordering::SeqCst), 10);
    }
}
