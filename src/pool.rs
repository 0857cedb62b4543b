//! Fixed-size worker pool.
//!
//! Every unit of work the service performs (packet handling, task
//! execution) runs here, never on the network runtime. Workers drain one
//! FIFO queue guarded by a single mutex/condvar pair. A dequeued unit runs to
//! completion: there is no preemption, so a hung task holds its worker until
//! it returns.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("job panicked or was dropped before completing")]
    Abandoned,
}

/// Default worker count: available hardware parallelism plus three.
pub fn default_size() -> usize {
    thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get) + 3
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
        });

        let workers = (0..size)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn(move || worker_loop(&shared))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!(error = %e, "Failed to spawn worker thread");
                    None
                }
            })
            .collect::<Vec<_>>();

        debug!(workers = workers.len(), "Worker pool started");
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn size(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue a unit of work without tracking its outcome.
    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.lock();
            if queue.stopping {
                return Err(PoolError::ShutDown);
            }
            queue.jobs.push_back(Box::new(job));
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Queue a unit of work whose return value can be awaited later.
    pub fn submit<F, R>(&self, job: F) -> Result<JobHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            let _ = tx.send(job());
        })?;
        Ok(JobHandle { rx })
    }

    /// Stop accepting work, wake every worker and join them.
    ///
    /// Jobs still queued when the workers observe the stop flag are dropped
    /// without running. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        let leftovers = {
            let mut queue = self.shared.lock();
            queue.stopping = true;
            std::mem::take(&mut queue.jobs)
        };
        self.shared.available.notify_all();

        // Dropped outside the lock and before joining: a running job may be
        // blocked on the result of a queued one, and dropping the queued job
        // releases it.
        let dropped = leftovers.len();
        drop(leftovers);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if worker.join().is_err() {
                error!("Worker thread exited abnormally");
            }
        }
        debug!(dropped, "Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.lock();
            while queue.jobs.is_empty() && !queue.stopping {
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if queue.stopping {
                return;
            }
            match queue.jobs.pop_front() {
                Some(job) => job,
                None => continue,
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job panicked; worker continues");
        }
    }
}

/// Outcome of a job queued with [`WorkerPool::submit`].
pub struct JobHandle<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> JobHandle<R> {
    /// Block the current thread until the job finishes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<R, PoolError> {
        self.rx.blocking_recv().map_err(|_| PoolError::Abandoned)
    }

    /// Await the job from async code.
    pub async fn join(self) -> Result<R, PoolError> {
        self.rx.await.map_err(|_| PoolError::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn default_size_exceeds_parallelism() {
        assert!(default_size() >= 4);
    }

    #[test]
    fn fire_and_forget_runs_every_job_exactly_once() {
        let pool = WorkerPool::new(3);
        let total = 2_000;
        let counters: Arc<Vec<AtomicUsize>> =
            Arc::new((0..total).map(|_| AtomicUsize::new(0)).collect());
        let (done_tx, done_rx) = mpsc::channel();

        for i in 0..total {
            let counters = Arc::clone(&counters);
            let done_tx = done_tx.clone();
            pool.execute(move || {
                counters[i].fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            })
            .unwrap();
        }
        for _ in 0..total {
            done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        pool.shutdown();

        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn submit_returns_outcome() {
        let pool = WorkerPool::new(2);
        let handle = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[tokio::test]
    async fn submit_outcome_can_be_awaited() {
        let pool = WorkerPool::new(1);
        let handle = pool.submit(|| "done").unwrap();
        assert_eq!(handle.join().await.unwrap(), "done");
    }

    #[test]
    fn shutdown_joins_with_full_queue() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        // Occupy both workers, then pile work up behind them.
        for _ in 0..2 {
            let release_rx = Arc::clone(&release_rx);
            pool.execute(move || {
                let _ = release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_millis(200));
            })
            .unwrap();
        }
        let handles: Vec<_> = (0..100).map(|i| pool.submit(move || i).unwrap()).collect();

        drop(release_tx);
        pool.shutdown();

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.execute(|| {}), Err(PoolError::ShutDown));
        // Whatever was still queued is reported as abandoned, never hangs.
        for handle in handles {
            let _ = handle.wait();
        }
    }

    #[test]
    fn shutdown_releases_jobs_waiting_on_queued_work() {
        let pool = Arc::new(WorkerPool::new(1));
        let (started_tx, started_rx) = mpsc::channel();
        let inner = Arc::clone(&pool);
        let outer = pool
            .submit(move || {
                let queued = inner.submit(|| 1).unwrap();
                started_tx.send(()).unwrap();
                queued.wait()
            })
            .unwrap();

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
        assert_eq!(outer.wait().unwrap(), Err(PoolError::Abandoned));
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let failed = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(failed.wait().unwrap_err(), PoolError::Abandoned);

        let ok = pool.submit(|| 1).unwrap();
        assert_eq!(ok.wait().unwrap(), 1);
    }
}
