//! Task orchestration.
//!
//! A task is one script execution: an interpreter is created on a pool
//! worker, the script is loaded and its methods called, then the interpreter
//! is torn down and exactly one result is reported.
//!
//! [`Orchestrator::submit`] never blocks: the runner id is handed to a
//! continuation on the task's own worker. [`Orchestrator::run`] is the
//! blocking form for callers outside the pool; it waits only until the
//! interpreter exists, not until the task finishes.

pub mod lifecycle;
pub mod registry;
pub mod reporter;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::backend::{Backends, Language};
use crate::pool::WorkerPool;
use lifecycle::{CreatedNotice, TaskContext};
use registry::{ClientId, RunnerId, RunnerIds, TaskRegistry, TaskStatus};
use reporter::TaskReporter;

/// A script submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub client_id: ClientId,
    pub user_id: u64,
    pub task_id: u64,
    pub language: Language,
    pub name: String,
    pub script: Vec<u8>,
    pub passport: Vec<u8>,
    /// Comma-joined method names, called in order.
    pub call_methods: String,
}

/// Counts one submitted task until its job ends or is dropped unrun.
struct Pending(Arc<AtomicUsize>);

impl Pending {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    pool: Arc<WorkerPool>,
    backends: Backends,
    context: TaskContext,
    pending: Arc<AtomicUsize>,
}

impl Orchestrator {
    pub fn new(pool: Arc<WorkerPool>, backends: Backends, reporter: Arc<dyn TaskReporter>) -> Self {
        Self {
            pool,
            backends,
            context: TaskContext {
                registry: Arc::new(TaskRegistry::new()),
                ids: Arc::new(RunnerIds::new()),
                reporter,
            },
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a task and return at once.
    ///
    /// `on_created` is called exactly once: with the runner id after the
    /// interpreter exists and before the task reports anything else, or with
    /// [`RunnerId::NONE`] when no interpreter could be created, no backend
    /// serves the language, or the pool dropped the task.
    pub fn submit<F>(&self, spec: TaskSpec, on_created: F)
    where
        F: FnOnce(RunnerId) + Send + 'static,
    {
        let notice = CreatedNotice::new(on_created);
        let Some(backend) = self.backends.get(spec.language) else {
            warn!(language = %spec.language, "No backend registered");
            notice.fire(RunnerId::NONE);
            return;
        };

        let context = self.context.clone();
        let pending = Pending::new(&self.pending);
        let submitted = self.pool.execute(move || {
            let _pending = pending;
            lifecycle::execute(&context, spec, backend.as_ref(), notice);
        });
        if let Err(e) = submitted {
            warn!(error = %e, "Task rejected");
        }
    }

    /// Start a task and return its runner id, or [`RunnerId::NONE`] when no
    /// interpreter could be created for it.
    ///
    /// Blocks the calling thread until the interpreter exists. Must not be
    /// called from async code or from a pool worker.
    pub fn run(&self, spec: TaskSpec) -> RunnerId {
        let (tx, rx) = oneshot::channel();
        self.submit(spec, move |runner_id| {
            let _ = tx.send(runner_id);
        });
        rx.blocking_recv().unwrap_or(RunnerId::NONE)
    }

    pub fn status(&self, runner_id: RunnerId) -> TaskStatus {
        self.context.registry.status(runner_id)
    }

    /// Running scripts cannot be interrupted; every request is refused.
    pub fn stop(&self, runner_id: RunnerId) -> bool {
        debug!(runner = %runner_id, "Stop requested; not supported");
        false
    }

    /// Number of tasks whose interpreter currently exists.
    pub fn live_tasks(&self) -> usize {
        self.context.registry.len()
    }

    /// Block until every submitted task has finished, checking every `poll`.
    /// Tasks still queued count as unfinished.
    pub fn join(&self, poll: Duration) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            thread::sleep(poll);
        }
    }
}
