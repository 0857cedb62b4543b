//! Execution of one task on its worker thread.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::registry::{RunnerId, RunnerIds, TaskEntry, TaskRegistry, TaskStatus};
use super::reporter::TaskReporter;
use super::TaskSpec;
use crate::backend::{split_methods, Interpreter, Returned, ScriptBackend};
use crate::capability::Capabilities;
use crate::transport::protocol::LogLevel;

/// Global called with the passport before any requested method.
pub const PASSPORT_FUNCTION: &str = "setTaskPassport";

/// Everything a task needs from the orchestrator, shared across workers.
#[derive(Clone)]
pub struct TaskContext {
    pub registry: Arc<TaskRegistry>,
    pub ids: Arc<RunnerIds>,
    pub reporter: Arc<dyn TaskReporter>,
}

type OnCreated = Box<dyn FnOnce(RunnerId) + Send>;

/// Tells the submitter which runner id its task got.
///
/// Fires exactly once. A notice dropped without firing reports
/// [`RunnerId::NONE`], so a task lost in the queue or to a panic still
/// answers its submitter.
pub struct CreatedNotice(Option<OnCreated>);

impl CreatedNotice {
    pub fn new<F>(on_created: F) -> Self
    where
        F: FnOnce(RunnerId) + Send + 'static,
    {
        Self(Some(Box::new(on_created)))
    }

    pub fn fire(mut self, runner_id: RunnerId) {
        self.deliver(runner_id);
    }

    fn deliver(&mut self, runner_id: RunnerId) {
        if let Some(on_created) = self.0.take() {
            on_created(runner_id);
        }
    }
}

impl Drop for CreatedNotice {
    fn drop(&mut self) {
        self.deliver(RunnerId::NONE);
    }
}

/// Runs when a registered task leaves [`execute`] by any path, unwinding included.
struct Finalizer<'a> {
    entry: Arc<TaskEntry>,
    context: &'a TaskContext,
    interpreter: Option<Box<dyn Interpreter>>,
    /// Still set only if the task unwound before announcing its id.
    notice: Option<CreatedNotice>,
    result: bool,
}

impl Drop for Finalizer<'_> {
    fn drop(&mut self) {
        if let Some(notice) = self.notice.take() {
            notice.fire(self.entry.runner_id);
        }
        self.entry.advance(TaskStatus::Finished);
        self.context.reporter.result(&self.entry, self.result);
        if let Some(interpreter) = self.interpreter.take() {
            interpreter.destroy();
        }
        self.context.registry.remove(self.entry.runner_id);
        info!(runner = %self.entry.runner_id, result = self.result, "Task finished");
    }
}

/// Run `spec` to completion. `notice` fires with the runner id once the
/// interpreter exists, before any log or result of the task is reported, or
/// with [`RunnerId::NONE`] if it could not be created.
pub fn execute(context: &TaskContext, spec: TaskSpec, backend: &dyn ScriptBackend, notice: CreatedNotice) {
    let runner_id = context.ids.next();
    let entry = Arc::new(TaskEntry::new(
        runner_id,
        spec.client_id,
        spec.user_id,
        spec.task_id,
        spec.name,
    ));

    let interpreter = match backend.create() {
        Ok(interpreter) => interpreter,
        Err(e) => {
            warn!(runner = %runner_id, language = %backend.language(), error = %e, "Failed to create interpreter");
            notice.fire(RunnerId::NONE);
            context
                .reporter
                .log(&entry, LogLevel::Failed, &format!("create {} sandbox failed: {e}", backend.language()));
            return;
        }
    };

    context.registry.insert(entry.clone());
    let mut finalizer = Finalizer {
        entry: entry.clone(),
        context,
        interpreter: Some(interpreter),
        notice: Some(notice),
        result: false,
    };
    info!(runner = %runner_id, client = spec.client_id, name = %entry.name, language = %backend.language(), "Task started");

    let Some(interpreter) = finalizer.interpreter.as_deref_mut() else {
        return;
    };

    let capabilities = Capabilities::new(entry.clone(), context.reporter.clone());
    let bound = interpreter.bind_capabilities(&capabilities);
    if let Some(notice) = finalizer.notice.take() {
        notice.fire(runner_id);
    }
    if let Err(e) = bound {
        capabilities.log(LogLevel::Failed, &format!("bind capabilities failed: {e}"));
        return;
    }

    finalizer.result = drive(interpreter, &entry, &capabilities, &spec.script, &spec.passport, &spec.call_methods);
}

/// Load the script and call the passport setter then each requested method.
/// Any failure is logged against the task and yields `false`.
fn drive(
    interpreter: &mut dyn Interpreter,
    entry: &TaskEntry,
    capabilities: &Capabilities,
    script: &[u8],
    passport: &[u8],
    call_methods: &str,
) -> bool {
    if let Err(e) = interpreter.load_script(script) {
        capabilities.log(LogLevel::Failed, &format!("load script failed: {e}"));
        return false;
    }

    entry.advance(TaskStatus::Running);

    if let Err(e) = interpreter.invoke(PASSPORT_FUNCTION, Some(passport)) {
        capabilities.log(LogLevel::Failed, &format!("call {PASSPORT_FUNCTION} failed: {e}"));
        return false;
    }

    let mut result = false;
    for method in split_methods(call_methods) {
        debug!(runner = %entry.runner_id, method, "Calling method");
        match interpreter.invoke(method, None) {
            Ok(Returned::Bool(value)) => result = value,
            Ok(Returned::Other(kind)) => {
                capabilities.log(
                    LogLevel::Failed,
                    &format!("call {method} failed: returned {kind}, expected a boolean"),
                );
                return false;
            }
            Err(e) => {
                capabilities.log(LogLevel::Failed, &format!("call {method} failed: {e}"));
                return false;
            }
        }
    }
    result
}
