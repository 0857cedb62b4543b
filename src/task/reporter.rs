//! Where task log events and results go.
//!
//! The service sends them to the submitting client as frames; the local
//! runner prints them. Both are reached through [`TaskReporter`].

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::registry::{RunnerId, TaskEntry};
use crate::transport::protocol::LogLevel;

pub trait TaskReporter: Send + Sync {
    /// A log event attributed to `task`.
    fn log(&self, task: &TaskEntry, level: LogLevel, message: &str);

    /// The task's final outcome. Called exactly once per created sandbox.
    fn result(&self, task: &TaskEntry, result: bool);
}

/// Prints task events to stdout, one line each.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl TaskReporter for ConsoleReporter {
    fn log(&self, _task: &TaskEntry, level: LogLevel, message: &str) {
        println!("{} {message}", level.marker());
    }

    fn result(&self, task: &TaskEntry, result: bool) {
        let level = if result { LogLevel::Succeed } else { LogLevel::Failed };
        println!(
            "{} task '{}' (runner {}) finished: {result}",
            level.marker(),
            task.name,
            task.runner_id
        );
    }
}

/// One recorded reporter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Log {
        runner_id: RunnerId,
        level: LogLevel,
        message: String,
    },
    Result {
        runner_id: RunnerId,
        user_id: u64,
        task_id: u64,
        result: bool,
    },
}

/// Keeps every event in memory. Used when embedding the orchestrator and in tests.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<TaskEvent>>,
    changed: Condvar,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events belonging to one runner, in emission order.
    pub fn events_for(&self, runner_id: RunnerId) -> Vec<TaskEvent> {
        self.events()
            .into_iter()
            .filter(|event| match event {
                TaskEvent::Log { runner_id: id, .. } | TaskEvent::Result { runner_id: id, .. } => {
                    *id == runner_id
                }
            })
            .collect()
    }

    /// Block until `runner_id` has reported its result, or `timeout` passes.
    pub fn wait_for_result(&self, runner_id: RunnerId, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let found = events.iter().find_map(|event| match event {
                TaskEvent::Result {
                    runner_id: id,
                    result,
                    ..
                } if *id == runner_id => Some(*result),
                _ => None,
            });
            if found.is_some() {
                return found;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            events = self
                .changed
                .wait_timeout(events, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn push(&self, event: TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        self.changed.notify_all();
    }
}

impl TaskReporter for MemoryReporter {
    fn log(&self, task: &TaskEntry, level: LogLevel, message: &str) {
        self.push(TaskEvent::Log {
            runner_id: task.runner_id,
            level,
            message: message.to_string(),
        });
    }

    fn result(&self, task: &TaskEntry, result: bool) {
        self.push(TaskEvent::Result {
            runner_id: task.runner_id,
            user_id: task.user_id,
            task_id: task.task_id,
            result,
        });
    }
}
