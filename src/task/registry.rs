//! Live-task registry.
//!
//! Holds one entry per task whose interpreter exists. The owning worker
//! advances its entry's status; the map itself is shared by every worker and
//! by `status` queries, so inserts and removals go through an `RwLock`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Connection id of the client that submitted a task. `0` is the local runner.
pub type ClientId = u32;

/// Opaque handle of one task instance. `0` never names a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunnerId(u64);

impl RunnerId {
    /// Answer for a sandbox that could not be created.
    pub const NONE: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic handle source. Handles are never reused within a process.
#[derive(Debug)]
pub struct RunnerIds(AtomicU64);

impl RunnerIds {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> RunnerId {
        RunnerId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RunnerIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskStatus {
    Waiting = 0,
    Running = 1,
    Finished = 2,
    /// Not in the registry: never existed or already finished and removed.
    NotFound = 3,
}

impl TaskStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Waiting,
            1 => Self::Running,
            2 => Self::Finished,
            _ => Self::NotFound,
        }
    }

    /// Byte sent in `status` replies.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Attribution and state of one task.
#[derive(Debug)]
pub struct TaskEntry {
    pub runner_id: RunnerId,
    pub client_id: ClientId,
    pub user_id: u64,
    pub task_id: u64,
    pub name: String,
    status: AtomicU8,
}

impl TaskEntry {
    pub fn new(runner_id: RunnerId, client_id: ClientId, user_id: u64, task_id: u64, name: String) -> Self {
        Self {
            runner_id,
            client_id,
            user_id,
            task_id,
            name,
            status: AtomicU8::new(TaskStatus::Waiting.code()),
        }
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Never moves backwards; returns whether it moved.
    pub fn advance(&self, next: TaskStatus) -> bool {
        if next == TaskStatus::NotFound {
            return false;
        }
        self.status.fetch_max(next.code(), Ordering::AcqRel) < next.code()
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<RunnerId, Arc<TaskEntry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<TaskEntry>) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.runner_id, entry);
    }

    pub fn remove(&self, runner_id: RunnerId) -> Option<Arc<TaskEntry>> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&runner_id)
    }

    pub fn get(&self, runner_id: RunnerId) -> Option<Arc<TaskEntry>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&runner_id)
            .cloned()
    }

    pub fn status(&self, runner_id: RunnerId) -> TaskStatus {
        self.get(runner_id)
            .map_or(TaskStatus::NotFound, |entry| entry.status())
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> Arc<TaskEntry> {
        Arc::new(TaskEntry::new(RunnerId::new(id), 1, 2, 3, "t".into()))
    }

    #[test]
    fn runner_ids_are_monotonic_and_never_zero() {
        let ids = RunnerIds::new();
        let first = ids.next();
        let second = ids.next();
        assert!(!first.is_none());
        assert!(second > first);
    }

    #[test]
    fn status_only_moves_forward() {
        let task = entry(1);
        assert_eq!(task.status(), TaskStatus::Waiting);
        assert!(task.advance(TaskStatus::Running));
        assert!(task.advance(TaskStatus::Finished));
        assert!(!task.advance(TaskStatus::Running));
        assert!(!task.advance(TaskStatus::NotFound));
        assert_eq!(task.status(), TaskStatus::Finished);
    }

    #[test]
    fn removed_and_unknown_handles_report_not_found() {
        let registry = TaskRegistry::new();
        registry.insert(entry(5));
        assert_eq!(registry.status(RunnerId::new(5)), TaskStatus::Waiting);
        assert_eq!(registry.status(RunnerId::new(6)), TaskStatus::NotFound);

        registry.remove(RunnerId::new(5));
        assert_eq!(registry.status(RunnerId::new(5)), TaskStatus::NotFound);
        assert!(registry.is_empty());
    }

    #[test]
    fn status_codes_match_wire_values() {
        assert_eq!(TaskStatus::Waiting.code(), 0);
        assert_eq!(TaskStatus::Running.code(), 1);
        assert_eq!(TaskStatus::Finished.code(), 2);
        assert_eq!(TaskStatus::NotFound.code(), 3);
    }
}
