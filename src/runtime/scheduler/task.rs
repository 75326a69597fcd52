//! Task definitions for the scheduler.
//!
//! A task wraps one fire-and-forget unit of work, typically the body of a
//! spawned script context.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Work executed by a task. An `Err` marks the task as failed.
pub type TaskFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not picked up by a worker yet.
    Ready,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Finished,
    /// Returned an error or panicked.
    Failed,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => TaskState::Running,
            2 => TaskState::Finished,
            3 => TaskState::Failed,
            _ => TaskState::Ready,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Ready => 0,
            TaskState::Running => 1,
            TaskState::Finished => 2,
            TaskState::Failed => 3,
        }
    }

    /// Check if the task will not run again.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

/// A task that can be scheduled for execution.
pub struct Task {
    id: TaskId,
    name: String,
    state: AtomicU8,
    executor: Mutex<Option<TaskFn>>,
    exec_duration: Mutex<Option<Duration>>,
}

impl std::fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    /// Create a new task with the given ID and executor.
    pub fn new<F>(
        id: TaskId,
        name: impl Into<String>,
        executor: F,
    ) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            id,
            name: name.into(),
            state: AtomicU8::new(TaskState::Ready.as_u8()),
            executor: Mutex::new(Some(Box::new(executor))),
            exec_duration: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn set_state(
        &self,
        state: TaskState,
    ) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Take the executor closure; `None` once it has been taken.
    #[inline]
    pub fn take_executor(&self) -> Option<TaskFn> {
        self.executor.lock().take()
    }

    #[inline]
    pub fn record_duration(
        &self,
        duration: Duration,
    ) {
        *self.exec_duration.lock() = Some(duration);
    }

    /// Execution duration, once the task has run.
    #[inline]
    pub fn exec_duration(&self) -> Option<Duration> {
        *self.exec_duration.lock()
    }
}

/// Generator for task IDs.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    next_id: usize,
}

impl TaskIdGenerator {
    #[inline]
    pub fn new() -> Self {
        Self { next_id: 0 }
    }

    /// Generate the next task ID.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        TaskId(id)
    }
}
