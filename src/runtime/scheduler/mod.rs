//! Task scheduler for spawned contexts
//!
//! An elastic pool of OS threads fed from one crossbeam channel. Core workers
//! are started eagerly and live as long as the scheduler. When the queue holds
//! more tasks than there are idle workers, an extra worker is started, up to
//! `max_workers`; extra workers retire after `keep_alive` without work. Script
//! code routinely parks a worker on a mutex or wait group, so a fixed-size pool
//! could starve the very task that would release it.

pub mod task;

pub use task::{Task, TaskFn, TaskId, TaskIdGenerator, TaskState};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Workers started eagerly and never retired.
    pub core_workers: usize,
    /// Upper bound on concurrently running workers.
    pub max_workers: usize,
    /// Idle time after which an extra worker exits, in milliseconds.
    pub keep_alive_ms: u64,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            core_workers: num_cpus,
            max_workers: 256,
            keep_alive_ms: 10_000,
            thread_name: "leap-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    #[inline]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    ShutDown,

    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks scheduled.
    pub tasks_scheduled: AtomicUsize,
    /// Tasks that returned `Ok`.
    pub tasks_completed: AtomicUsize,
    /// Tasks that returned `Err` or panicked.
    pub tasks_failed: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Highest number of workers alive at once.
    pub peak_workers: AtomicUsize,
}

impl SchedulerStats {
    #[inline]
    pub fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_failed(
        &self,
        duration_us: usize,
    ) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
    }

    /// Raise the peak worker count if `current` exceeds it.
    #[inline]
    pub fn update_workers(
        &self,
        current: usize,
    ) {
        self.peak_workers.fetch_max(current, Ordering::SeqCst);
    }

    /// Tasks that ran to an outcome.
    pub fn tasks_done(&self) -> usize {
        self.tasks_completed.load(Ordering::SeqCst) + self.tasks_failed.load(Ordering::SeqCst)
    }
}

/// State shared between the scheduler handle and its workers.
struct Pool {
    config: SchedulerConfig,
    receiver: Receiver<Arc<Task>>,
    stats: SchedulerStats,
    workers: AtomicUsize,
    idle: AtomicUsize,
    spawned: AtomicUsize,
    exit_lock: Mutex<()>,
    exit_signal: Condvar,
}

impl Pool {
    /// Start one more worker unless the pool is at `max_workers`.
    fn grow(
        pool: &Arc<Pool>,
        core: bool,
    ) -> Result<bool, SchedulerError> {
        let reserved = pool
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < pool.config.max_workers.max(1)).then_some(n + 1)
            });
        let Ok(previous) = reserved else {
            return Ok(false);
        };
        pool.stats.update_workers(previous + 1);

        let worker_id = pool.spawned.fetch_add(1, Ordering::SeqCst);
        let worker_pool = pool.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", pool.config.thread_name, worker_id))
            .spawn(move || Pool::worker_loop(&worker_pool, core));

        match spawned {
            Ok(_) => {
                debug!(worker_id, core, "worker started");
                Ok(true)
            }
            Err(err) => {
                pool.workers.fetch_sub(1, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// Grow when queued tasks outnumber idle workers.
    fn grow_if_starved(pool: &Arc<Pool>) {
        if pool.receiver.len() > pool.idle.load(Ordering::SeqCst) {
            if let Err(err) = Pool::grow(pool, false) {
                warn!(error = %err, "could not grow worker pool");
            }
        }
    }

    /// Worker thread main loop.
    fn worker_loop(
        pool: &Arc<Pool>,
        core: bool,
    ) {
        let keep_alive = pool.config.keep_alive();
        let mut retired = false;
        loop {
            pool.idle.fetch_add(1, Ordering::SeqCst);
            let next = if core {
                pool.receiver.recv().ok()
            } else {
                match pool.receiver.recv_timeout(keep_alive) {
                    Ok(task) => Some(task),
                    Err(RecvTimeoutError::Timeout) => {
                        retired = true;
                        None
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            };
            pool.idle.fetch_sub(1, Ordering::SeqCst);

            let Some(task) = next else {
                break;
            };
            Pool::grow_if_starved(pool);
            pool.execute_task(&task);
        }

        {
            let _guard = pool.exit_lock.lock();
            pool.workers.fetch_sub(1, Ordering::SeqCst);
            pool.exit_signal.notify_all();
        }

        if retired {
            debug!("idle worker retired");
            // `submit` may have counted this worker as idle after its receive
            // timed out. Both counters are final now, so a task queued in that
            // window is seen here or by the submitter.
            Pool::grow_if_starved(pool);
        }
    }

    /// Execute a task, containing any panic it raises.
    fn execute_task(
        &self,
        task: &Task,
    ) {
        let Some(executor) = task.take_executor() else {
            return;
        };
        task.set_state(TaskState::Running);

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(executor));
        let elapsed = start.elapsed();
        task.record_duration(elapsed);
        let duration_us = elapsed.as_micros() as usize;

        match outcome {
            Ok(Ok(())) => {
                task.set_state(TaskState::Finished);
                self.stats.record_completed(duration_us);
            }
            Ok(Err(err)) => {
                warn!(task = %task.id(), name = task.name(), error = %err, "task failed");
                task.set_state(TaskState::Failed);
                self.stats.record_failed(duration_us);
            }
            Err(_) => {
                warn!(task = %task.id(), name = task.name(), "task panicked");
                task.set_state(TaskState::Failed);
                self.stats.record_failed(duration_us);
            }
        }
    }
}

/// Elastic fire-and-forget scheduler.
pub struct Scheduler {
    sender: Mutex<Option<Sender<Arc<Task>>>>,
    pool: Arc<Pool>,
    ids: Mutex<TaskIdGenerator>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.pool.config)
            .field("workers", &self.worker_count())
            .field("idle", &self.idle_workers())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler and start its core workers.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let (sender, receiver) = channel::unbounded();
        let core_workers = config.core_workers.min(config.max_workers);
        let pool = Arc::new(Pool {
            config,
            receiver,
            stats: SchedulerStats::default(),
            workers: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            exit_lock: Mutex::new(()),
            exit_signal: Condvar::new(),
        });

        for _ in 0..core_workers {
            Pool::grow(&pool, true)?;
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            pool,
            ids: Mutex::new(TaskIdGenerator::new()),
        })
    }

    /// Queue `executor` as a new task. Never blocks.
    pub fn spawn<F>(
        &self,
        name: impl Into<String>,
        executor: F,
    ) -> Result<Arc<Task>, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.ids.lock().next();
        let task = Arc::new(Task::new(id, name, executor));
        self.submit(task.clone())?;
        Ok(task)
    }

    /// Queue an existing task.
    pub fn submit(
        &self,
        task: Arc<Task>,
    ) -> Result<(), SchedulerError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(SchedulerError::ShutDown)?;
        sender.send(task).map_err(|_| SchedulerError::ShutDown)?;
        self.pool.stats.record_scheduled();
        Pool::grow_if_starved(&self.pool);
        Ok(())
    }

    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        &self.pool.stats
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.pool.config
    }

    /// Workers currently alive.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.pool.workers.load(Ordering::SeqCst)
    }

    /// Workers currently waiting for a task.
    #[inline]
    pub fn idle_workers(&self) -> usize {
        self.pool.idle.load(Ordering::SeqCst)
    }

    /// Tasks waiting for a worker.
    #[inline]
    pub fn queued(&self) -> usize {
        self.pool.receiver.len()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting tasks and wait up to `timeout` for the workers to drain
    /// the queue and exit. Returns `true` if every worker exited.
    pub fn shutdown(
        &self,
        timeout: Duration,
    ) -> bool {
        self.sender.lock().take();

        let deadline = Instant::now() + timeout;
        let mut guard = self.pool.exit_lock.lock();
        while self.pool.workers.load(Ordering::SeqCst) > 0 {
            if self
                .pool
                .exit_signal
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.pool.workers.load(Ordering::SeqCst) == 0;
            }
        }
        true
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Disconnecting lets idle workers exit; busy ones finish on their own.
        self.sender.lock().take();
    }
}
