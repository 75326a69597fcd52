//! Scheduler unit tests
//!
//! Task state, pool growth and failure containment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;

use crate::runtime::scheduler::{
    Scheduler, SchedulerConfig, SchedulerError, Task, TaskId, TaskIdGenerator, TaskState,
};

fn small_config() -> SchedulerConfig {
    SchedulerConfig {
        core_workers: 1,
        max_workers: 8,
        keep_alive_ms: 50,
        thread_name: "test-worker".to_string(),
    }
}

fn wait_for(
    what: impl Fn() -> bool,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if what() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    what()
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(5).to_string(), "Task(5)");
        assert_eq!(TaskId(7).inner(), 7);
    }

    #[test]
    fn test_task_state_round_trip() {
        for state in [
            TaskState::Ready,
            TaskState::Running,
            TaskState::Finished,
            TaskState::Failed,
        ] {
            assert_eq!(TaskState::from_u8(state.as_u8()), state);
        }
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_task_executor_taken_once() {
        let task = Task::new(TaskId(1), "once", || Ok(()));
        assert_eq!(task.state(), TaskState::Ready);
        assert!(task.take_executor().is_some());
        assert!(task.take_executor().is_none());
    }

    #[test]
    fn test_id_generator_is_sequential() {
        let mut ids = TaskIdGenerator::new();
        assert_eq!(ids.next(), TaskId(0));
        assert_eq!(ids.next(), TaskId(1));
    }
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;

    #[test]
    fn test_core_workers_start_eagerly() {
        let scheduler = Scheduler::new(SchedulerConfig {
            core_workers: 3,
            ..small_config()
        })
        .unwrap();
        assert_eq!(scheduler.worker_count(), 3);
        assert!(scheduler.is_running());
    }

    #[test]
    fn test_tasks_run_to_completion() {
        let scheduler = Scheduler::new(small_config()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let counter = counter.clone();
                scheduler
                    .spawn(format!("count-{}", i), move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        assert!(wait_for(
            || tasks.iter().all(|t| t.is_finished()),
            Duration::from_secs(5)
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(scheduler.stats().tasks_completed.load(Ordering::SeqCst), 20);
        assert!(tasks.iter().all(|t| t.exec_duration().is_some()));
    }

    #[test]
    fn test_failures_and_panics_are_contained() {
        let scheduler = Scheduler::new(small_config()).unwrap();
        let failing = scheduler
            .spawn("failing", || Err(anyhow::anyhow!("boom")))
            .unwrap();
        let panicking = scheduler
            .spawn("panicking", || panic!("worker panic"))
            .unwrap();
        let fine = scheduler.spawn("fine", || Ok(())).unwrap();

        assert!(wait_for(
            || failing.is_finished() && panicking.is_finished() && fine.is_finished(),
            Duration::from_secs(5)
        ));
        assert_eq!(failing.state(), TaskState::Failed);
        assert_eq!(panicking.state(), TaskState::Failed);
        assert_eq!(fine.state(), TaskState::Finished);
        assert_eq!(scheduler.stats().tasks_failed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_blocked_workers_do_not_starve_new_tasks() {
        let scheduler = Scheduler::new(small_config()).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();

        // Park more tasks than there are core workers.
        for i in 0..4 {
            let release_rx = release_rx.clone();
            scheduler
                .spawn(format!("blocked-{}", i), move || {
                    release_rx.recv()?;
                    Ok(())
                })
                .unwrap();
        }

        let releaser = scheduler
            .spawn("releaser", move || {
                for _ in 0..4 {
                    release_tx.send(())?;
                }
                Ok(())
            })
            .unwrap();

        assert!(wait_for(|| releaser.is_finished(), Duration::from_secs(5)));
        assert!(scheduler.stats().peak_workers.load(Ordering::SeqCst) >= 5);
        assert!(wait_for(
            || scheduler.stats().tasks_done() == 5,
            Duration::from_secs(5)
        ));
    }

    #[test]
    fn test_extra_workers_retire() {
        let scheduler = Scheduler::new(small_config()).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        for _ in 0..3 {
            let release_rx = release_rx.clone();
            scheduler
                .spawn("blocked", move || {
                    release_rx.recv()?;
                    Ok(())
                })
                .unwrap();
        }
        assert!(wait_for(
            || scheduler.worker_count() >= 3,
            Duration::from_secs(5)
        ));
        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        assert!(wait_for(
            || scheduler.worker_count() == 1,
            Duration::from_secs(5)
        ));
    }

    #[test]
    fn test_task_queued_while_worker_retires_still_runs() {
        // No core workers: every task depends on an extra worker that keeps
        // timing out right around the next submission.
        let scheduler = Scheduler::new(SchedulerConfig {
            core_workers: 0,
            max_workers: 1,
            keep_alive_ms: 1,
            ..small_config()
        })
        .unwrap();
        let (done_tx, done_rx) = channel::unbounded::<usize>();

        for i in 0..300 {
            let done_tx = done_tx.clone();
            scheduler
                .spawn(format!("edge-{}", i), move || {
                    done_tx.send(i)?;
                    Ok(())
                })
                .unwrap();
            assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(i));
            std::thread::sleep(Duration::from_micros(200 * (i as u64 % 10)));
        }
        assert!(wait_for(
            || scheduler.stats().tasks_completed.load(Ordering::SeqCst) == 300,
            Duration::from_secs(5)
        ));
    }

    #[test]
    fn test_worker_limit_is_respected() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_workers: 2,
            ..small_config()
        })
        .unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        for _ in 0..5 {
            let release_rx = release_rx.clone();
            scheduler
                .spawn("blocked", move || {
                    release_rx.recv()?;
                    Ok(())
                })
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(scheduler.worker_count() <= 2);
        assert!(scheduler.queued() >= 3);
        drop(release_tx);
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let scheduler = Scheduler::new(small_config()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            scheduler
                .spawn("drain", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        assert!(scheduler.shutdown(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(!scheduler.is_running());
        assert!(matches!(
            scheduler.spawn("late", || Ok(())),
            Err(SchedulerError::ShutDown)
        ));
    }

    #[test]
    fn test_shutdown_times_out_on_blocked_worker() {
        let scheduler = Scheduler::new(small_config()).unwrap();
        let (_release_tx, release_rx) = channel::unbounded::<()>();
        scheduler
            .spawn("stuck", move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(2));
                Ok(())
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!scheduler.shutdown(Duration::from_millis(50)));
    }
}
