//! Integration tests for the task pool
//!
//! Tests task scheduling end to end:
//! - inline execution on join
//! - FIFO order at the thread cap
//! - bounded waits, listeners and cleanup hooks
//! - idle shutdown and teardown of workers

use common::Error;
use parking_lot::Mutex;
use pool::{Pool, PoolConfig, Task, TaskMessage, TaskStatus};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const LONG: Option<Duration> = Some(Duration::from_secs(5));

fn small_pool(max_threads: usize) -> Pool {
    Pool::new(PoolConfig {
        max_threads,
        idle_timeout: Some(Duration::from_secs(10)),
    })
}

/// Task that blocks until the returned sender fires
fn gated_task(name: &str) -> (Task<()>, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let task = Task::new(name, move |_| {
        rx.recv_timeout(Duration::from_secs(10))
            .map_err(|e| Error::Other(e.to_string()))
    });
    (task, tx)
}

mod inline {
    use super::*;

    #[test]
    fn test_join_ready_task_runs_on_caller() {
        let pool = small_pool(4);
        let caller = thread::current().id();
        let task = Task::new("inline", move |_| Ok(thread::current().id()));
        task.set_pool(&pool).unwrap();

        assert_eq!(task.join().unwrap(), caller);
        assert_eq!(task.status(), TaskStatus::Finished);
        assert_eq!(pool.stats().started, 0);
    }

    #[test]
    fn test_start_then_join_returns_result() {
        let pool = small_pool(4);
        let task = pool.spawn("answer", |_| Ok(42)).unwrap();

        assert_eq!(task.join().unwrap(), 42);
        assert!(pool.stats().started <= 1);
    }

    #[test]
    fn test_join_pending_task_runs_on_caller() {
        let pool = small_pool(1);
        let (blocker, gate) = gated_task("blocker");
        blocker.set_pool(&pool).unwrap();
        blocker.start().unwrap();
        assert!(blocker.wait(TaskStatus::Running, LONG).unwrap());

        let caller = thread::current().id();
        let queued = pool.spawn("queued", |_| Ok(thread::current().id())).unwrap();
        assert_eq!(queued.status(), TaskStatus::Pending);

        assert_eq!(queued.join().unwrap(), caller);
        assert_eq!(queued.status(), TaskStatus::Finished);
        assert_eq!(pool.stats().pending, 0);

        gate.send(()).unwrap();
        blocker.join().unwrap();
    }

    #[test]
    fn test_join_surfaces_task_error() {
        let pool = small_pool(2);
        let task: Task<()> = pool
            .spawn("failing", |_| Err(Error::Firmware("bad image".to_string())))
            .unwrap();

        assert!(matches!(task.join(), Err(Error::Firmware(_))));
    }

    #[test]
    fn test_panic_is_captured() {
        let task: Task<u32> = Task::new("panicking", |_| panic!("boom"));

        let err = task.join().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(task.status(), TaskStatus::Finished);
    }

    #[test]
    fn test_start_requires_ready() {
        let task = Task::new("twice", |_| Ok(()));
        task.join().unwrap();

        assert!(matches!(task.start(), Err(Error::Param(_))));
    }
}

mod scheduling {
    use super::*;

    #[test]
    fn test_fifo_order_at_thread_cap() {
        let pool = small_pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let (blocker, gate) = gated_task("blocker");
        blocker.set_pool(&pool).unwrap();
        blocker.start().unwrap();
        assert!(blocker.wait(TaskStatus::Running, LONG).unwrap());

        let tasks: Vec<Task<()>> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                pool.spawn(format!("queued-{}", i), move |_| {
                    order.lock().push(i);
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        assert_eq!(pool.stats().started, 1);
        assert_eq!(pool.stats().pending, 3);

        gate.send(()).unwrap();
        for task in &tasks {
            assert!(task.wait(TaskStatus::Finished, LONG).unwrap());
        }
        blocker.join().unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_pool_grows_when_all_workers_busy() {
        let pool = small_pool(4);
        let (first, gate_a) = gated_task("first");
        let (second, gate_b) = gated_task("second");
        first.set_pool(&pool).unwrap();
        second.set_pool(&pool).unwrap();

        first.start().unwrap();
        assert!(first.wait(TaskStatus::Running, LONG).unwrap());
        second.start().unwrap();
        assert!(second.wait(TaskStatus::Running, LONG).unwrap());

        assert_eq!(pool.stats().started, 2);
        assert_eq!(pool.stats().busy, 2);

        gate_a.send(()).unwrap();
        gate_b.send(()).unwrap();
        first.join().unwrap();
        second.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let pool = small_pool(2);
        let (task, gate) = gated_task("slow");
        task.set_pool(&pool).unwrap();
        task.start().unwrap();

        assert!(!task.wait(TaskStatus::Finished, Some(Duration::from_millis(50))).unwrap());

        gate.send(()).unwrap();
        assert!(task.wait(TaskStatus::Finished, LONG).unwrap());
    }

    #[test]
    fn test_idle_workers_exit() {
        let pool = Pool::new(PoolConfig {
            max_threads: 2,
            idle_timeout: Some(Duration::from_millis(30)),
        });
        let task = pool.spawn("short", |_| Ok(())).unwrap();
        assert!(task.wait(TaskStatus::Finished, LONG).unwrap());

        thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.stats().started, 0);
    }

    #[test]
    fn test_raising_cap_starts_queued_tasks() {
        let pool = small_pool(1);
        let (blocker, gate) = gated_task("blocker");
        blocker.set_pool(&pool).unwrap();
        blocker.start().unwrap();
        assert!(blocker.wait(TaskStatus::Running, LONG).unwrap());

        let queued = pool.spawn("queued", |_| Ok(7)).unwrap();
        assert_eq!(pool.stats().pending, 1);

        pool.set_max_threads(2).unwrap();
        assert!(queued.wait(TaskStatus::Finished, LONG).unwrap());
        assert_eq!(queued.join().unwrap(), 7);

        gate.send(()).unwrap();
        blocker.join().unwrap();
    }
}

mod notifications {
    use super::*;

    #[test]
    fn test_listener_sees_every_transition() {
        let pool = small_pool(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let task = Task::new("observed", |ctx| {
            ctx.report_progress("Uploading", 1, 2);
            ctx.log("halfway");
            Ok(())
        });
        task.set_pool(&pool).unwrap();
        task.add_listener(move |msg| sink.lock().push(msg.clone()));

        task.start().unwrap();
        assert!(task.wait(TaskStatus::Finished, LONG).unwrap());

        assert_eq!(
            *seen.lock(),
            vec![
                TaskMessage::Status(TaskStatus::Pending),
                TaskMessage::Status(TaskStatus::Running),
                TaskMessage::Progress {
                    action: "Uploading".to_string(),
                    value: 1,
                    max: 2
                },
                TaskMessage::Log("halfway".to_string()),
                TaskMessage::Status(TaskStatus::Finished),
            ]
        );
    }

    #[test]
    fn test_context_identifies_task() {
        let task = Task::new("named", |ctx| Ok((ctx.id(), ctx.name().to_string())));
        let id = task.id();

        assert_eq!(task.join().unwrap(), (id, "named".to_string()));
    }

    #[test]
    fn test_cleanup_runs_once_on_last_drop() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);

        let task = Task::new("cleanup", |_| Ok(()));
        task.set_cleanup(move || *counter.lock() += 1);
        let other = task.clone();
        task.join().unwrap();

        drop(task);
        assert_eq!(*calls.lock(), 0);
        drop(other);
        assert_eq!(*calls.lock(), 1);
    }
}

mod teardown {
    use super::*;

    #[test]
    fn test_teardown_withdraws_pending_tasks() {
        let pool = small_pool(1);
        let (blocker, gate) = gated_task("blocker");
        blocker.set_pool(&pool).unwrap();
        blocker.start().unwrap();
        assert!(blocker.wait(TaskStatus::Running, LONG).unwrap());

        let queued = pool.spawn("queued", |_| Ok(3)).unwrap();
        let dropper = thread::spawn(move || drop(pool));

        // Withdrawn tasks go back to ready and waiters give up
        assert!(!queued.wait(TaskStatus::Finished, LONG).unwrap());
        assert_eq!(queued.status(), TaskStatus::Ready);

        gate.send(()).unwrap();
        dropper.join().unwrap();
        blocker.join().unwrap();

        // A withdrawn task can still be run
        assert_eq!(queued.join().unwrap(), 3);
    }

    #[test]
    fn test_start_fails_after_teardown() {
        let pool = small_pool(1);
        let task = Task::new("late", |_| Ok(()));
        task.set_pool(&pool).unwrap();
        drop(pool);

        assert!(matches!(task.start(), Err(Error::Resources(_))));
        assert_eq!(task.status(), TaskStatus::Ready);
    }
}
