//! Tasks
//!
//! A task moves through `Ready -> Pending -> Running -> Finished`. Every
//! transition wakes the task's waiters and is reported to its listeners.
//!
//! Locking: the status-order lock is taken before the pool lock, which is
//! taken before the task state lock.

use crate::context::{Listener, TaskContext, TaskCore, TaskMessage};
use crate::pool::{Job, Pool, PoolShared};
use common::{Error, Result, adjust_timeout};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Task lifecycle, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskStatus {
    Ready,
    Pending,
    Running,
    Finished,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
        };
        f.write_str(name)
    }
}

type RunFn<T> = Box<dyn FnOnce(&TaskContext) -> Result<T> + Send>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

struct TaskState<T> {
    status: TaskStatus,
    run: Option<RunFn<T>>,
    result: Option<Result<T>>,
    pool: Option<Arc<PoolShared>>,
}

pub(crate) struct TaskInner<T> {
    core: Arc<TaskCore>,
    state: Mutex<TaskState<T>>,
    cond: Condvar,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T> TaskInner<T> {
    /// Move from `from` to Running and hand out the run function
    fn claim(&self, from: TaskStatus) -> Option<RunFn<T>> {
        let _order = self.core.order.lock();
        let run = {
            let mut state = self.state.lock();
            if state.status != from {
                return None;
            }
            let run = state.run.take()?;
            state.status = TaskStatus::Running;
            run
        };

        self.cond.notify_all();
        trace!("Task '{}' is running", self.core.name);
        self.core.dispatch(&TaskMessage::Status(TaskStatus::Running));
        Some(run)
    }

    fn run_claimed(&self, run: RunFn<T>) {
        let ctx = TaskContext::new(Arc::clone(&self.core));

        let result = panic::catch_unwind(AssertUnwindSafe(|| run(&ctx))).unwrap_or_else(|payload| {
            Err(Error::Other(format!(
                "Task '{}' panicked: {}",
                self.core.name,
                panic_message(payload.as_ref())
            )))
        });
        if let Err(e) = &result {
            debug!("Task '{}' failed: {}", self.core.name, e);
        }

        let _order = self.core.order.lock();
        {
            let mut state = self.state.lock();
            state.result = Some(result);
            state.status = TaskStatus::Finished;
        }

        self.cond.notify_all();
        trace!("Task '{}' is finished", self.core.name);
        self.core.dispatch(&TaskMessage::Status(TaskStatus::Finished));
    }
}

impl<T: Send + 'static> Job for TaskInner<T> {
    fn id(&self) -> u64 {
        self.core.id
    }

    fn execute(&self) {
        if let Some(run) = self.claim(TaskStatus::Pending) {
            self.run_claimed(run);
        }
    }

    fn withdraw(&self) {
        let _order = self.core.order.lock();
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Pending {
                return;
            }
            state.status = TaskStatus::Ready;
            state.pool = None;
        }

        self.cond.notify_all();
        debug!("Task '{}' withdrawn from its pool", self.core.name);
    }
}

impl<T> Drop for TaskInner<T> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.get_mut().take() {
            cleanup();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Shared handle to a unit of work producing a `T`
pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Create a ready task; nothing runs until it is started or joined
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);

        Self {
            inner: Arc::new(TaskInner {
                core: Arc::new(TaskCore::new(id, name.into())),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Ready,
                    run: Some(Box::new(f)),
                    result: None,
                    pool: None,
                }),
                cond: Condvar::new(),
                cleanup: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.core.id
    }

    pub fn name(&self) -> &str {
        &self.inner.core.name
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status
    }

    /// Choose the pool `start` submits to (default: `Pool::global()`)
    pub fn set_pool(&self, pool: &Pool) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.status != TaskStatus::Ready {
            return Err(Error::Param(format!(
                "Cannot change the pool of {} task '{}'",
                state.status, self.inner.core.name
            )));
        }
        state.pool = Some(pool.shared());
        Ok(())
    }

    /// Receive status changes, progress reports and log messages
    ///
    /// Listeners run on whichever thread causes the message and must not
    /// block on the task.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&TaskMessage) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.inner.core.add_listener(listener);
    }

    /// Run `cleanup` when the last handle to the task goes away
    pub fn set_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.cleanup.lock() = Some(Box::new(cleanup));
    }

    /// Queue the task on its pool
    pub fn start(&self) -> Result<()> {
        let shared = {
            let mut state = self.inner.state.lock();
            if state.status != TaskStatus::Ready {
                return Err(self.not_ready(state.status));
            }
            Arc::clone(state.pool.get_or_insert_with(|| Pool::global().shared()))
        };

        let _order = self.inner.core.order.lock();
        let job: Arc<dyn Job> = self.inner.clone();
        shared.enqueue(job, || {
            let mut state = self.inner.state.lock();
            if state.status != TaskStatus::Ready {
                return Err(self.not_ready(state.status));
            }
            state.status = TaskStatus::Pending;
            Ok(())
        })?;

        self.inner.cond.notify_all();
        trace!("Task '{}' is pending", self.inner.core.name);
        self.inner
            .core
            .dispatch(&TaskMessage::Status(TaskStatus::Pending));
        Ok(())
    }

    /// Block until the task reaches `status`
    ///
    /// A ready task is started first. Waiting for `Finished` without a
    /// timeout runs the task on the calling thread when no worker has
    /// claimed it yet. Returns `Ok(false)` on timeout, or when the task is
    /// withdrawn by a pool teardown.
    pub fn wait(&self, status: TaskStatus, timeout: Option<Duration>) -> Result<bool> {
        if status == TaskStatus::Finished && timeout.is_none() {
            self.try_run_inline();
        }

        if status > TaskStatus::Ready && self.status() == TaskStatus::Ready {
            if let Err(e) = self.start() {
                // Lost a race against another starter
                if self.status() == TaskStatus::Ready {
                    return Err(e);
                }
            }
        }

        let start = Instant::now();
        let mut state = self.inner.state.lock();
        loop {
            if state.status >= status {
                return Ok(true);
            }
            if state.status == TaskStatus::Ready {
                return Ok(false);
            }

            match adjust_timeout(timeout, start) {
                None => self.inner.cond.wait(&mut state),
                Some(remaining) if remaining.is_zero() => return Ok(false),
                Some(remaining) => {
                    self.inner.cond.wait_for(&mut state, remaining);
                }
            }
        }
    }

    /// Wait for the task to finish and take its result
    ///
    /// The result can only be taken once; later joins fail with `Param`.
    pub fn join(&self) -> Result<T> {
        if !self.wait(TaskStatus::Finished, None)? {
            return Err(Error::Other(format!(
                "Task '{}' was withdrawn before it ran",
                self.inner.core.name
            )));
        }

        self.inner.state.lock().result.take().unwrap_or_else(|| {
            Err(Error::Param(format!(
                "Result of task '{}' was already taken",
                self.inner.core.name
            )))
        })
    }

    fn try_run_inline(&self) {
        let (status, pool) = {
            let state = self.inner.state.lock();
            (state.status, state.pool.clone())
        };

        match status {
            TaskStatus::Ready => {}
            TaskStatus::Pending => {
                let Some(pool) = pool else {
                    return;
                };
                if pool.dequeue(self.id()).is_none() {
                    return;
                }
            }
            _ => return,
        }

        if let Some(run) = self.inner.claim(status) {
            trace!("Running task '{}' inline", self.inner.core.name);
            self.inner.run_claimed(run);
        }
    }

    fn not_ready(&self, status: TaskStatus) -> Error {
        Error::Param(format!(
            "Cannot start {} task '{}'",
            status, self.inner.core.name
        ))
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.core.id)
            .field("name", &self.inner.core.name)
            .field("status", &self.inner.state.lock().status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_ready() {
        let task = Task::new("noop", |_| Ok(()));
        assert_eq!(task.status(), TaskStatus::Ready);
        assert_eq!(task.name(), "noop");
    }

    #[test]
    fn test_status_order() {
        assert!(TaskStatus::Ready < TaskStatus::Pending);
        assert!(TaskStatus::Pending < TaskStatus::Running);
        assert!(TaskStatus::Running < TaskStatus::Finished);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Task::new("a", |_| Ok(1));
        let b = Task::new("b", |_| Ok(2));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_join_twice() {
        let task = Task::new("once", |_| Ok(5));
        assert_eq!(task.join().unwrap(), 5);
        assert!(matches!(task.join(), Err(Error::Param(_))));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
