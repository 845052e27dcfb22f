//! Worker threads and the pending queue
//!
//! Workers are spawned lazily: `start` adds a thread only when every
//! existing worker is busy and the pool is below its cap. A worker that
//! stays idle for the idle timeout, or finds the pool shrunk below its
//! thread count, exits and detaches itself.

use crate::context::TaskContext;
use crate::task::Task;
use common::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_THREADS: usize = 16;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Pool settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_threads: usize,
    /// `None` keeps idle workers forever
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_threads: usize,
    pub started: usize,
    pub busy: usize,
    pub pending: usize,
}

/// Queue entry; implemented by tasks of every result type
pub(crate) trait Job: Send + Sync {
    fn id(&self) -> u64;

    /// Run the task if it is still pending
    fn execute(&self);

    /// Give a pending task back to its owner during teardown
    fn withdraw(&self);
}

struct PoolState {
    max_threads: usize,
    idle_timeout: Option<Duration>,
    threads: HashMap<u64, JoinHandle<()>>,
    next_thread_id: u64,
    started: usize,
    busy: usize,
    pending: VecDeque<Arc<dyn Job>>,
    teardown: bool,
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl PoolShared {
    /// Queue a job, growing the pool if every worker is busy
    ///
    /// `mark_pending` runs under the pool lock once a worker is guaranteed;
    /// the job is only queued if it succeeds.
    pub(crate) fn enqueue<F>(self: &Arc<Self>, job: Arc<dyn Job>, mark_pending: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock();
        if state.teardown {
            return Err(Error::Resources("Task pool is shutting down".to_string()));
        }

        if state.busy == state.started && state.started < state.max_threads {
            self.spawn_worker(&mut state)?;
        }

        mark_pending()?;
        state.pending.push_back(job);
        self.cond.notify_one();

        Ok(())
    }

    /// Remove a job from the queue if no worker took it yet
    pub(crate) fn dequeue(&self, id: u64) -> Option<Arc<dyn Job>> {
        let mut state = self.state.lock();
        let pos = state.pending.iter().position(|job| job.id() == id)?;
        state.pending.remove(pos)
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> Result<()> {
        state.next_thread_id += 1;
        let id = state.next_thread_id;

        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("pool-worker-{}", id))
            .spawn(move || shared.worker_loop(id))
            .map_err(|e| Error::Resources(format!("Failed to spawn worker thread: {}", e)))?;

        state.threads.insert(id, handle);
        state.started += 1;
        state.busy += 1;
        debug!("Started pool worker {} ({} threads)", id, state.started);

        Ok(())
    }

    fn worker_loop(self: Arc<Self>, id: u64) {
        let mut state = self.state.lock();

        loop {
            state.busy -= 1;

            let job = loop {
                if state.started > state.max_threads {
                    break None;
                }
                if let Some(job) = state.pending.pop_front() {
                    break Some(job);
                }

                match state.idle_timeout {
                    None => self.cond.wait(&mut state),
                    Some(timeout) => {
                        if self.cond.wait_for(&mut state, timeout).timed_out()
                            && state.pending.is_empty()
                        {
                            break None;
                        }
                    }
                }
            };

            let Some(job) = job else {
                break;
            };
            state.busy += 1;
            drop(state);

            job.execute();
            drop(job);

            state = self.state.lock();
        }

        state.started -= 1;
        // During teardown the joining thread owns the handles
        if !state.teardown {
            state.threads.remove(&id);
        }
        debug!("Pool worker {} exiting ({} threads left)", id, state.started);
    }
}

/// A bounded group of worker threads
///
/// Dropping the pool withdraws queued tasks (they revert to ready and their
/// waiters return) and joins every worker, which lets running tasks
/// complete.
pub struct Pool {
    shared: Arc<PoolShared>,
}

static GLOBAL: OnceLock<Pool> = OnceLock::new();

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    max_threads: config.max_threads.max(1),
                    idle_timeout: config.idle_timeout,
                    threads: HashMap::new(),
                    next_thread_id: 0,
                    started: 0,
                    busy: 0,
                    pending: VecDeque::new(),
                    teardown: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Process-wide default pool, created on first use
    ///
    /// Tasks started without an explicit pool run here. The default pool is
    /// never torn down; its idle workers exit on their own.
    pub fn global() -> &'static Pool {
        GLOBAL.get_or_init(|| Pool::new(PoolConfig::default()))
    }

    pub(crate) fn shared(&self) -> Arc<PoolShared> {
        Arc::clone(&self.shared)
    }

    /// Create a task bound to this pool and start it
    pub fn spawn<T, F>(&self, name: impl Into<String>, f: F) -> Result<Task<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        let task = Task::new(name, f);
        task.set_pool(self)?;
        task.start()?;
        Ok(task)
    }

    pub fn max_threads(&self) -> usize {
        self.shared.state.lock().max_threads
    }

    /// Change the thread cap
    ///
    /// Raising it spawns workers for queued tasks right away; lowering it
    /// makes surplus workers exit once they are idle.
    pub fn set_max_threads(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::Param("Task pool needs at least one thread".to_string()));
        }

        let mut state = self.shared.state.lock();
        state.max_threads = max;

        let idle = state.started - state.busy;
        let wanted = state
            .pending
            .len()
            .saturating_sub(idle)
            .min(max.saturating_sub(state.started));
        for _ in 0..wanted {
            self.shared.spawn_worker(&mut state)?;
        }

        self.shared.cond.notify_all();
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.shared.state.lock().idle_timeout
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.shared.state.lock().idle_timeout = timeout;
        self.shared.cond.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            max_threads: state.max_threads,
            started: state.started,
            busy: state.busy,
            pending: state.pending.len(),
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let (withdrawn, threads) = {
            let mut state = self.shared.state.lock();
            state.teardown = true;
            state.max_threads = 0;

            let withdrawn: Vec<_> = state.pending.drain(..).collect();
            let threads: Vec<_> = state.threads.drain().map(|(_, handle)| handle).collect();
            self.shared.cond.notify_all();
            (withdrawn, threads)
        };

        debug!(
            "Tearing down task pool ({} queued tasks, {} threads)",
            withdrawn.len(),
            threads.len()
        );
        for job in withdrawn {
            job.withdraw();
        }
        for handle in threads {
            if handle.join().is_err() {
                warn!("Pool worker thread panicked");
            }
        }
    }
}
