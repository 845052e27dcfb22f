//! Worker thread pool for boardwatch
//!
//! Runs long operations such as firmware uploads as tasks on a bounded set
//! of worker threads. Threads are spawned on demand and exit after an idle
//! timeout. Joining a task that no worker has picked up yet runs it on the
//! joining thread instead.

pub mod context;
pub mod pool;
pub mod task;

pub use context::{TaskContext, TaskMessage};
pub use pool::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_THREADS, Pool, PoolConfig, PoolStats};
pub use task::{Task, TaskStatus};
