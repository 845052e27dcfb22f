//! Execution context handed to running tasks

use crate::task::TaskStatus;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Notification delivered to task listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMessage {
    Status(TaskStatus),
    Progress { action: String, value: u64, max: u64 },
    Log(String),
}

pub(crate) type Listener = Arc<dyn Fn(&TaskMessage) + Send + Sync>;

/// Type-independent part of a task
pub(crate) struct TaskCore {
    pub(crate) id: u64,
    pub(crate) name: String,
    /// Serializes status changes with their notification so that listeners
    /// observe transitions in order
    pub(crate) order: Mutex<()>,
    listeners: Mutex<Vec<Listener>>,
}

impl TaskCore {
    pub(crate) fn new(id: u64, name: String) -> Self {
        Self {
            id,
            name,
            order: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_listener(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn dispatch(&self, msg: &TaskMessage) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(msg);
        }
    }
}

/// The task currently being executed
///
/// Passed to the run function so that code running inside a task can
/// report progress without knowing which thread runs it.
#[derive(Clone)]
pub struct TaskContext {
    core: Arc<TaskCore>,
}

impl TaskContext {
    pub(crate) fn new(core: Arc<TaskCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Notify listeners that `action` reached `value` out of `max`
    pub fn report_progress(&self, action: &str, value: u64, max: u64) {
        let _order = self.core.order.lock();
        self.core.dispatch(&TaskMessage::Progress {
            action: action.to_string(),
            value,
            max,
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("[{}] {}", self.core.name, message);

        let _order = self.core.order.lock();
        self.core.dispatch(&TaskMessage::Log(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_reach_listeners() {
        let core = Arc::new(TaskCore::new(1, "flash".to_string()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.add_listener(Arc::new(move |msg: &TaskMessage| sink.lock().push(msg.clone())));

        let ctx = TaskContext::new(core);
        ctx.report_progress("Uploading", 3, 10);
        ctx.log("done");

        assert_eq!(ctx.name(), "flash");
        assert_eq!(
            *seen.lock(),
            vec![
                TaskMessage::Progress {
                    action: "Uploading".to_string(),
                    value: 3,
                    max: 10
                },
                TaskMessage::Log("done".to_string()),
            ]
        );
    }
}
