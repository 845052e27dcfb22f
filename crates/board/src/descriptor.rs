//! Pollable descriptors
//!
//! The manager exposes its wake-up sources (the device monitor and the
//! eviction timer) as descriptors so that an external event loop can block
//! on them together instead of calling `BoardManager::wait`. A descriptor is
//! ready when its flag is raised or when its deadline has passed.

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Wakeup {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    fn fire(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct DescriptorState {
    ready: bool,
    deadline: Option<Instant>,
    waiters: Vec<Weak<Wakeup>>,
}

/// Cloneable handle to a pollable wake-up source
#[derive(Clone, Default)]
pub struct Descriptor {
    state: Arc<Mutex<DescriptorState>>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the ready flag and wake pollers
    pub fn notify(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.ready = true;
            state.waiters.clone()
        };
        wake(&waiters);
    }

    /// Lower the ready flag
    pub fn clear(&self) {
        self.state.lock().ready = false;
    }

    /// Set or remove the deadline; pollers recompute their wait
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let waiters = {
            let mut state = self.state.lock();
            state.deadline = deadline;
            state.waiters.clone()
        };
        wake(&waiters);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.ready || state.deadline.is_some_and(|d| d <= Instant::now())
    }

    fn subscribe(&self, wakeup: &Arc<Wakeup>) {
        let mut state = self.state.lock();
        state.waiters.retain(|w| w.strong_count() > 0);
        state.waiters.push(Arc::downgrade(wakeup));
    }

    fn unsubscribe(&self, wakeup: &Arc<Wakeup>) {
        let target = Arc::downgrade(wakeup);
        self.state
            .lock()
            .waiters
            .retain(|w| w.strong_count() > 0 && !w.ptr_eq(&target));
    }
}

fn wake(waiters: &[Weak<Wakeup>]) {
    for waiter in waiters.iter().filter_map(Weak::upgrade) {
        waiter.fire();
    }
}

/// A group of descriptors, each tagged with a caller-chosen id
#[derive(Clone, Default)]
pub struct DescriptorSet {
    entries: Vec<(Descriptor, i32)>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, descriptor: Descriptor, id: i32) {
        self.entries.push((descriptor, id));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block until a descriptor is ready or `timeout` elapses
    ///
    /// Returns the id of the first ready descriptor, or `None` on timeout.
    /// `None` as timeout waits forever.
    pub fn poll(&self, timeout: Option<Duration>) -> Option<i32> {
        let start = Instant::now();
        let end = timeout.and_then(|t| start.checked_add(t));

        let wakeup = Arc::new(Wakeup::default());
        for (descriptor, _) in &self.entries {
            descriptor.subscribe(&wakeup);
        }

        let result = loop {
            if let Some(id) = self.ready_id() {
                break Some(id);
            }

            let now = Instant::now();
            if end.is_some_and(|end| now >= end) {
                break None;
            }

            let wait_until = self
                .entries
                .iter()
                .filter_map(|(descriptor, _)| descriptor.deadline())
                .chain(end)
                .min();

            let mut fired = wakeup.fired.lock();
            if !*fired {
                match wait_until {
                    Some(until) => {
                        wakeup.cond.wait_until(&mut fired, until);
                    }
                    None => wakeup.cond.wait(&mut fired),
                }
            }
            *fired = false;
        };

        for (descriptor, _) in &self.entries {
            descriptor.unsubscribe(&wakeup);
        }

        result
    }

    fn ready_id(&self) -> Option<i32> {
        self.entries
            .iter()
            .find(|(descriptor, _)| descriptor.is_ready())
            .map(|(_, id)| *id)
    }
}
