//! Board manager
//!
//! Consumes device events from a `DeviceMonitor`, probes new devices through
//! the vendor backends and reconciles the resulting interfaces into boards:
//!
//! - an interface appearing at a known location with a compatible model and
//!   the same serial number reattaches to the existing board
//! - a conflicting model or serial replaces the board with a new one
//! - a VID/PID change (mode switch) closes the board and reopens it in place
//! - a board that loses its last interface goes missing and is dropped once
//!   the grace period expires without the board coming back
//!
//! Locking: the manager state lock is always taken before a board lock.
//! Callbacks run with no lock held, after the state change they report is
//! complete.

use crate::backend::VendorBackend;
use crate::board::{Board, BoardState};
use crate::descriptor::DescriptorSet;
use crate::identity::Identity;
use crate::interface::Interface;
use crate::model;
use crate::monitor::{Device, DeviceEvent, DeviceKey, DeviceMonitor};
use crate::timer::Timer;
use common::{Result, adjust_timeout};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Default grace period before a missing board is dropped
pub const DEFAULT_DROP_DELAY: Duration = Duration::from_millis(5000);

/// Board manager settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How long a board may stay missing before it is dropped
    pub drop_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            drop_delay: DEFAULT_DROP_DELAY,
        }
    }
}

/// Board lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent {
    Added,
    Changed,
    Disappeared,
    Dropped,
}

/// What a callback wants after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Keep,
    /// Deregister this callback (or stop a `list` replay)
    Remove,
}

/// Handle returned by `register_callback`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type CallbackFn = dyn Fn(&Board, BoardEvent) -> Result<CallbackResult> + Send + Sync;

#[derive(Default)]
struct CallbackRegistry {
    next_id: u64,
    entries: Vec<(CallbackId, Arc<CallbackFn>)>,
}

impl CallbackRegistry {
    fn contains(&self, id: CallbackId) -> bool {
        self.entries.iter().any(|(i, _)| *i == id)
    }
}

type Notification = (Board, BoardEvent);

#[derive(Default)]
struct ManagerState {
    enumerated: bool,
    /// Online and missing boards by location
    boards: BTreeMap<String, Board>,
    /// Missing boards, oldest first
    missing: BTreeMap<(Instant, u64), Board>,
    /// Opened interfaces by device key
    interfaces: HashMap<DeviceKey, Interface>,
}

pub(crate) struct ManagerInner {
    /// Held for the whole refresh, which serializes refreshes
    monitor: Mutex<Box<dyn DeviceMonitor>>,
    monitor_descriptor: crate::descriptor::Descriptor,
    backends: Vec<Arc<dyn VendorBackend>>,
    config: ManagerConfig,
    timer: Timer,
    state: Mutex<ManagerState>,
    callbacks: Mutex<CallbackRegistry>,
    /// Number of completed refreshes
    refresh_count: Mutex<u64>,
    refresh_cond: Condvar,
    next_board_id: AtomicU64,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug!(
            "Destroying board manager ({} boards, {} interfaces)",
            state.boards.len(),
            state.interfaces.len()
        );

        self.callbacks.get_mut().entries.clear();
        for iface in state.interfaces.values() {
            iface.clear_board();
        }
        state.interfaces.clear();
        state.missing.clear();
        state.boards.clear();
    }
}

/// Shared handle to the board manager
///
/// Clones refer to the same manager. The manager is destroyed with its last
/// handle; boards held elsewhere stay valid but no longer receive updates.
#[derive(Clone)]
pub struct BoardManager {
    inner: Arc<ManagerInner>,
}

impl BoardManager {
    /// Create a manager
    ///
    /// Backends are probed in the given order. Nothing is enumerated until
    /// the first `refresh`.
    pub fn new(
        monitor: Box<dyn DeviceMonitor>,
        backends: Vec<Arc<dyn VendorBackend>>,
        config: ManagerConfig,
    ) -> Self {
        let monitor_descriptor = monitor.descriptor();
        debug!(
            "Creating board manager with {} backends, drop delay {:?}",
            backends.len(),
            config.drop_delay
        );

        Self {
            inner: Arc::new(ManagerInner {
                monitor: Mutex::new(monitor),
                monitor_descriptor,
                backends,
                config,
                timer: Timer::new(),
                state: Mutex::new(ManagerState::default()),
                callbacks: Mutex::new(CallbackRegistry::default()),
                refresh_count: Mutex::new(0),
                refresh_cond: Condvar::new(),
                next_board_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Register an event callback
    ///
    /// Callbacks run in registration order on the refreshing thread. An
    /// `Err` stops dispatch and is returned from `refresh`; `Remove`
    /// deregisters the callback. Callbacks must not call `refresh` or
    /// `wait` on the same manager.
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Board, BoardEvent) -> Result<CallbackResult> + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        callbacks.next_id += 1;
        let id = CallbackId(callbacks.next_id);
        callbacks.entries.push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback; unknown ids are ignored
    pub fn deregister_callback(&self, id: CallbackId) {
        self.inner.callbacks.lock().entries.retain(|(i, _)| *i != id);
    }

    /// Register the pollable descriptors that signal pending work
    ///
    /// The set becomes ready when the monitor has events or when a missing
    /// board's grace period expires; call `refresh` then.
    pub fn get_descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.inner.monitor_descriptor.clone(), id);
        set.add(self.inner.timer.descriptor(), id);
    }

    /// Process pending work
    ///
    /// Drops boards whose grace period expired, enumerates devices on the
    /// first call and applies monitor events afterwards. Waiters blocked in
    /// `Board::wait_for` are woken once the refresh completes.
    pub fn refresh(&self) -> Result<()> {
        let mut monitor = self.inner.monitor.lock();

        self.drop_expired_boards()?;

        let enumerated = self.inner.state.lock().enumerated;
        let mut sink = |event: DeviceEvent| self.handle_device_event(event);
        if enumerated {
            monitor.refresh(&mut sink)?;
        } else {
            debug!("Enumerating devices");
            monitor.list(&mut sink)?;
            self.inner.state.lock().enumerated = true;
        }
        drop(monitor);

        let mut count = self.inner.refresh_count.lock();
        *count += 1;
        self.inner.refresh_cond.notify_all();

        Ok(())
    }

    /// Refresh repeatedly until `predicate` holds or `timeout` expires
    ///
    /// Returns `Ok(false)` on timeout. `None` waits forever, a zero timeout
    /// refreshes and checks once.
    pub fn wait<F>(&self, mut predicate: F, timeout: Option<Duration>) -> Result<bool>
    where
        F: FnMut(&BoardManager) -> Result<bool>,
    {
        let start = Instant::now();
        let mut set = DescriptorSet::new();
        self.get_descriptors(&mut set, 1);

        loop {
            self.refresh()?;
            if predicate(self)? {
                return Ok(true);
            }

            let remaining = adjust_timeout(timeout, start);
            if remaining.is_some_and(|r| r.is_zero()) {
                return Ok(false);
            }
            set.poll(remaining);
        }
    }

    /// Sleep on the refresh condition until `predicate` holds
    ///
    /// For threads that leave refreshing to someone else.
    pub(crate) fn wait_refreshed<F>(&self, mut predicate: F, timeout: Option<Duration>) -> Result<bool>
    where
        F: FnMut() -> Result<bool>,
    {
        let start = Instant::now();
        let mut count = self.inner.refresh_count.lock();

        loop {
            if predicate()? {
                return Ok(true);
            }

            match adjust_timeout(timeout, start) {
                None => self.inner.refresh_cond.wait(&mut count),
                Some(remaining) if remaining.is_zero() => return Ok(false),
                Some(remaining) => {
                    self.inner.refresh_cond.wait_for(&mut count, remaining);
                }
            }
        }
    }

    /// Replay an `Added` event for every online board
    ///
    /// Returning `Remove` stops the replay; an error is propagated.
    pub fn list<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Board, BoardEvent) -> Result<CallbackResult>,
    {
        for board in self.boards() {
            if board.state() != BoardState::Online {
                continue;
            }
            if f(&board, BoardEvent::Added)? == CallbackResult::Remove {
                break;
            }
        }

        Ok(())
    }

    /// Snapshot of all tracked boards, online and missing, by location
    pub fn boards(&self) -> Vec<Board> {
        self.inner.state.lock().boards.values().cloned().collect()
    }

    /// First online board matching `identity`
    pub fn find(&self, identity: &Identity) -> Option<Board> {
        self.boards()
            .into_iter()
            .find(|b| b.state() == BoardState::Online && b.matches(identity))
    }

    /// Number of tracked boards, online and missing
    pub fn len(&self) -> usize {
        self.inner.state.lock().boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle_device_event(&self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::Added(device) => self.add_interface(device),
            DeviceEvent::Removed(device) => self.remove_interface(&device),
        }
    }

    fn add_interface(&self, device: Arc<Device>) -> Result<()> {
        if self.inner.state.lock().interfaces.contains_key(&device.key) {
            trace!("Device {} ({}) is already known", device.key, device.path);
            return Ok(());
        }

        let Some(iface) = Interface::open(Arc::clone(&device), &self.inner.backends)? else {
            return Ok(());
        };

        let notifications = {
            let mut state = self.inner.state.lock();
            let mut notifications = Vec::new();

            let existing = state.boards.get(&device.location).cloned();
            let board = match existing {
                Some(board) => {
                    let (conflict, mode_switch, online) = board.with_data(|d| {
                        let model_conflict = match (iface.model(), d.model) {
                            (Some(new), Some(old)) if new.is_valid() && old.is_valid() => {
                                !model::same_model(new, old)
                            }
                            _ => false,
                        };
                        (
                            model_conflict || iface.serial() != d.serial,
                            d.vid != device.vid || d.pid != device.pid,
                            d.state == BoardState::Online,
                        )
                    });

                    if conflict {
                        info!(
                            "Board {} was replaced by another device at the same location",
                            board.identity()
                        );
                        notifications.extend(self.drop_board(&mut state, &board));
                        None
                    } else {
                        if mode_switch {
                            debug!(
                                "Board {} changed mode ({:04x}:{:04x})",
                                board.identity(),
                                device.vid,
                                device.pid
                            );
                            // Interfaces from the previous mode are stale
                            if online {
                                notifications.extend(Self::close_board(&mut state, &board));
                            }
                            board.with_data_mut(|d| {
                                d.vid = device.vid;
                                d.pid = device.pid;
                            });
                        }
                        Some(board)
                    }
                }
                None => None,
            };

            let (board, event) = match board {
                Some(board) => {
                    board.with_data_mut(|d| {
                        if let Some(model) = iface.model().filter(|m| m.is_valid()) {
                            d.model = Some(model);
                        }
                        if iface.serial() != 0 {
                            d.serial = iface.serial();
                        }
                    });
                    (board, BoardEvent::Changed)
                }
                None => {
                    let id = self.inner.next_board_id.fetch_add(1, Ordering::Relaxed);
                    let board = Board::new(id, Arc::downgrade(&self.inner), &device.location, &iface);
                    state.boards.insert(device.location.clone(), board.clone());
                    (board, BoardEvent::Added)
                }
            };

            iface.set_board(&board);
            state.interfaces.insert(device.key, iface.clone());
            let missing_since = board.with_data_mut(|d| {
                d.attach(iface);
                d.state = BoardState::Online;
                d.missing_since.take()
            });
            if let Some(since) = missing_since {
                state.missing.remove(&(since, board.id()));
            }

            match event {
                BoardEvent::Added => info!(
                    "Board {} added ({})",
                    board.identity(),
                    board.model_desc().unwrap_or("unknown model")
                ),
                _ => debug!("Board {} changed [{}]", board.identity(), board.capabilities()),
            }

            notifications.push((board, event));
            notifications
        };

        self.dispatch(notifications)
    }

    fn remove_interface(&self, device: &Device) -> Result<()> {
        let notifications = {
            let mut state = self.inner.state.lock();

            let Some(iface) = state.interfaces.remove(&device.key) else {
                trace!("Ignoring removal of unknown device {}", device.key);
                return Ok(());
            };
            let Some(board) = iface.board() else {
                return Ok(());
            };
            iface.clear_board();

            let has_interfaces = board.with_data_mut(|d| {
                d.detach(&iface);
                d.has_interfaces()
            });

            if has_interfaces {
                debug!("Board {} changed [{}]", board.identity(), board.capabilities());
                vec![(board, BoardEvent::Changed)]
            } else {
                let notifications = Self::close_board(&mut state, &board);
                self.add_missing_board(&mut state, &board);
                notifications
            }
        };

        self.dispatch(notifications)
    }

    /// Mark a board missing and detach all its interfaces
    fn close_board(state: &mut ManagerState, board: &Board) -> Vec<Notification> {
        let removed = board.with_data_mut(|d| {
            d.state = BoardState::Missing;
            d.take_interfaces()
        });
        Self::forget_interfaces(state, removed);

        info!("Board {} disappeared", board.identity());
        vec![(board.clone(), BoardEvent::Disappeared)]
    }

    /// Start the grace period of a board
    fn add_missing_board(&self, state: &mut ManagerState, board: &Board) {
        let now = Instant::now();
        let previous = board.with_data_mut(|d| d.missing_since.replace(now));
        if let Some(since) = previous {
            state.missing.remove(&(since, board.id()));
        }
        state.missing.insert((now, board.id()), board.clone());

        if let Some(((oldest, _), _)) = state.missing.first_key_value() {
            let elapsed = now.saturating_duration_since(*oldest);
            self.inner
                .timer
                .set(self.inner.config.drop_delay.saturating_sub(elapsed));
        }
    }

    /// Evict a board for good
    fn drop_board(&self, state: &mut ManagerState, board: &Board) -> Vec<Notification> {
        let (since, removed) = board.with_data_mut(|d| {
            d.state = BoardState::Dropped;
            (d.missing_since.take(), d.take_interfaces())
        });
        Self::forget_interfaces(state, removed);

        if let Some(since) = since {
            state.missing.remove(&(since, board.id()));
        }
        if state.boards.get(board.location()) == Some(board) {
            state.boards.remove(board.location());
        }
        if state.missing.is_empty() {
            self.inner.timer.cancel();
        }

        info!("Board {} dropped", board.identity());
        vec![(board.clone(), BoardEvent::Dropped)]
    }

    fn forget_interfaces(state: &mut ManagerState, removed: Vec<Interface>) {
        for iface in removed {
            let key = iface.device().key;
            if state.interfaces.get(&key).is_some_and(|i| i.ptr_eq(&iface)) {
                state.interfaces.remove(&key);
            }
            iface.clear_board();
        }
    }

    fn drop_expired_boards(&self) -> Result<()> {
        if !self.inner.timer.take_fired() {
            return Ok(());
        }

        let notifications = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            let mut notifications = Vec::new();

            while let Some((&(since, _), board)) = state.missing.first_key_value() {
                let remaining = self
                    .inner
                    .config
                    .drop_delay
                    .saturating_sub(now.saturating_duration_since(since));
                if !remaining.is_zero() {
                    self.inner.timer.set(remaining);
                    break;
                }

                let board = board.clone();
                notifications.extend(self.drop_board(&mut state, &board));
            }

            notifications
        };

        self.dispatch(notifications)
    }

    fn dispatch(&self, notifications: Vec<Notification>) -> Result<()> {
        for (board, event) in notifications {
            let callbacks = self.inner.callbacks.lock().entries.clone();

            for (id, callback) in callbacks {
                // Skip callbacks deregistered by an earlier callback
                if !self.inner.callbacks.lock().contains(id) {
                    continue;
                }

                if callback(&board, event)? == CallbackResult::Remove {
                    self.deregister_callback(id);
                }
            }
        }

        Ok(())
    }
}
