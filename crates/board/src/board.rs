//! Boards
//!
//! A board is the logical device identified by its physical port (location)
//! and serial number. It outlives the raw interfaces the OS creates and
//! destroys as the device changes mode, so callers can keep a handle across
//! a bootloader round-trip.

use crate::backend::SerialFlags;
use crate::capability::{Capabilities, Capability};
use crate::firmware::{Firmware, UploadFlags};
use crate::identity::Identity;
use crate::interface::Interface;
use crate::manager::{BoardManager, ManagerInner};
use crate::model::{self, BoardModel};
use common::{Error, Result};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::info;

/// Lifecycle state of a board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardState {
    /// At least one interface is attached
    Online,
    /// All interfaces are gone; the board waits out the grace period
    Missing,
    /// Evicted for good; never mutated again
    Dropped,
}

/// Mutable part of a board, protected by the board lock
pub(crate) struct BoardData {
    pub(crate) serial: u64,
    pub(crate) vid: u16,
    pub(crate) pid: u16,
    pub(crate) model: Option<&'static BoardModel>,
    pub(crate) state: BoardState,
    pub(crate) missing_since: Option<Instant>,
    interfaces: Vec<Interface>,
    cap2iface: [Option<Interface>; Capability::COUNT],
    capabilities: Capabilities,
}

impl BoardData {
    /// Attach an interface; it becomes the provider of every capability it
    /// advertises, replacing earlier providers
    pub(crate) fn attach(&mut self, iface: Interface) {
        for cap in iface.capabilities().capabilities() {
            self.cap2iface[cap.index()] = Some(iface.clone());
        }
        self.capabilities |= iface.capabilities();
        self.interfaces.push(iface);
    }

    /// Detach an interface and recompute capabilities from the rest
    pub(crate) fn detach(&mut self, iface: &Interface) -> bool {
        let Some(pos) = self.interfaces.iter().position(|i| i.ptr_eq(iface)) else {
            return false;
        };
        self.interfaces.remove(pos);

        self.cap2iface = Default::default();
        self.capabilities = Capabilities::empty();
        for iface in &self.interfaces {
            for cap in iface.capabilities().capabilities() {
                self.cap2iface[cap.index()] = Some(iface.clone());
            }
            self.capabilities |= iface.capabilities();
        }

        true
    }

    /// Detach every interface, leaving no capabilities
    pub(crate) fn take_interfaces(&mut self) -> Vec<Interface> {
        self.cap2iface = Default::default();
        self.capabilities = Capabilities::empty();
        std::mem::take(&mut self.interfaces)
    }

    pub(crate) fn has_interfaces(&self) -> bool {
        !self.interfaces.is_empty()
    }
}

pub(crate) struct BoardInner {
    id: u64,
    location: String,
    manager: Weak<ManagerInner>,
    data: ReentrantMutex<RefCell<BoardData>>,
    udata: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// Shared handle to a board
///
/// Cloning is cheap and keeps the board alive, even after the manager drops
/// it. Two handles compare equal when they refer to the same board.
#[derive(Clone)]
pub struct Board {
    pub(crate) inner: Arc<BoardInner>,
}

/// Holds the board lock; see [`Board::lock`]
pub struct BoardGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<BoardData>>,
}

impl Board {
    pub(crate) fn new(
        id: u64,
        manager: Weak<ManagerInner>,
        location: &str,
        iface: &Interface,
    ) -> Self {
        let device = iface.device();
        let data = BoardData {
            serial: iface.serial(),
            vid: device.vid,
            pid: device.pid,
            model: iface.model(),
            state: BoardState::Online,
            missing_since: None,
            interfaces: Vec::new(),
            cap2iface: Default::default(),
            capabilities: Capabilities::empty(),
        };

        Self {
            inner: Arc::new(BoardInner {
                id,
                location: location.to_string(),
                manager,
                data: ReentrantMutex::new(RefCell::new(data)),
                udata: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&BoardData) -> R) -> R {
        let guard = self.inner.data.lock();
        let data = guard.borrow();
        f(&data)
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut BoardData) -> R) -> R {
        let guard = self.inner.data.lock();
        let mut data = guard.borrow_mut();
        f(&mut data)
    }

    /// Take the board lock
    ///
    /// The lock is reentrant, so accessors keep working on the same thread
    /// while the guard is held. Use it to read several fields consistently
    /// against a concurrent refresh. Never call `BoardManager::refresh` while
    /// holding it.
    pub fn lock(&self) -> BoardGuard<'_> {
        BoardGuard {
            _guard: self.inner.data.lock(),
        }
    }

    /// Unique id, assigned by the manager in creation order
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }

    pub fn serial_number(&self) -> u64 {
        self.with_data(|d| d.serial)
    }

    /// `location#serial`
    pub fn identity(&self) -> String {
        format!("{}#{}", self.inner.location, self.serial_number())
    }

    pub fn vid(&self) -> u16 {
        self.with_data(|d| d.vid)
    }

    pub fn pid(&self) -> u16 {
        self.with_data(|d| d.pid)
    }

    pub fn model(&self) -> Option<&'static BoardModel> {
        self.with_data(|d| d.model)
    }

    pub fn model_name(&self) -> Option<&'static str> {
        self.model().map(|m| m.name)
    }

    pub fn model_desc(&self) -> Option<&'static str> {
        self.model().map(|m| m.desc)
    }

    pub fn state(&self) -> BoardState {
        self.with_data(|d| d.state)
    }

    /// When the board went missing, if it is missing
    pub fn missing_since(&self) -> Option<Instant> {
        self.with_data(|d| d.missing_since)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.with_data(|d| d.capabilities)
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities().has(cap)
    }

    /// Interface currently providing `cap`
    pub fn interface(&self, cap: Capability) -> Option<Interface> {
        self.with_data(|d| d.cap2iface[cap.index()].clone())
    }

    /// Attached interfaces, in attach order
    pub fn interfaces(&self) -> Vec<Interface> {
        self.with_data(|d| d.interfaces.clone())
    }

    /// Check the board against an identity string (`LOCATION`,
    /// `LOCATION#SERIAL`, `#SERIAL`)
    pub fn matches_identity(&self, id: &str) -> Result<bool> {
        let identity: Identity = id.parse()?;
        Ok(self.matches(&identity))
    }

    pub fn matches(&self, identity: &Identity) -> bool {
        identity.matches(&self.inner.location, self.serial_number())
    }

    /// Manager that created the board, while it exists
    pub fn manager(&self) -> Option<BoardManager> {
        self.inner.manager.upgrade().map(BoardManager::from_inner)
    }

    /// Attach caller data to the board
    pub fn set_udata(&self, udata: Option<Arc<dyn Any + Send + Sync>>) {
        *self.inner.udata.lock() = udata;
    }

    pub fn udata(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.udata.lock().clone()
    }

    /// Caller data downcast to `T`
    pub fn udata_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.udata().and_then(|u| u.downcast::<T>().ok())
    }

    fn require(&self, cap: Capability, msg: &str) -> Result<Interface> {
        self.interface(cap)
            .ok_or_else(|| Error::Mode(msg.to_string()))
    }

    /// Flash `firmware` through the interface providing upload
    ///
    /// The image must fit the board's code size. Unless `NO_CHECK` is set,
    /// it must also carry the signature of the board's model.
    pub fn upload<P>(&self, firmware: &Firmware, flags: UploadFlags, mut progress: P) -> Result<()>
    where
        P: FnMut(usize, usize),
    {
        let (iface, model) = self.with_data(|d| (d.cap2iface[Capability::Upload.index()].clone(), d.model));

        let iface = iface.ok_or_else(|| {
            Error::Mode("Firmware upload is not available in this mode".to_string())
        })?;
        let model = model
            .filter(|m| m.is_valid())
            .ok_or_else(|| Error::Mode("Cannot upload to unknown board model".to_string()))?;

        if firmware.size() > model.code_size {
            return Err(Error::FirmwareTooLarge {
                size: firmware.size(),
                max: model.code_size,
                model: model.desc.to_string(),
            });
        }

        if !flags.contains(UploadFlags::NO_CHECK) {
            match firmware.identify() {
                None => {
                    return Err(Error::Firmware(
                        "This firmware was not compiled for a known device".to_string(),
                    ));
                }
                Some(guess) if !model::same_model(guess, model) => {
                    return Err(Error::Firmware(format!(
                        "This firmware was compiled for {}",
                        guess.desc
                    )));
                }
                Some(_) => {}
            }
        }

        info!(
            "Uploading '{}' ({} bytes) to board {}",
            firmware.name(),
            firmware.size(),
            self.identity()
        );
        iface.ops().upload(firmware, flags, &mut progress)
    }

    pub fn reset(&self) -> Result<()> {
        let iface = self.require(Capability::Reset, "Cannot reset in this mode")?;
        info!("Resetting board {}", self.identity());
        iface.ops().reset()
    }

    /// Ask the running firmware to jump to the bootloader
    pub fn reboot(&self) -> Result<()> {
        let iface = self.require(Capability::Reboot, "Cannot reboot in this mode")?;
        info!("Rebooting board {}", self.identity());
        iface.ops().reboot()
    }

    pub fn serial_set_attributes(&self, rate: u32, flags: SerialFlags) -> Result<()> {
        self.require(Capability::Serial, "Serial transfer is not available in this mode")?
            .ops()
            .serial_set_attributes(rate, flags)
    }

    pub fn serial_read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.require(Capability::Serial, "Serial transfer is not available in this mode")?
            .ops()
            .serial_read(buf, timeout)
    }

    pub fn serial_write(&self, buf: &[u8]) -> Result<usize> {
        self.require(Capability::Serial, "Serial transfer is not available in this mode")?
            .ops()
            .serial_write(buf)
    }

    /// Wait until the board offers `cap`
    ///
    /// With `parallel` the caller relies on another thread refreshing the
    /// manager and only sleeps on the refresh condition. Otherwise this
    /// thread drives the refresh itself. Returns `Ok(false)` on timeout and
    /// a `NotFound` error if the board gets dropped meanwhile.
    pub fn wait_for(&self, cap: Capability, parallel: bool, timeout: Option<Duration>) -> Result<bool> {
        let manager = self
            .manager()
            .ok_or_else(|| Error::NotFound("Board has disappeared".to_string()))?;

        let check = || -> Result<bool> {
            let (state, caps) = self.with_data(|d| (d.state, d.capabilities));
            if state == BoardState::Dropped {
                return Err(Error::NotFound("Board has disappeared".to_string()));
            }
            Ok(caps.has(cap))
        };

        if parallel {
            manager.wait_refreshed(check, timeout)
        } else {
            manager.wait(|_| check(), timeout)
        }
    }
}

impl PartialEq for Board {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Board {}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_data(|d| {
            f.debug_struct("Board")
                .field("id", &self.inner.id)
                .field("location", &self.inner.location)
                .field("serial", &d.serial)
                .field("state", &d.state)
                .field("capabilities", &d.capabilities)
                .field("model", &d.model.map(|m| m.name))
                .finish()
        })
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity())
    }
}
