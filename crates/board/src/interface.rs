//! Board interfaces
//!
//! An interface wraps exactly one opened raw device plus the operations table
//! its backend produced. Interfaces come and go as the OS re-enumerates the
//! device; the board they belong to survives.

use crate::backend::{InterfaceOps, VendorBackend};
use crate::board::{Board, BoardInner};
use crate::capability::Capabilities;
use crate::model::BoardModel;
use crate::monitor::Device;
use common::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

pub(crate) struct InterfaceInner {
    device: Arc<Device>,
    model: Option<&'static BoardModel>,
    serial: u64,
    capabilities: Capabilities,
    desc: String,
    ops: Box<dyn InterfaceOps>,
    board: Mutex<Weak<BoardInner>>,
}

impl Drop for InterfaceInner {
    fn drop(&mut self) {
        debug!("Closing interface {} ({})", self.desc, self.device.path);
    }
}

/// Shared handle to one opened device
#[derive(Clone)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

impl Interface {
    /// Offer `device` to each backend in priority order
    ///
    /// Returns `Ok(None)` when no backend recognizes the device.
    pub(crate) fn open(
        device: Arc<Device>,
        backends: &[Arc<dyn VendorBackend>],
    ) -> Result<Option<Interface>> {
        for backend in backends {
            let Some(probed) = backend.probe(&device)? else {
                trace!(
                    "Backend {} does not recognize {} ({:04x}:{:04x})",
                    backend.name(),
                    device.path,
                    device.vid,
                    device.pid
                );
                continue;
            };

            debug!(
                "Backend {} claimed {} as '{}' [{}]",
                backend.name(),
                device.path,
                probed.desc,
                probed.capabilities
            );

            let serial = probed.serial.unwrap_or_else(|| device.serial_number());
            return Ok(Some(Interface {
                inner: Arc::new(InterfaceInner {
                    device,
                    model: probed.model,
                    serial,
                    capabilities: probed.capabilities,
                    desc: probed.desc,
                    ops: probed.ops,
                    board: Mutex::new(Weak::new()),
                }),
            }));
        }

        Ok(None)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    pub fn desc(&self) -> &str {
        &self.inner.desc
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn model(&self) -> Option<&'static BoardModel> {
        self.inner.model
    }

    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn path(&self) -> &str {
        &self.inner.device.path
    }

    pub fn interface_number(&self) -> u8 {
        self.inner.device.interface_number
    }

    /// Board this interface is attached to, if any
    pub fn board(&self) -> Option<Board> {
        self.inner
            .board
            .lock()
            .upgrade()
            .map(|inner| Board { inner })
    }

    pub fn ptr_eq(&self, other: &Interface) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn ops(&self) -> &dyn InterfaceOps {
        self.inner.ops.as_ref()
    }

    pub(crate) fn set_board(&self, board: &Board) {
        *self.inner.board.lock() = Arc::downgrade(&board.inner);
    }

    pub(crate) fn clear_board(&self) {
        *self.inner.board.lock() = Weak::new();
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("desc", &self.inner.desc)
            .field("path", &self.inner.device.path)
            .field("capabilities", &self.inner.capabilities)
            .field("serial", &self.inner.serial)
            .finish()
    }
}
