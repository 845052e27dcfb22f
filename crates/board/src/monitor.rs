//! Device monitor contract
//!
//! The OS-specific monitor turns hotplug notifications into `DeviceEvent`s
//! and can enumerate what is currently plugged in. The board manager
//! consumes it through the `DeviceMonitor` trait and never sees OS types.

use crate::descriptor::Descriptor;
use common::Result;
use std::fmt;
use std::sync::Arc;

/// Opaque handle identifying one raw OS device while it is present
///
/// Monitors assign keys; a key is never reused for a different device while
/// the first one is still known to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(pub u64);

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// A raw OS device as reported by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub key: DeviceKey,
    /// Stable topology path of the physical port
    pub location: String,
    /// OS path of the device node
    pub path: String,
    pub vid: u16,
    pub pid: u16,
    /// Serial number string, if the device reports one
    pub serial: Option<String>,
    pub interface_number: u8,
}

impl Device {
    /// Numeric serial number, 0 when absent or not a decimal number
    pub fn serial_number(&self) -> u64 {
        self.serial
            .as_deref()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Attach or detach notification
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added(Arc<Device>),
    Removed(Arc<Device>),
}

impl DeviceEvent {
    pub fn device(&self) -> &Arc<Device> {
        match self {
            DeviceEvent::Added(device) | DeviceEvent::Removed(device) => device,
        }
    }
}

/// Receiver of device events; an error stops delivery and is propagated
pub type DeviceSink<'a> = dyn FnMut(DeviceEvent) -> Result<()> + 'a;

/// Source of raw device notifications
pub trait DeviceMonitor: Send {
    /// Replay every currently present device as `DeviceEvent::Added`
    fn list(&mut self, sink: &mut DeviceSink<'_>) -> Result<()>;

    /// Deliver the add/remove events queued since the last call
    fn refresh(&mut self, sink: &mut DeviceSink<'_>) -> Result<()>;

    /// Descriptor that becomes ready when `refresh` has something to deliver
    fn descriptor(&self) -> Descriptor;
}
