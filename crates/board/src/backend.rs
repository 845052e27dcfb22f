//! Vendor backend contract
//!
//! A vendor backend looks at a raw device and decides whether it recognizes
//! it. When it does, it opens the device and hands back the capabilities the
//! device offers in its current mode, a model guess and the operations
//! table used to drive it.
//!
//! Locking: the board releases its lock before calling into `InterfaceOps`.
//! Operations only touch the interface's own handle, never board state, so
//! upload, reset, reboot and serial I/O all run unlocked and may block.

use crate::capability::Capabilities;
use crate::firmware::{Firmware, UploadFlags};
use crate::model::BoardModel;
use crate::monitor::Device;
use bitflags::bitflags;
use common::{Error, Result};
use std::time::Duration;

bitflags! {
    /// Serial line settings; default is 8N1 without flow control
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SerialFlags: u32 {
        const CSIZE_7 = 1 << 0;
        const PARITY_ODD = 1 << 1;
        const PARITY_EVEN = 1 << 2;
        const STOP_BITS_2 = 1 << 3;
        const FLOW_RTSCTS = 1 << 4;
        const FLOW_XONXOFF = 1 << 5;
    }
}

/// Upload progress: bytes written so far, total bytes
pub type ProgressFn<'a> = dyn FnMut(usize, usize) + 'a;

/// Operations on one opened device
///
/// Dropping the value closes the underlying handle, which therefore happens
/// exactly once, when the last reference to the interface goes away.
/// Default implementations report that the capability is unavailable.
pub trait InterfaceOps: Send + Sync {
    fn upload(
        &self,
        _firmware: &Firmware,
        _flags: UploadFlags,
        _progress: &mut ProgressFn<'_>,
    ) -> Result<()> {
        Err(Error::Mode("Firmware upload is not available in this mode".to_string()))
    }

    fn reset(&self) -> Result<()> {
        Err(Error::Mode("Cannot reset in this mode".to_string()))
    }

    fn reboot(&self) -> Result<()> {
        Err(Error::Mode("Cannot reboot in this mode".to_string()))
    }

    fn serial_set_attributes(&self, _rate: u32, _flags: SerialFlags) -> Result<()> {
        Err(Error::Mode("Serial transfer is not available in this mode".to_string()))
    }

    /// Read available bytes, waiting up to `timeout` (`None` blocks)
    fn serial_read(&self, _buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize> {
        Err(Error::Mode("Serial transfer is not available in this mode".to_string()))
    }

    fn serial_write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::Mode("Serial transfer is not available in this mode".to_string()))
    }
}

/// What a backend reports for a device it recognizes
pub struct ProbedInterface {
    pub capabilities: Capabilities,
    /// Model guess; may be a placeholder without code size
    pub model: Option<&'static BoardModel>,
    /// Serial number override, for devices that do not report it in the
    /// standard descriptor
    pub serial: Option<u64>,
    pub desc: String,
    pub ops: Box<dyn InterfaceOps>,
}

/// Pluggable device recognizer
///
/// Backends are tried in priority order; the first one to return
/// `Ok(Some(_))` claims the device. `Ok(None)` means "not mine" and is not
/// an error. An `Err` aborts the add.
pub trait VendorBackend: Send + Sync {
    fn name(&self) -> &str;

    fn probe(&self, device: &Device) -> Result<Option<ProbedInterface>>;
}
