//! Generic CDC-ACM serial backend
//!
//! Claims any device exposing a CDC data interface with a bulk endpoint
//! pair. It provides serial transfers and a USB port reset, nothing
//! vendor-specific, so boards it claims have no model and cannot be
//! flashed through it.

use super::device::UsbRegistry;
use board::{
    Capabilities, Device, InterfaceOps, ProbedInterface, SerialFlags, VendorBackend,
};
use common::{Error, Result};
use parking_lot::Mutex;
use rusb::{Context, DeviceHandle, Direction, TransferType};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const CDC_COMM_CLASS: u8 = 0x02;
const CDC_DATA_CLASS: u8 = 0x0A;

// Class-specific requests, host to device, class, interface
const REQUEST_TYPE_CLASS_INTERFACE: u8 = 0x21;
const SET_LINE_CODING: u8 = 0x20;
const SET_CONTROL_LINE_STATE: u8 = 0x22;
const CONTROL_LINE_DTR_RTS: u16 = 0x03;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Slice used for blocking reads so writers get the handle in between
const READ_SLICE: Duration = Duration::from_millis(100);

fn usb_error(context: &str, e: rusb::Error) -> Error {
    match e {
        rusb::Error::NoDevice => Error::NotFound(format!("{}: device is gone", context)),
        rusb::Error::Access => Error::Usb(format!("{}: permission denied", context)),
        e => Error::Usb(format!("{}: {}", context, e)),
    }
}

/// Interfaces and endpoints found in the active configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CdcLayout {
    control_interface: u8,
    data_interface: u8,
    ep_in: u8,
    ep_out: u8,
}

impl CdcLayout {
    fn find(device: &rusb::Device<Context>) -> Option<Self> {
        let config = device.active_config_descriptor().ok()?;
        let mut control_interface = None;
        let mut data = None;

        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                match alt.class_code() {
                    CDC_COMM_CLASS => {
                        control_interface.get_or_insert(alt.interface_number());
                    }
                    CDC_DATA_CLASS if data.is_none() => {
                        let mut ep_in = None;
                        let mut ep_out = None;
                        for ep in alt.endpoint_descriptors() {
                            if ep.transfer_type() != TransferType::Bulk {
                                continue;
                            }
                            match ep.direction() {
                                Direction::In => ep_in = ep_in.or(Some(ep.address())),
                                Direction::Out => ep_out = ep_out.or(Some(ep.address())),
                            }
                        }
                        if let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) {
                            data = Some((alt.interface_number(), ep_in, ep_out));
                        }
                    }
                    _ => {}
                }
            }
        }

        let (data_interface, ep_in, ep_out) = data?;
        Some(Self {
            control_interface: control_interface.unwrap_or(data_interface.saturating_sub(1)),
            data_interface,
            ep_in,
            ep_out,
        })
    }

    fn interfaces(&self) -> Vec<u8> {
        if self.control_interface == self.data_interface {
            vec![self.data_interface]
        } else {
            vec![self.control_interface, self.data_interface]
        }
    }
}

/// Encode a CDC line coding structure
fn line_coding(rate: u32, flags: SerialFlags) -> [u8; 7] {
    let mut coding = [0u8; 7];
    coding[..4].copy_from_slice(&rate.to_le_bytes());
    coding[4] = if flags.contains(SerialFlags::STOP_BITS_2) { 2 } else { 0 };
    coding[5] = if flags.contains(SerialFlags::PARITY_ODD) {
        1
    } else if flags.contains(SerialFlags::PARITY_EVEN) {
        2
    } else {
        0
    };
    coding[6] = if flags.contains(SerialFlags::CSIZE_7) { 7 } else { 8 };
    coding
}

/// An opened CDC-ACM device
struct CdcOps {
    handle: Mutex<DeviceHandle<Context>>,
    layout: CdcLayout,
    /// Interfaces we claimed, with whether a kernel driver had to be detached
    claimed: Vec<(u8, bool)>,
}

impl CdcOps {
    fn open(device: &rusb::Device<Context>, layout: CdcLayout) -> Result<Self> {
        let mut handle = device
            .open()
            .map_err(|e| usb_error("Failed to open device", e))?;
        let mut claimed = Vec::new();

        for interface in layout.interfaces() {
            let detached = match handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", interface);
                    handle
                        .detach_kernel_driver(interface)
                        .map_err(|e| usb_error("Failed to detach kernel driver", e))?;
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    // Not supported on every platform; claiming tells us the rest
                    trace!("Cannot query kernel driver on interface {}: {}", interface, e);
                    false
                }
            };

            handle
                .claim_interface(interface)
                .map_err(|e| usb_error("Failed to claim interface", e))?;
            claimed.push((interface, detached));
        }

        Ok(Self {
            handle: Mutex::new(handle),
            layout,
            claimed,
        })
    }

    fn control(&self, request: u8, value: u16, data: &[u8]) -> Result<()> {
        self.handle
            .lock()
            .write_control(
                REQUEST_TYPE_CLASS_INTERFACE,
                request,
                value,
                u16::from(self.layout.control_interface),
                data,
                CONTROL_TIMEOUT,
            )
            .map_err(|e| usb_error("Control transfer failed", e))?;
        Ok(())
    }
}

impl InterfaceOps for CdcOps {
    fn reset(&self) -> Result<()> {
        self.handle
            .lock()
            .reset()
            .map_err(|e| usb_error("Failed to reset device", e))
    }

    fn serial_set_attributes(&self, rate: u32, flags: SerialFlags) -> Result<()> {
        if flags.intersects(SerialFlags::FLOW_RTSCTS | SerialFlags::FLOW_XONXOFF) {
            debug!("Flow control is handled by the device, ignoring {:?}", flags);
        }

        self.control(SET_LINE_CODING, 0, &line_coding(rate, flags))?;
        self.control(SET_CONTROL_LINE_STATE, CONTROL_LINE_DTR_RTS, &[])
    }

    fn serial_read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let start = Instant::now();

        loop {
            let slice = match common::adjust_timeout(timeout, start) {
                Some(remaining) => remaining.min(READ_SLICE),
                None => READ_SLICE,
            };

            match self.handle.lock().read_bulk(self.layout.ep_in, buf, slice) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) | Err(rusb::Error::Timeout) => {}
                Err(e) => return Err(usb_error("Serial read failed", e)),
            }

            if common::adjust_timeout(timeout, start).is_some_and(|r| r.is_zero()) {
                return Ok(0);
            }
        }
    }

    fn serial_write(&self, buf: &[u8]) -> Result<usize> {
        self.handle
            .lock()
            .write_bulk(self.layout.ep_out, buf, WRITE_TIMEOUT)
            .map_err(|e| usb_error("Serial write failed", e))
    }
}

impl Drop for CdcOps {
    fn drop(&mut self) {
        let mut handle = self.handle.lock();
        for &(interface, detached) in self.claimed.iter().rev() {
            if let Err(e) = handle.release_interface(interface) {
                trace!("Failed to release interface {}: {}", interface, e);
            }
            if detached && let Err(e) = handle.attach_kernel_driver(interface) {
                warn!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
    }
}

/// Backend for CDC-ACM serial devices
pub struct CdcBackend {
    registry: UsbRegistry,
}

impl CdcBackend {
    pub fn new(registry: UsbRegistry) -> Self {
        Self { registry }
    }
}

impl VendorBackend for CdcBackend {
    fn name(&self) -> &str {
        "cdc-acm"
    }

    fn probe(&self, device: &Device) -> Result<Option<ProbedInterface>> {
        let Some(usb_device) = self.registry.get(device.key) else {
            return Ok(None);
        };
        let Some(layout) = CdcLayout::find(&usb_device) else {
            return Ok(None);
        };
        trace!("{} looks like CDC-ACM: {:?}", device.path, layout);

        let ops = CdcOps::open(&usb_device, layout)?;

        Ok(Some(ProbedInterface {
            capabilities: Capabilities::SERIAL | Capabilities::RESET,
            model: None,
            serial: None,
            desc: "Serial (CDC-ACM)".to_string(),
            ops: Box::new(ops),
        }))
    }
}
