//! Conversion from libusb devices to board devices

use board::{Device, DeviceKey};
use parking_lot::Mutex;
use rusb::{Context, DeviceDescriptor, UsbContext};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Linux root hub vendor
const LINUX_FOUNDATION_VID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

/// libusb devices currently known to the monitor, by key
#[derive(Clone, Default)]
pub struct UsbRegistry {
    devices: Arc<Mutex<HashMap<DeviceKey, rusb::Device<Context>>>>,
}

impl UsbRegistry {
    pub fn insert(&self, key: DeviceKey, device: rusb::Device<Context>) {
        self.devices.lock().insert(key, device);
    }

    pub fn remove(&self, key: DeviceKey) {
        self.devices.lock().remove(&key);
    }

    pub fn get(&self, key: DeviceKey) -> Option<rusb::Device<Context>> {
        self.devices.lock().get(&key).cloned()
    }
}

/// Key derived from the bus number and address
///
/// libusb only reuses an address once the previous device has left, and
/// the monitor reports the removal before the new arrival.
pub fn device_key<T: UsbContext>(device: &rusb::Device<T>) -> DeviceKey {
    DeviceKey(u64::from(device.bus_number()) << 8 | u64::from(device.address()))
}

/// Physical location, e.g. `usb-1-2.4`
pub fn location<T: UsbContext>(device: &rusb::Device<T>) -> String {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let ports: Vec<String> = ports.iter().map(u8::to_string).collect();
            format!("usb-{}-{}", device.bus_number(), ports.join("."))
        }
        _ => format!("usb-{}-a{}", device.bus_number(), device.address()),
    }
}

pub fn node_path<T: UsbContext>(device: &rusb::Device<T>) -> String {
    format!(
        "/dev/bus/usb/{:03}/{:03}",
        device.bus_number(),
        device.address()
    )
}

pub fn is_root_hub(desc: &DeviceDescriptor) -> bool {
    desc.vendor_id() == LINUX_FOUNDATION_VID || desc.class_code() == HUB_CLASS
}

/// Build the board-side view of a libusb device
///
/// Reading the serial string needs the device open; when that fails
/// (permissions, device busy) the device is reported without serial.
pub fn to_board_device<T: UsbContext>(
    device: &rusb::Device<T>,
    desc: &DeviceDescriptor,
) -> Device {
    let serial = if desc.serial_number_string_index().is_some() {
        match device.open() {
            Ok(handle) => handle
                .read_serial_number_string_ascii(desc)
                .map_err(|e| trace!("Cannot read serial of {}: {}", node_path(device), e))
                .ok(),
            Err(e) => {
                debug!("Cannot open {} to read serial: {}", node_path(device), e);
                None
            }
        }
    } else {
        None
    };

    Device {
        key: device_key(device),
        location: location(device),
        path: node_path(device),
        vid: desc.vendor_id(),
        pid: desc.product_id(),
        serial,
        interface_number: 0,
    }
}

/// Check if a VID/PID pair is allowed by the filters
///
/// Filters are validated by the config loader; malformed entries never
/// match.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    // If no filters are defined, all devices are allowed
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        if filter == "*" {
            return true;
        }
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        id_matches(filter_vid, vid) && id_matches(filter_pid, pid)
    })
}

fn id_matches(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16)
        .map(|v| v == id)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_filter_no_filters() {
        assert!(check_filter(0x16c0, 0x0478, &[]));
    }

    #[test]
    fn test_check_filter_exact() {
        let filters = vec!["0x16c0:0x0478".to_string()];
        assert!(check_filter(0x16c0, 0x0478, &filters));
        assert!(!check_filter(0x16c0, 0x0483, &filters));
        assert!(!check_filter(0x2341, 0x0478, &filters));
    }

    #[test]
    fn test_check_filter_wildcards() {
        let filters = vec!["0x16c0:*".to_string(), "*:0x0043".to_string()];
        assert!(check_filter(0x16c0, 0x0483, &filters));
        assert!(check_filter(0x2341, 0x0043, &filters));
        assert!(!check_filter(0x2341, 0x0042, &filters));

        assert!(check_filter(0x1234, 0x5678, &["*".to_string()]));
    }

    #[test]
    fn test_check_filter_malformed() {
        let filters = vec!["0x16c0".to_string(), "0xZZZZ:*".to_string()];
        assert!(!check_filter(0x16c0, 0x0478, &filters));
    }
}
