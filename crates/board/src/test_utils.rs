//! Test utilities for boardwatch
//!
//! An in-memory device monitor and a scriptable vendor backend, so the
//! board manager can be exercised without hardware.
//!
//! # Example
//!
//! ```
//! use board::test_utils::{MockBackend, VirtualBus, TEENSY_VID, BOOTLOADER_PID};
//! use board::{BoardManager, ManagerConfig};
//! use std::sync::Arc;
//!
//! let bus = VirtualBus::new();
//! let manager = BoardManager::new(
//!     bus.monitor(),
//!     vec![Arc::new(MockBackend::teensy())],
//!     ManagerConfig::default(),
//! );
//!
//! bus.plug("usb-1-2", TEENSY_VID, BOOTLOADER_PID, Some("1234"));
//! manager.refresh().unwrap();
//! assert_eq!(manager.len(), 1);
//! ```

use crate::backend::{InterfaceOps, ProbedInterface, ProgressFn, SerialFlags, VendorBackend};
use crate::capability::Capabilities;
use crate::descriptor::Descriptor;
use crate::firmware::{Firmware, UploadFlags};
use crate::model::{self, BoardModel, TEENSY_30};
use crate::monitor::{Device, DeviceEvent, DeviceKey, DeviceMonitor, DeviceSink};
use common::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const TEENSY_VID: u16 = 0x16C0;
/// Product id of the HalfKay bootloader
pub const BOOTLOADER_PID: u16 = 0x0478;
/// Product id of the USB serial firmware
pub const SERIAL_PID: u16 = 0x0483;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct BusState {
    next_key: u64,
    present: BTreeMap<DeviceKey, Arc<Device>>,
    pending: VecDeque<DeviceEvent>,
    fail_next_list: bool,
}

/// Simulated USB bus
///
/// Plugging and unplugging queue events that the attached monitor delivers
/// on the next refresh.
#[derive(Clone, Default)]
pub struct VirtualBus {
    state: Arc<Mutex<BusState>>,
    descriptor: Descriptor,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monitor reading from this bus
    pub fn monitor(&self) -> Box<dyn DeviceMonitor> {
        Box::new(VirtualMonitor { bus: self.clone() })
    }

    /// Attach a device at `location`
    pub fn plug(&self, location: &str, vid: u16, pid: u16, serial: Option<&str>) -> Arc<Device> {
        let mut state = self.state.lock();
        state.next_key += 1;

        let key = DeviceKey(state.next_key);
        let device = Arc::new(Device {
            key,
            location: location.to_string(),
            path: format!("/dev/virtual/{}", key.0),
            vid,
            pid,
            serial: serial.map(str::to_string),
            interface_number: 0,
        });

        state.present.insert(key, Arc::clone(&device));
        state.pending.push_back(DeviceEvent::Added(Arc::clone(&device)));
        self.descriptor.notify();
        device
    }

    /// Detach a device
    pub fn unplug(&self, device: &Arc<Device>) {
        let mut state = self.state.lock();
        if state.present.remove(&device.key).is_some() {
            state.pending.push_back(DeviceEvent::Removed(Arc::clone(device)));
            self.descriptor.notify();
        }
    }

    /// Make the next enumeration fail
    pub fn fail_next_list(&self) {
        self.state.lock().fail_next_list = true;
    }

    pub fn present(&self) -> usize {
        self.state.lock().present.len()
    }
}

struct VirtualMonitor {
    bus: VirtualBus,
}

impl DeviceMonitor for VirtualMonitor {
    fn list(&mut self, sink: &mut DeviceSink<'_>) -> Result<()> {
        let devices: Vec<_> = {
            let mut state = self.bus.state.lock();
            if std::mem::take(&mut state.fail_next_list) {
                return Err(Error::Usb("Enumeration failed".to_string()));
            }
            state.pending.clear();
            state.present.values().cloned().collect()
        };
        self.bus.descriptor.clear();

        for device in devices {
            sink(DeviceEvent::Added(device))?;
        }
        Ok(())
    }

    fn refresh(&mut self, sink: &mut DeviceSink<'_>) -> Result<()> {
        loop {
            let event = {
                let mut state = self.bus.state.lock();
                let event = state.pending.pop_front();
                if state.pending.is_empty() {
                    self.bus.descriptor.clear();
                }
                event
            };

            match event {
                Some(event) => sink(event)?,
                None => return Ok(()),
            }
        }
    }

    fn descriptor(&self) -> Descriptor {
        self.bus.descriptor.clone()
    }
}

/// How the mock backend presents one VID/PID pair
#[derive(Debug, Clone)]
pub struct MockProfile {
    pub vid: u16,
    pub pid: u16,
    pub capabilities: Capabilities,
    pub model: Option<&'static BoardModel>,
    pub desc: &'static str,
}

/// Operations recorded by the mock backend, in call order
pub type OpsLog = Arc<Mutex<Vec<String>>>;

/// Backend recognizing devices by VID/PID
#[derive(Default)]
pub struct MockBackend {
    profiles: Vec<MockProfile>,
    log: OpsLog,
    fail_probe: Arc<Mutex<bool>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Teensy 3.0 lookalike: bootloader mode uploads and resets, serial
    /// mode talks and reboots
    pub fn teensy() -> Self {
        Self::new()
            .with_profile(MockProfile {
                vid: TEENSY_VID,
                pid: BOOTLOADER_PID,
                capabilities: Capabilities::UPLOAD | Capabilities::RESET,
                model: Some(&TEENSY_30),
                desc: "HalfKay Bootloader",
            })
            .with_profile(MockProfile {
                vid: TEENSY_VID,
                pid: SERIAL_PID,
                capabilities: Capabilities::SERIAL | Capabilities::REBOOT,
                model: None,
                desc: "USB Serial",
            })
    }

    pub fn with_profile(mut self, profile: MockProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn log(&self) -> OpsLog {
        Arc::clone(&self.log)
    }

    /// Make every probe fail until reset with `false`
    pub fn set_fail_probe(&self, fail: bool) {
        *self.fail_probe.lock() = fail;
    }
}

impl VendorBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn probe(&self, device: &Device) -> Result<Option<ProbedInterface>> {
        if *self.fail_probe.lock() {
            return Err(Error::Usb(format!("Cannot open {}", device.path)));
        }

        let Some(profile) = self
            .profiles
            .iter()
            .find(|p| p.vid == device.vid && p.pid == device.pid)
        else {
            return Ok(None);
        };

        Ok(Some(ProbedInterface {
            capabilities: profile.capabilities,
            model: profile.model,
            serial: None,
            desc: profile.desc.to_string(),
            ops: Box::new(MockOps {
                log: Arc::clone(&self.log),
                loopback: Mutex::new(VecDeque::new()),
            }),
        }))
    }
}

struct MockOps {
    log: OpsLog,
    loopback: Mutex<VecDeque<u8>>,
}

impl InterfaceOps for MockOps {
    fn upload(
        &self,
        firmware: &Firmware,
        _flags: UploadFlags,
        progress: &mut ProgressFn<'_>,
    ) -> Result<()> {
        let total = firmware.size();
        let mut written = 0;
        while written < total {
            written = (written + 1024).min(total);
            progress(written, total);
        }

        self.log
            .lock()
            .push(format!("upload {} {}", firmware.name(), total));
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.log.lock().push("reset".to_string());
        Ok(())
    }

    fn reboot(&self) -> Result<()> {
        self.log.lock().push("reboot".to_string());
        Ok(())
    }

    fn serial_set_attributes(&self, rate: u32, _flags: SerialFlags) -> Result<()> {
        self.log.lock().push(format!("serial {}", rate));
        Ok(())
    }

    fn serial_read(&self, buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize> {
        let mut loopback = self.loopback.lock();
        let n = buf.len().min(loopback.len());
        for (slot, byte) in buf.iter_mut().zip(loopback.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn serial_write(&self, buf: &[u8]) -> Result<usize> {
        self.loopback.lock().extend(buf);
        Ok(buf.len())
    }
}

/// Build an image of `size` bytes carrying the signature of `model`
pub fn firmware_for(model: &'static BoardModel, size: usize) -> Firmware {
    let mut image = vec![0xFF; size];
    if let Some(magic) = model::signature(model) {
        let len = magic.len().min(size);
        image[..len].copy_from_slice(&magic[..len]);
    }
    Firmware::from_bytes(format!("{}.bin", model.name), image)
}
