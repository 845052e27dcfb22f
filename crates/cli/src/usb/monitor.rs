//! libusb device monitor
//!
//! With hotplug support, libusb callbacks queue raw arrivals and
//! departures and a dedicated thread runs `handle_events`. Without it the
//! monitor re-enumerates once per second and diffs against what it last
//! reported. Either way, descriptors are read in `refresh` on the manager's
//! thread, never inside a libusb callback.

use super::device::{UsbRegistry, check_filter, device_key, is_root_hub, to_board_device};
use board::{Descriptor, Device, DeviceEvent, DeviceKey, DeviceMonitor, DeviceSink};
use common::{Error, Result};
use parking_lot::Mutex;
use rusb::{Context, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

enum RawEvent {
    Arrived(rusb::Device<Context>),
    Left(DeviceKey),
}

/// State shared with the hotplug callback
#[derive(Default)]
struct Pending {
    queue: Mutex<VecDeque<RawEvent>>,
    descriptor: Descriptor,
}

impl Pending {
    fn push(&self, event: RawEvent) {
        self.queue.lock().push_back(event);
        self.descriptor.notify();
    }
}

struct HotplugCallback {
    pending: Arc<Pending>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        trace!("Hotplug arrival: {:?}", device);
        self.pending.push(RawEvent::Arrived(device));
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        trace!("Hotplug departure: {:?}", device);
        self.pending.push(RawEvent::Left(device_key(&device)));
    }
}

/// Thread running libusb event handling for hotplug delivery
struct EventThread {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    fn spawn(context: Context) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || {
                debug!("USB event thread started");
                while !flag.load(Ordering::Relaxed) {
                    match context.handle_events(Some(EVENT_TIMEOUT)) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("USB event handling interrupted");
                        }
                        Err(e) => {
                            warn!("Error handling USB events: {}", e);
                            thread::sleep(EVENT_TIMEOUT);
                        }
                    }
                }
                debug!("USB event thread stopped");
            })
            .map_err(|e| Error::Resources(format!("Failed to spawn USB event thread: {}", e)))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("USB event thread panicked");
        }
    }
}

enum Mode {
    Hotplug {
        // Field order matters: the registration must go before the thread
        _registration: Registration<Context>,
        _thread: EventThread,
    },
    Polling,
}

/// Devices reported to the manager
///
/// A device stays unconfirmed until the sink accepts its `Added` event.
/// Unconfirmed devices are offered again on the next `list` or scan, so a
/// failed probe or an aborted dispatch does not hide them until replug.
#[derive(Default)]
struct KnownDevices {
    devices: HashMap<DeviceKey, Arc<Device>>,
    unconfirmed: HashSet<DeviceKey>,
}

impl KnownDevices {
    fn is_reported(&self, key: DeviceKey) -> bool {
        self.devices.contains_key(&key) && !self.unconfirmed.contains(&key)
    }

    fn keys(&self) -> impl Iterator<Item = DeviceKey> + '_ {
        self.devices.keys().copied()
    }

    fn offer(&mut self, device: Arc<Device>, sink: &mut DeviceSink<'_>) -> Result<()> {
        let key = device.key;
        let device = Arc::clone(self.devices.entry(key).or_insert(device));
        self.unconfirmed.insert(key);

        sink(DeviceEvent::Added(device))?;
        self.unconfirmed.remove(&key);
        Ok(())
    }

    fn withdraw(&mut self, key: DeviceKey, sink: &mut DeviceSink<'_>) -> Result<()> {
        self.unconfirmed.remove(&key);
        let Some(device) = self.devices.remove(&key) else {
            return Ok(());
        };
        debug!("Device {} left {}", key, device.location);

        sink(DeviceEvent::Removed(device))
    }
}

/// Device monitor backed by libusb
pub struct UsbMonitor {
    context: Context,
    filters: Vec<String>,
    registry: UsbRegistry,
    known: KnownDevices,
    pending: Arc<Pending>,
    mode: Mode,
}

impl UsbMonitor {
    /// Create a monitor; devices are reported on the first `list`
    pub fn new(context: Context, filters: Vec<String>, registry: UsbRegistry) -> Result<Self> {
        let pending = Arc::new(Pending::default());

        let mode = if rusb::has_hotplug() {
            let callback = HotplugCallback {
                pending: Arc::clone(&pending),
            };
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(callback))
                .map_err(|e| Error::Usb(format!("Failed to register hotplug callback: {}", e)))?;
            debug!("Hot-plug callbacks registered");

            Mode::Hotplug {
                _registration: registration,
                _thread: EventThread::spawn(context.clone())?,
            }
        } else {
            info!("libusb has no hotplug support, polling every {:?}", POLL_INTERVAL);
            Mode::Polling
        };

        Ok(Self {
            context,
            filters,
            registry,
            known: KnownDevices::default(),
            pending,
            mode,
        })
    }

    fn is_polling(&self) -> bool {
        matches!(self.mode, Mode::Polling)
    }

    /// Devices currently on the bus that pass the filters
    fn scan(&self) -> Result<Vec<rusb::Device<Context>>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Usb(format!("Failed to enumerate devices: {}", e)))?;

        Ok(devices.iter().filter(|d| self.wanted(d)).collect())
    }

    fn wanted(&self, device: &rusb::Device<Context>) -> bool {
        let Ok(desc) = device.device_descriptor() else {
            return false;
        };
        !is_root_hub(&desc) && check_filter(desc.vendor_id(), desc.product_id(), &self.filters)
    }

    fn arrive(&mut self, device: rusb::Device<Context>, sink: &mut DeviceSink<'_>) -> Result<()> {
        let key = device_key(&device);
        if self.known.is_reported(key) {
            return Ok(());
        }
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                debug!("Ignoring device without descriptor: {}", e);
                return Ok(());
            }
        };

        let board_device = Arc::new(to_board_device(&device, &desc));
        debug!(
            "Device {} at {} ({:04x}:{:04x})",
            board_device.key, board_device.location, board_device.vid, board_device.pid
        );
        // The backend looks the device up while the manager probes it
        self.registry.insert(key, device);

        self.known.offer(board_device, sink)
    }

    fn leave(&mut self, key: DeviceKey, sink: &mut DeviceSink<'_>) -> Result<()> {
        self.registry.remove(key);
        self.known.withdraw(key, sink)
    }

    fn schedule_poll(&self) {
        self.pending.descriptor.clear();
        self.pending
            .descriptor
            .set_deadline(Some(Instant::now() + POLL_INTERVAL));
    }

    fn refresh_polling(&mut self, sink: &mut DeviceSink<'_>) -> Result<()> {
        let present = self.scan()?;
        self.schedule_poll();

        let present_keys: Vec<DeviceKey> = present.iter().map(device_key).collect();
        let gone: Vec<DeviceKey> = self
            .known
            .keys()
            .filter(|key| !present_keys.contains(key))
            .collect();

        for key in gone {
            self.leave(key, sink)?;
        }
        for device in present {
            self.arrive(device, sink)?;
        }

        Ok(())
    }
}

impl DeviceMonitor for UsbMonitor {
    fn list(&mut self, sink: &mut DeviceSink<'_>) -> Result<()> {
        let devices = self.scan()?;
        if self.is_polling() {
            self.schedule_poll();
        }

        for device in devices {
            self.arrive(device, sink)?;
        }

        Ok(())
    }

    fn refresh(&mut self, sink: &mut DeviceSink<'_>) -> Result<()> {
        if self.is_polling() {
            return self.refresh_polling(sink);
        }

        loop {
            let event = {
                let mut queue = self.pending.queue.lock();
                let event = queue.pop_front();
                if queue.is_empty() {
                    self.pending.descriptor.clear();
                }
                event
            };

            match event {
                Some(RawEvent::Arrived(device)) => {
                    if self.wanted(&device) {
                        self.arrive(device, sink)?;
                    }
                }
                Some(RawEvent::Left(key)) => self.leave(key, sink)?,
                None => return Ok(()),
            }
        }
    }

    fn descriptor(&self) -> Descriptor {
        self.pending.descriptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(key: u64) -> Arc<Device> {
        Arc::new(Device {
            key: DeviceKey(key),
            location: format!("usb-1-{}", key),
            path: format!("/dev/bus/usb/001/{:03}", key),
            vid: 0x16c0,
            pid: 0x0483,
            serial: Some("1234".to_string()),
            interface_number: 0,
        })
    }

    #[test]
    fn test_failed_offer_is_retried() {
        let mut known = KnownDevices::default();
        let mut delivered = Vec::new();

        let mut failing = |event: DeviceEvent| -> Result<()> {
            delivered.push(event.device().key);
            Err(Error::Usb("busy".to_string()))
        };
        assert!(known.offer(device(4), &mut failing).is_err());
        assert!(!known.is_reported(DeviceKey(4)));

        let mut accepting = |event: DeviceEvent| -> Result<()> {
            delivered.push(event.device().key);
            Ok(())
        };
        known.offer(device(4), &mut accepting).unwrap();
        assert!(known.is_reported(DeviceKey(4)));

        assert_eq!(delivered, vec![DeviceKey(4), DeviceKey(4)]);
    }

    #[test]
    fn test_unconfirmed_device_can_still_leave() {
        let mut known = KnownDevices::default();
        let mut failing = |_: DeviceEvent| -> Result<()> { Err(Error::Other("abort".to_string())) };
        assert!(known.offer(device(7), &mut failing).is_err());

        let mut removed = Vec::new();
        let mut sink = |event: DeviceEvent| -> Result<()> {
            if let DeviceEvent::Removed(device) = event {
                removed.push(device.key);
            }
            Ok(())
        };
        known.withdraw(DeviceKey(7), &mut sink).unwrap();
        known.withdraw(DeviceKey(7), &mut sink).unwrap();

        assert_eq!(removed, vec![DeviceKey(7)]);
        assert_eq!(known.keys().count(), 0);
    }
}
