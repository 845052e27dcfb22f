//! libusb integration
//!
//! Feeds the board manager from libusb: `UsbMonitor` turns enumeration and
//! hotplug notifications into device events, `CdcBackend` drives generic
//! CDC-ACM serial devices. Both share a `UsbRegistry` so the backend can
//! find the libusb device behind a `board::Device`.

pub mod backend;
pub mod device;
pub mod monitor;

pub use backend::CdcBackend;
pub use device::UsbRegistry;
pub use monitor::UsbMonitor;
