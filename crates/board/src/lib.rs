//! Board tracking for boardwatch
//!
//! Turns raw OS device notifications into stable boards: a board keeps its
//! identity while its interfaces disappear and come back as the device
//! switches between firmware and bootloader, and is only dropped after a
//! grace period without any interface.

pub mod backend;
pub mod board;
pub mod capability;
pub mod descriptor;
pub mod firmware;
pub mod identity;
pub mod interface;
pub mod manager;
pub mod model;
pub mod monitor;
pub mod test_utils;
pub mod timer;

pub use backend::{InterfaceOps, ProbedInterface, ProgressFn, SerialFlags, VendorBackend};
pub use board::{Board, BoardGuard, BoardState};
pub use capability::{Capabilities, Capability};
pub use descriptor::{Descriptor, DescriptorSet};
pub use firmware::{Firmware, UploadFlags};
pub use identity::Identity;
pub use interface::Interface;
pub use manager::{
    BoardEvent, BoardManager, CallbackId, CallbackResult, DEFAULT_DROP_DELAY, ManagerConfig,
};
pub use model::{BoardModel, MODELS, find_model, identify_firmware};
pub use monitor::{Device, DeviceEvent, DeviceKey, DeviceMonitor, DeviceSink};
pub use timer::Timer;
