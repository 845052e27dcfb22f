//! Common utilities for boardwatch
//!
//! This crate provides functionality shared by the board manager, the task
//! pool and the command-line front end: the error type, logging setup and
//! timeout arithmetic for blocking waits.

pub mod error;
pub mod logging;
pub mod timeout;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use timeout::adjust_timeout;
