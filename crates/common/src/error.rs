//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A caller passed something malformed (bad identity string, wrong task state)
    #[error("Invalid parameter: {0}")]
    Param(String),

    /// The board or device went away, or a location is unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested capability is not available in the current mode
    #[error("Not available in this mode: {0}")]
    Mode(String),

    #[error("Firmware is too big for {model}: {size} bytes (max: {max})")]
    FirmwareTooLarge {
        size: usize,
        max: usize,
        model: String,
    },

    /// Firmware was built for another model, or for no known model
    #[error("Firmware error: {0}")]
    Firmware(String),

    /// Could not allocate a system resource (thread, handle)
    #[error("Out of resources: {0}")]
    Resources(String),

    #[error("USB error: {0}")]
    Usb(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::FirmwareTooLarge {
            size: 40_000,
            max: 32_256,
            model: "Teensy 2.0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Teensy 2.0"));
        assert!(msg.contains("40000"));
        assert!(msg.contains("32256"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.hex");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(format!("{}", err).contains("missing.hex"));
    }
}
