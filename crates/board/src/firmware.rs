//! Firmware images
//!
//! Only raw binary images are handled here; decoding container formats such
//! as Intel HEX belongs to the caller.

use crate::model::{self, BoardModel};
use bitflags::bitflags;
use common::Result;
use std::fs;
use std::path::Path;
use tracing::debug;

bitflags! {
    /// Options for `Board::upload`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UploadFlags: u32 {
        /// Skip the firmware signature check
        const NO_CHECK = 1 << 0;
    }
}

/// A firmware image ready to be flashed
#[derive(Debug, Clone)]
pub struct Firmware {
    name: String,
    image: Vec<u8>,
}

impl Firmware {
    pub fn from_bytes(name: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }

    /// Load a raw binary image from disk
    pub fn load(path: &Path) -> Result<Self> {
        let image = fs::read(path)?;
        debug!("Loaded firmware {} ({} bytes)", path.display(), image.len());

        Ok(Self::from_bytes(path.display().to_string(), image))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn size(&self) -> usize {
        self.image.len()
    }

    /// Guess the model this image was compiled for
    pub fn identify(&self) -> Option<&'static BoardModel> {
        model::identify_firmware(&self.image)
    }
}
