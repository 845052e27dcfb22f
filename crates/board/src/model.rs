//! Board model catalog
//!
//! Supported models are compiled in. Each one owns a short byte signature
//! that shows up near the start of any image built for it, which lets us
//! refuse firmware compiled for the wrong board before flashing it.

use std::fmt;

/// Length of every firmware signature
pub const SIGNATURE_LEN: usize = 8;

/// A supported board model
#[derive(Debug, PartialEq, Eq)]
pub struct BoardModel {
    /// Short name, used on the command line
    pub name: &'static str,
    /// Microcontroller name, accepted as an alias of `name`
    pub mcu: &'static str,
    /// Human-readable description
    pub desc: &'static str,
    /// Flash capacity available to user code, in bytes
    pub code_size: usize,
}

impl BoardModel {
    /// Backends may report a placeholder model with no code size when they
    /// only know the family; such models cannot be uploaded to.
    pub fn is_valid(&self) -> bool {
        self.code_size > 0
    }
}

impl fmt::Display for BoardModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.desc)
    }
}

pub static TEENSY_PP10: BoardModel = BoardModel {
    name: "teensy++10",
    mcu: "at90usb646",
    desc: "Teensy++ 1.0",
    code_size: 64512,
};

pub static TEENSY_20: BoardModel = BoardModel {
    name: "teensy20",
    mcu: "atmega32u4",
    desc: "Teensy 2.0",
    code_size: 32256,
};

pub static TEENSY_PP20: BoardModel = BoardModel {
    name: "teensy++20",
    mcu: "at90usb1286",
    desc: "Teensy++ 2.0",
    code_size: 130048,
};

pub static TEENSY_30: BoardModel = BoardModel {
    name: "teensy30",
    mcu: "mk20dx128",
    desc: "Teensy 3.0",
    code_size: 131072,
};

pub static TEENSY_31: BoardModel = BoardModel {
    name: "teensy31",
    mcu: "mk20dx256",
    desc: "Teensy 3.1",
    code_size: 262144,
};

/// All supported models
pub static MODELS: [&BoardModel; 5] = [
    &TEENSY_PP10,
    &TEENSY_20,
    &TEENSY_PP20,
    &TEENSY_30,
    &TEENSY_31,
];

struct FirmwareSignature {
    model: &'static BoardModel,
    magic: [u8; SIGNATURE_LEN],
}

static SIGNATURES: [FirmwareSignature; 5] = [
    FirmwareSignature {
        model: &TEENSY_PP10,
        magic: [0x0C, 0x94, 0x00, 0x7E, 0xFF, 0xCF, 0xF8, 0x94],
    },
    FirmwareSignature {
        model: &TEENSY_20,
        magic: [0x0C, 0x94, 0x00, 0x3F, 0xFF, 0xCF, 0xF8, 0x94],
    },
    FirmwareSignature {
        model: &TEENSY_PP20,
        magic: [0x0C, 0x94, 0x00, 0xFE, 0xFF, 0xCF, 0xF8, 0x94],
    },
    FirmwareSignature {
        model: &TEENSY_30,
        magic: [0x38, 0x80, 0x04, 0x40, 0x82, 0x3F, 0x04, 0x00],
    },
    FirmwareSignature {
        model: &TEENSY_31,
        magic: [0x30, 0x80, 0x04, 0x40, 0x82, 0x3F, 0x04, 0x00],
    },
];

/// Find a model by name or MCU name
pub fn find_model(name: &str) -> Option<&'static BoardModel> {
    MODELS
        .iter()
        .copied()
        .find(|model| model.name == name || model.mcu == name)
}

/// Signature bytes of a model, if it has one
pub fn signature(model: &BoardModel) -> Option<&'static [u8; SIGNATURE_LEN]> {
    SIGNATURES
        .iter()
        .find(|sig| std::ptr::eq(sig.model, model))
        .map(|sig| &sig.magic)
}

/// Guess which model an image was compiled for
///
/// Naive scan: every window of the image is compared against every
/// signature. Fine for a handful of models; a large catalog would need a
/// multi-pattern matcher.
pub fn identify_firmware(image: &[u8]) -> Option<&'static BoardModel> {
    image.windows(SIGNATURE_LEN).find_map(|window| {
        SIGNATURES
            .iter()
            .find(|sig| window == sig.magic)
            .map(|sig| sig.model)
    })
}

/// Compare two model references by identity
pub fn same_model(a: &BoardModel, b: &BoardModel) -> bool {
    std::ptr::eq(a, b)
}
