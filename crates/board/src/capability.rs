//! Board capabilities
//!
//! A capability is an operation category a board can perform. Each board
//! interface advertises a subset, and the board maps every capability to the
//! interface currently responsible for it.

use bitflags::bitflags;
use std::fmt;

/// A single operation category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Upload,
    Reset,
    Reboot,
    Serial,
}

impl Capability {
    /// Number of distinct capabilities (size of per-board lookup tables)
    pub const COUNT: usize = 4;

    /// All capabilities, in table order
    pub const ALL: [Capability; Capability::COUNT] = [
        Capability::Upload,
        Capability::Reset,
        Capability::Reboot,
        Capability::Serial,
    ];

    /// Slot of this capability in per-board lookup tables
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::Upload => "upload",
            Capability::Reset => "reset",
            Capability::Reboot => "reboot",
            Capability::Serial => "serial",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Set of capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        const UPLOAD = 1 << 0;
        const RESET = 1 << 1;
        const REBOOT = 1 << 2;
        const SERIAL = 1 << 3;
    }
}

impl From<Capability> for Capabilities {
    fn from(cap: Capability) -> Self {
        Capabilities::from_bits_truncate(1 << cap.index())
    }
}

impl Capabilities {
    /// Check membership of a single capability
    pub fn has(self, cap: Capability) -> bool {
        self.contains(Capabilities::from(cap))
    }

    /// Iterate over the capabilities in this set, in table order
    pub fn capabilities(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |cap| self.has(*cap))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }

        let names: Vec<&str> = self.capabilities().map(Capability::name).collect();
        f.write_str(&names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_bits_match_table_order() {
        for cap in Capability::ALL {
            assert_eq!(Capabilities::from(cap).bits(), 1 << cap.index());
        }
    }

    #[test]
    fn test_capabilities_iteration() {
        let caps = Capabilities::UPLOAD | Capabilities::SERIAL;
        let list: Vec<Capability> = caps.capabilities().collect();
        assert_eq!(list, vec![Capability::Upload, Capability::Serial]);
        assert!(caps.has(Capability::Serial));
        assert!(!caps.has(Capability::Reboot));
    }

    #[test]
    fn test_capabilities_display() {
        assert_eq!(Capabilities::empty().to_string(), "(none)");
        assert_eq!(
            (Capabilities::RESET | Capabilities::REBOOT).to_string(),
            "reset, reboot"
        );
    }
}
