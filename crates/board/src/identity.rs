//! Board identity strings
//!
//! A board can be addressed as `LOCATION`, `LOCATION#SERIAL` or `#SERIAL`.
//! An empty string matches every board.

use common::Error;
use std::str::FromStr;

/// Parsed board identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub location: Option<String>,
    pub serial: Option<u64>,
}

impl Identity {
    /// Identity matching every board
    pub fn any() -> Self {
        Self::default()
    }

    /// Exact match on the parts that are present
    ///
    /// A serial of 0 is compared like any other value: `#0` only selects
    /// boards that report no serial number, it is not a wildcard.
    pub fn matches(&self, location: &str, serial: u64) -> bool {
        if let Some(expected) = &self.location
            && expected != location
        {
            return false;
        }
        if let Some(expected) = self.serial
            && expected != serial
        {
            return false;
        }

        true
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let (location, serial) = match id.split_once('#') {
            Some((location, serial)) => (location, Some(serial)),
            None => (id, None),
        };

        let location = (!location.is_empty()).then(|| location.to_string());
        let serial = serial
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| Error::Param("#<serial> must be a number".to_string()))
            })
            .transpose()?;

        Ok(Self { location, serial })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let id: Identity = "usb-1-2".parse().unwrap();
        assert_eq!(id.location.as_deref(), Some("usb-1-2"));
        assert_eq!(id.serial, None);

        let id: Identity = "usb-1-2#42".parse().unwrap();
        assert_eq!(id.location.as_deref(), Some("usb-1-2"));
        assert_eq!(id.serial, Some(42));

        let id: Identity = "#42".parse().unwrap();
        assert_eq!(id.location, None);
        assert_eq!(id.serial, Some(42));

        let id: Identity = "".parse().unwrap();
        assert_eq!(id, Identity::any());
    }

    #[test]
    fn test_parse_bad_serial() {
        assert!(matches!("loc#abc".parse::<Identity>(), Err(Error::Param(_))));
        assert!(matches!("loc#".parse::<Identity>(), Err(Error::Param(_))));
        assert!(matches!("#12x".parse::<Identity>(), Err(Error::Param(_))));
    }

    #[test]
    fn test_matching() {
        let id: Identity = "loc#42".parse().unwrap();
        assert!(id.matches("loc", 42));
        assert!(!id.matches("loc", 43));
        assert!(!id.matches("other", 42));

        let id: Identity = "#42".parse().unwrap();
        assert!(id.matches("loc", 42));
        assert!(id.matches("other", 42));
        assert!(!id.matches("loc", 0));

        let id = Identity::any();
        assert!(id.matches("anything", 0));
        assert!(id.matches("loc", 42));
    }

    #[test]
    fn test_zero_serial_is_not_a_wildcard() {
        let id: Identity = "#0".parse().unwrap();
        assert_eq!(id.serial, Some(0));
        assert!(id.matches("loc", 0));
        assert!(!id.matches("loc", 42));
    }
}
