//! Device addressing.

use std::fmt;
use std::str::FromStr;

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};

/// Which address space a frame uses. Selected by the frame header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    /// `@` header, 3-character ids.
    Standard,
    /// `#` header, 16-character ids.
    Extended,
}

impl AddressMode {
    /// Header byte that opens frames in this mode.
    pub const fn header(self) -> u8 {
        match self {
            AddressMode::Standard => HEADER_STANDARD,
            AddressMode::Extended => HEADER_EXTENDED,
        }
    }

    /// Required id length in this mode.
    pub const fn id_len(self) -> usize {
        match self {
            AddressMode::Standard => STANDARD_ID_LEN,
            AddressMode::Extended => EXTENDED_ID_LEN,
        }
    }

    /// Mode selected by a header byte, if it is one.
    pub fn from_header(byte: u8) -> Option<Self> {
        match byte {
            HEADER_STANDARD => Some(AddressMode::Standard),
            HEADER_EXTENDED => Some(AddressMode::Extended),
            _ => None,
        }
    }

    /// Mode whose id length is `len`, if any.
    pub fn from_id_len(len: usize) -> Option<Self> {
        match len {
            STANDARD_ID_LEN => Some(AddressMode::Standard),
            EXTENDED_ID_LEN => Some(AddressMode::Extended),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            AddressMode::Standard => "standard",
            AddressMode::Extended => "extended",
        }
    }
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one device on the bus.
///
/// The id length always matches the mode: 3 characters for
/// [`AddressMode::Standard`], 16 for [`AddressMode::Extended`]. Ids are
/// printable ASCII without spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    mode: AddressMode,
    id: String,
}

impl DeviceAddress {
    /// Create an address, validating the id against the mode.
    pub fn new(mode: AddressMode, id: impl Into<String>) -> ProtocolResult<Self> {
        let id = id.into();
        let well_formed =
            id.len() == mode.id_len() && id.bytes().all(|b| b.is_ascii_graphic());
        if !well_formed {
            return Err(ProtocolError::InvalidAddress {
                mode: mode.as_str(),
                id,
                expected: mode.id_len(),
            });
        }
        Ok(DeviceAddress { mode, id })
    }

    /// Standard (3-character) address.
    pub fn standard(id: impl Into<String>) -> ProtocolResult<Self> {
        Self::new(AddressMode::Standard, id)
    }

    /// Extended (16-character) address.
    pub fn extended(id: impl Into<String>) -> ProtocolResult<Self> {
        Self::new(AddressMode::Extended, id)
    }

    /// The address mode.
    pub fn mode(&self) -> AddressMode {
        self.mode
    }

    /// The device id as sent on the wire.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Frame header byte for this address.
    pub fn header(&self) -> u8 {
        self.mode.header()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.header() as char, self.id)
    }
}

/// Parses a bare id, inferring the mode from its length.
impl FromStr for DeviceAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match AddressMode::from_id_len(s.len()) {
            Some(mode) => DeviceAddress::new(mode, s),
            None => Err(ProtocolError::InvalidAddress {
                mode: "standard or extended",
                id: s.to_string(),
                expected: STANDARD_ID_LEN,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_address() {
        let addr = DeviceAddress::standard("123").unwrap();
        assert_eq!(addr.mode(), AddressMode::Standard);
        assert_eq!(addr.header(), b'@');
        assert_eq!(addr.to_string(), "@123");
    }

    #[test]
    fn test_extended_address() {
        let addr = DeviceAddress::extended("0123456789ABCDEF").unwrap();
        assert_eq!(addr.header(), b'#');
        assert_eq!(addr.id().len(), 16);
    }

    #[test]
    fn test_length_must_match_mode() {
        assert!(DeviceAddress::standard("12").is_err());
        assert!(DeviceAddress::standard("1234").is_err());
        assert!(DeviceAddress::extended("123").is_err());
        assert!(DeviceAddress::standard("1 3").is_err());
    }

    #[test]
    fn test_parse_infers_mode() {
        let standard: DeviceAddress = "042".parse().unwrap();
        assert_eq!(standard.mode(), AddressMode::Standard);

        let extended: DeviceAddress = "A1B2C3D4E5F60718".parse().unwrap();
        assert_eq!(extended.mode(), AddressMode::Extended);

        assert!("12345".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_mode_header_round_trip() {
        for mode in [AddressMode::Standard, AddressMode::Extended] {
            assert_eq!(AddressMode::from_header(mode.header()), Some(mode));
            assert_eq!(AddressMode::from_id_len(mode.id_len()), Some(mode));
        }
        assert_eq!(AddressMode::from_header(b'>'), None);
    }
}
