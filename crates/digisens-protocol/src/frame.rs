//! Frame encoding/decoding.
//!
//! ```text
//! +--------+--------+---------+-----------+---------+----------+------+
//! | header | length | command | address   | data    | checksum | CR   |
//! | @ or # | 2 dec  | 2 chars | 3|16 char | 0..n    | 2 hex    | 0x0D |
//! +--------+--------+---------+-----------+---------+----------+------+
//! ```
//!
//! The length field counts every character in front of the checksum,
//! including the header and the length field itself, so `@08gl123` carries
//! eight characters ahead of its checksum. The checksum is the XOR of those
//! same characters.

use bytes::{BufMut, BytesMut};

use crate::address::AddressMode;
use crate::checksum::{checksum, checksum_hex, parse_checksum_field};
use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};

/// Encoder/decoder for the ASCII frame envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a request frame: `command + address + data` inside the envelope.
    ///
    /// Broadcast commands pass an empty `address`. Any other address must
    /// have the length the header announces.
    pub fn encode(
        mode: AddressMode,
        address: &str,
        command: &str,
        data: &str,
    ) -> ProtocolResult<Vec<u8>> {
        if !address.is_empty() && address.len() != mode.id_len() {
            return Err(ProtocolError::InvalidAddress {
                mode: mode.as_str(),
                id: address.to_string(),
                expected: mode.id_len(),
            });
        }
        let mut payload = String::with_capacity(command.len() + address.len() + data.len());
        payload.push_str(command);
        payload.push_str(address);
        payload.push_str(data);
        Self::encode_payload(mode.header(), payload.as_bytes())
    }

    /// Wrap an arbitrary payload in the envelope.
    ///
    /// Used for reply frames, whose payload is a command-specific body.
    pub fn encode_payload(header: u8, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
        if AddressMode::from_header(header).is_none() {
            return Err(ProtocolError::UnknownHeader(header));
        }
        if let Some(&bad) = payload.iter().find(|b| !is_printable(**b)) {
            return Err(ProtocolError::NonAscii(bad));
        }

        let length = PREFIX_LEN + payload.len();
        if length > MAX_LENGTH_FIELD {
            return Err(ProtocolError::FrameTooLong {
                max: MAX_LENGTH_FIELD,
                actual: length,
            });
        }

        let mut buf = BytesMut::with_capacity(length + CHECKSUM_LEN + 1);
        buf.put_u8(header);
        buf.put_slice(format!("{:02}", length).as_bytes());
        buf.put_slice(payload);
        let cs = checksum_hex(&buf);
        buf.put_slice(cs.as_bytes());
        buf.put_u8(TERMINATOR);
        Ok(buf.to_vec())
    }

    /// Decode a received frame without verifying its checksum.
    ///
    /// Bytes ahead of the first header byte are skipped as line noise, and
    /// anything from the first terminator on is ignored.
    pub fn decode(raw: &[u8]) -> ProtocolResult<DecodedFrame> {
        let start = match raw.iter().position(|&b| AddressMode::from_header(b).is_some()) {
            Some(pos) => pos,
            None => {
                return match raw.first() {
                    Some(&b) => Err(ProtocolError::UnknownHeader(b)),
                    None => Err(ProtocolError::FrameTooShort {
                        expected: PREFIX_LEN + CHECKSUM_LEN,
                        actual: 0,
                    }),
                };
            }
        };
        if start > 0 {
            log::trace!("skipping {} noise byte(s) ahead of frame header", start);
        }

        let raw = &raw[start..];
        let end = raw
            .iter()
            .position(|&b| b == TERMINATOR)
            .unwrap_or(raw.len());
        let frame = &raw[..end];

        if frame.len() < PREFIX_LEN + CHECKSUM_LEN {
            return Err(ProtocolError::FrameTooShort {
                expected: PREFIX_LEN + CHECKSUM_LEN,
                actual: frame.len(),
            });
        }

        let split = frame.len() - CHECKSUM_LEN;
        let declared_length = std::str::from_utf8(&frame[1..PREFIX_LEN])
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok());

        // Non-ASCII bytes become '?' so block widths stay intact for the parser.
        let body: String = frame[PREFIX_LEN..split]
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '?' })
            .collect();

        Ok(DecodedFrame {
            header: frame[0],
            declared_length,
            body,
            checksum_field: frame[split..].to_vec(),
            covered: frame[..split].to_vec(),
        })
    }

    /// Decode a received frame and reject it unless its checksum verifies.
    pub fn decode_strict(raw: &[u8]) -> ProtocolResult<DecodedFrame> {
        let frame = Self::decode(raw)?;
        frame.verify_checksum()?;
        Ok(frame)
    }
}

fn is_printable(b: u8) -> bool {
    (0x20..0x7F).contains(&b)
}

/// A frame split into its envelope fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    header: u8,
    declared_length: Option<usize>,
    body: String,
    checksum_field: Vec<u8>,
    /// Header through body, exactly as received.
    covered: Vec<u8>,
}

impl DecodedFrame {
    /// Header byte as received.
    pub fn header(&self) -> u8 {
        self.header
    }

    /// Address mode signalled by the header.
    pub fn mode(&self) -> Option<AddressMode> {
        AddressMode::from_header(self.header)
    }

    /// Value of the length field, if it was two decimal digits.
    pub fn declared_length(&self) -> Option<usize> {
        self.declared_length
    }

    /// Everything between the length field and the checksum.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Checksum field as received.
    pub fn checksum_field(&self) -> String {
        String::from_utf8_lossy(&self.checksum_field).into_owned()
    }

    /// Checksum recomputed over the received header, length field and body.
    pub fn computed_checksum(&self) -> String {
        checksum_hex(&self.covered)
    }

    /// Whether the length field agrees with the number of characters received.
    pub fn length_consistent(&self) -> bool {
        self.declared_length == Some(self.covered.len())
    }

    /// Compare the received checksum with the recomputed one.
    pub fn verify_checksum(&self) -> ProtocolResult<()> {
        let expected = checksum(&self.covered);
        match parse_checksum_field(&self.checksum_field) {
            Some(actual) if actual == expected => Ok(()),
            _ => Err(ProtocolError::ChecksumMismatch {
                expected: self.computed_checksum(),
                actual: self.checksum_field(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_transcript() {
        let frame = FrameCodec::encode(AddressMode::Standard, "123", "sz", "0").unwrap();
        assert_eq!(frame, b"@09sz123040\r");
    }

    #[test]
    fn test_encode_read_all() {
        let frame = FrameCodec::encode(AddressMode::Standard, "123", "gl", "").unwrap();
        assert_eq!(frame, b"@08gl12373\r");
    }

    #[test]
    fn test_encode_broadcast() {
        let standard = FrameCodec::encode(AddressMode::Standard, "", "ag", "").unwrap();
        assert_eq!(standard, b"@05ag43\r");
        let extended = FrameCodec::encode(AddressMode::Extended, "", "ag", "").unwrap();
        assert_eq!(extended, b"#05ag20\r");
    }

    #[test]
    fn test_length_field_limit() {
        let data = "0".repeat(MAX_PAYLOAD_LEN - 18);
        let id = "ABCDEFGHIJKLMNOP";
        assert!(FrameCodec::encode(AddressMode::Extended, id, "gw", &data).is_ok());

        let data = "0".repeat(MAX_PAYLOAD_LEN - 17);
        let err = FrameCodec::encode(AddressMode::Extended, id, "gw", &data).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::FrameTooLong {
                max: MAX_LENGTH_FIELD,
                actual: 100
            }
        );
    }

    #[test]
    fn test_encode_rejects_address_of_other_mode() {
        let err = FrameCodec::encode(AddressMode::Standard, "0123456789ABCDEF", "gl", "")
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidAddress { expected: 3, ref id, .. } if id == "0123456789ABCDEF"
        ));
        assert!(FrameCodec::encode(AddressMode::Extended, "123", "gl", "").is_err());
    }

    #[test]
    fn test_encode_rejects_control_bytes() {
        let err = FrameCodec::encode(AddressMode::Standard, "123", "gw", "0\r").unwrap_err();
        assert_eq!(err, ProtocolError::NonAscii(b'\r'));
    }

    #[test]
    fn test_decode_reply() {
        let frame = FrameCodec::decode(b"@13 0002.130 5C\r").unwrap();
        assert_eq!(frame.header(), b'@');
        assert_eq!(frame.mode(), Some(AddressMode::Standard));
        assert_eq!(frame.declared_length(), Some(13));
        assert!(frame.length_consistent());
        assert_eq!(frame.body(), " 0002.130 ");
        assert_eq!(frame.checksum_field(), "5C");
        assert!(frame.verify_checksum().is_ok());
    }

    #[test]
    fn test_decode_without_terminator() {
        let frame = FrameCodec::decode(b"@13 0002.130 5C").unwrap();
        assert_eq!(frame.body(), " 0002.130 ");
    }

    #[test]
    fn test_decode_skips_leading_noise() {
        let frame = FrameCodec::decode(b"\x00\xff@13 0002.130 5C\r").unwrap();
        assert_eq!(frame.body(), " 0002.130 ");
    }

    #[test]
    fn test_decode_too_short() {
        let err = FrameCodec::decode(b"@1\r").unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooShort { actual: 2, .. }));
        assert!(FrameCodec::decode(b"").is_err());
        assert_eq!(
            FrameCodec::decode(b"xyz").unwrap_err(),
            ProtocolError::UnknownHeader(b'x')
        );
    }

    #[test]
    fn test_strict_detects_corruption() {
        let err = FrameCodec::decode_strict(b"@13 0003.130 5C\r").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ChecksumMismatch {
                expected: "5D".to_string(),
                actual: "5C".to_string()
            }
        );
        // Lenient decoding still hands the body over.
        let frame = FrameCodec::decode(b"@13 0003.130 5C\r").unwrap();
        assert_eq!(frame.body(), " 0003.130 ");
    }

    #[test]
    fn test_round_trip_recovers_fields() {
        let cases = [
            (AddressMode::Standard, "123", "gw", "03"),
            (AddressMode::Standard, "007", "gd", "41"),
            (AddressMode::Extended, "0123456789ABCDEF", "gl", ""),
            (AddressMode::Extended, "ZYXWVUTSRQPONMLK", "sz", "7"),
        ];
        for (mode, address, command, data) in cases {
            let encoded = FrameCodec::encode(mode, address, command, data).unwrap();
            let decoded = FrameCodec::decode(&encoded).unwrap();
            assert_eq!(decoded.mode(), Some(mode));
            assert_eq!(&decoded.body()[command.len()..command.len() + address.len()], address);
            assert_eq!(decoded.computed_checksum(), decoded.checksum_field());
            assert!(decoded.length_consistent());
        }
    }

    #[test]
    fn test_reply_payload() {
        let frame = FrameCodec::encode_payload(b'@', b"-0001.250M").unwrap();
        assert_eq!(frame, b"@13-0001.250M3A\r");
    }
}
