//! XOR checksum used by every frame.

use crate::constants::CHECKSUM_LEN;

/// XOR every byte together.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, &b| acc ^ b)
}

/// Checksum rendered the way it travels on the wire: two uppercase hex digits.
pub fn checksum_hex(bytes: &[u8]) -> String {
    hex::encode_upper([checksum(bytes)])
}

/// Parse a two-character checksum field back into its byte value.
///
/// Lowercase digits are accepted; anything else yields `None`.
pub fn parse_checksum_field(field: &[u8]) -> Option<u8> {
    if field.len() != CHECKSUM_LEN {
        return None;
    }
    let mut out = [0u8; 1];
    hex::decode_to_slice(field, &mut out).ok()?;
    Some(out[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_checksums() {
        assert_eq!(checksum_hex(b"@09sz1230"), "40");
        assert_eq!(checksum_hex(b"@08gl123"), "73");
        assert_eq!(checksum_hex(b"@13 0002.130 "), "5C");
    }

    #[test]
    fn test_zero_padded() {
        // 'A' ^ 'B' == 0x03
        assert_eq!(checksum_hex(b"AB"), "03");
        assert_eq!(checksum_hex(b""), "00");
    }

    #[test]
    fn test_deterministic() {
        let input = b"#05ag";
        assert_eq!(checksum_hex(input), checksum_hex(input));
    }

    #[test]
    fn test_single_bit_flip_changes_checksum() {
        let original = b"@08gl123".to_vec();
        let reference = checksum(&original);
        for i in 0..original.len() {
            for bit in 0..8 {
                let mut flipped = original.clone();
                flipped[i] ^= 1 << bit;
                assert_ne!(checksum(&flipped), reference, "byte {} bit {}", i, bit);
            }
        }
    }

    #[test]
    fn test_parse_checksum_field() {
        assert_eq!(parse_checksum_field(b"5C"), Some(0x5C));
        assert_eq!(parse_checksum_field(b"5c"), Some(0x5C));
        assert_eq!(parse_checksum_field(b"5"), None);
        assert_eq!(parse_checksum_field(b"ZZ"), None);
    }
}
