//! Reply body parsing.
//!
//! Weight replies are runs of fixed-width blocks:
//!
//! ```text
//! +------+----------------------+--------+
//! | sign | weight (8 or 9 chars)| status |
//! +------+----------------------+--------+
//! ```
//!
//! A malformed block never aborts parsing. It turns into an invalid
//! placeholder reading and the remaining blocks are still parsed.

use std::fmt;

use crate::address::{AddressMode, DeviceAddress};
use crate::commands::{BlockCount, CommandSpec, ReplyLayout, Verb};
use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};

// ============================================================================
// Status
// ============================================================================

/// Status byte attached to every weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFlag {
    /// Stable measurement.
    Ok,
    /// Load is moving; the value is not reliable.
    Motion,
    /// No load cell on this channel.
    NotConnected,
    /// Calibration data could not be read.
    EepromError,
    /// Any byte the status table does not define.
    Unknown,
}

impl StatusFlag {
    /// Map a status byte. Unlisted bytes are [`StatusFlag::Unknown`].
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            STATUS_OK => StatusFlag::Ok,
            STATUS_MOTION => StatusFlag::Motion,
            STATUS_NOT_CONNECTED => StatusFlag::NotConnected,
            STATUS_EEPROM_ERROR => StatusFlag::EepromError,
            _ => StatusFlag::Unknown,
        }
    }

    /// Byte a device sends for this status.
    pub fn as_byte(self) -> u8 {
        match self {
            StatusFlag::Ok => STATUS_OK,
            StatusFlag::Motion => STATUS_MOTION,
            StatusFlag::NotConnected => STATUS_NOT_CONNECTED,
            StatusFlag::EepromError => STATUS_EEPROM_ERROR,
            StatusFlag::Unknown => STATUS_UNKNOWN,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusFlag::Ok
    }
}

impl fmt::Display for StatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusFlag::Ok => "OK",
            StatusFlag::Motion => "MOTION",
            StatusFlag::NotConnected => "NOT CONNECTED",
            StatusFlag::EepromError => "EEPROM ERROR",
            StatusFlag::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Why a placeholder reading carries no measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingFault {
    /// Weight field was not a number, or the block was cut short.
    FieldParse,
    /// The device did not finish its reply in time.
    Timeout,
    /// The reply was shorter than the command's layout.
    ShortResponse,
    /// Strict mode rejected the reply checksum.
    ChecksumMismatch,
    /// The transport is gone.
    ConnectionFailure,
    /// The reply could not be decoded at all.
    Malformed,
}

impl fmt::Display for ReadingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadingFault::FieldParse => "field parse failure",
            ReadingFault::Timeout => "timeout",
            ReadingFault::ShortResponse => "short response",
            ReadingFault::ChecksumMismatch => "checksum mismatch",
            ReadingFault::ConnectionFailure => "connection failure",
            ReadingFault::Malformed => "malformed reply",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Readings
// ============================================================================

/// One channel's measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightReading {
    /// Channel index on the device, 0-based.
    pub channel: usize,
    /// Weight in kg (or frequency for `gd` frequency mode).
    pub weight: f64,
    /// Status reported by the device.
    pub status: StatusFlag,
    /// Block text as received.
    pub raw_text: String,
    /// Set on placeholders that stand in for a missing or unparsable value.
    pub fault: Option<ReadingFault>,
}

impl WeightReading {
    /// A reading is valid iff the device reported [`StatusFlag::Ok`].
    pub fn is_valid(&self) -> bool {
        self.status.is_ok()
    }

    /// Placeholder for a channel that has no usable measurement.
    pub fn invalid(channel: usize, fault: ReadingFault) -> Self {
        WeightReading {
            channel,
            weight: 0.0,
            status: StatusFlag::Unknown,
            raw_text: String::new(),
            fault: Some(fault),
        }
    }

    /// `count` placeholders, channels `0..count`.
    pub fn invalid_set(count: usize, fault: ReadingFault) -> Vec<Self> {
        (0..count).map(|ch| Self::invalid(ch, fault)).collect()
    }
}

impl fmt::Display for WeightReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fault {
            Some(fault) => write!(f, "ch{}: --- [{}]", self.channel, fault),
            None => write!(f, "ch{}: {:.3} kg [{}]", self.channel, self.weight, self.status),
        }
    }
}

/// Parse one fixed-width weight block.
///
/// The first character is the sign (`-` negates, anything else does not), the
/// last is the status byte, and everything between is the weight field.
pub fn parse_block(block: &str, channel: usize) -> WeightReading {
    let bytes = block.as_bytes();
    if bytes.len() < 3 || !block.is_ascii() {
        log::trace!("block {:?} for channel {} is not a weight block", block, channel);
        return field_failure(block, channel);
    }

    let sign = bytes[0];
    let status = StatusFlag::from_byte(bytes[bytes.len() - 1]);
    let field = &block[1..block.len() - 1];

    let weight = match parse_weight_field(field) {
        Some(w) => w,
        None => {
            log::trace!("unparsable weight field {:?} on channel {}", field, channel);
            return field_failure(block, channel);
        }
    };

    WeightReading {
        channel,
        weight: if sign == b'-' { -weight } else { weight },
        status,
        raw_text: block.to_string(),
        fault: None,
    }
}

fn field_failure(block: &str, channel: usize) -> WeightReading {
    WeightReading {
        raw_text: block.to_string(),
        ..WeightReading::invalid(channel, ReadingFault::FieldParse)
    }
}

/// Digits with at most one decimal point, padded with spaces.
fn parse_weight_field(field: &str) -> Option<f64> {
    let field = field.trim();
    let well_formed = !field.is_empty()
        && field.bytes().all(|b| b.is_ascii_digit() || b == b'.')
        && field.bytes().filter(|&b| b == b'.').count() <= 1
        && field.bytes().any(|b| b.is_ascii_digit());
    if !well_formed {
        return None;
    }
    field.parse().ok()
}

/// Result of parsing a multi-block body.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkParse {
    /// One reading per complete block, in channel order.
    pub readings: Vec<WeightReading>,
    /// Characters left over after the last complete block.
    pub trailing: usize,
}

impl BulkParse {
    pub fn is_truncated(&self) -> bool {
        self.trailing > 0
    }
}

/// Parse a body of consecutive `width`-character blocks.
///
/// Channel `n` is the block starting at `n * width`. A final incomplete block
/// is dropped and reported through [`BulkParse::trailing`].
pub fn parse_bulk(body: &str, width: usize) -> BulkParse {
    if width == 0 {
        return BulkParse {
            readings: Vec::new(),
            trailing: body.len(),
        };
    }

    let readings: Vec<WeightReading> = body
        .as_bytes()
        .chunks_exact(width)
        .enumerate()
        .map(|(channel, chunk)| parse_block(&String::from_utf8_lossy(chunk), channel))
        .collect();
    let trailing = body.len() % width;

    if trailing > 0 {
        log::debug!(
            "dropping {} trailing character(s) after {} complete block(s)",
            trailing,
            readings.len()
        );
    }

    BulkParse { readings, trailing }
}

/// Parse a single-block reply for `channel`.
pub fn parse_single(body: &str, width: usize, channel: usize) -> WeightReading {
    match body.get(..width) {
        Some(block) => parse_block(block, channel),
        None => field_failure(body, channel),
    }
}

/// Parse a weight reply as the verb's catalog entry lays it out.
///
/// Blocks are numbered from `first_channel`. A single-block verb keeps its
/// first block and reports anything after it as trailing; a derived-count
/// verb reads every complete block. Verbs without a weight layout are
/// rejected as [`ProtocolError::ImplausibleReply`].
pub fn parse_weights(
    body: &str,
    spec: &CommandSpec,
    first_channel: usize,
) -> ProtocolResult<BulkParse> {
    let (width, count) = match spec.reply {
        ReplyLayout::Weights { width, count, .. } => (width, count),
        ReplyLayout::Echo | ReplyLayout::Text => {
            return Err(ProtocolError::ImplausibleReply(format!(
                "{} replies carry no weight blocks",
                spec.code
            )))
        }
    };

    match count {
        BlockCount::Single => {
            let reading = parse_single(body, width, first_channel);
            let trailing = body.len().saturating_sub(width);
            if trailing > 0 {
                log::debug!(
                    "{} reply carries {} character(s) after its block",
                    spec.code,
                    trailing
                );
            }
            Ok(BulkParse {
                readings: vec![reading],
                trailing,
            })
        }
        BlockCount::Derived => {
            let mut parsed = parse_bulk(body, width);
            for reading in &mut parsed.readings {
                reading.channel += first_channel;
            }
            Ok(parsed)
        }
    }
}

// ============================================================================
// Non-weight replies
// ============================================================================

/// Whether a reply body acknowledges `verb` by echoing its code.
pub fn is_acknowledged(body: &str, verb: Verb) -> bool {
    body.to_ascii_lowercase().contains(verb.code())
}

/// Interpret an `ag` reply body as the address of the single device present.
///
/// A body that is not an id of the expected length usually means several
/// devices answered at once.
pub fn parse_address_reply(body: &str, mode: AddressMode) -> ProtocolResult<DeviceAddress> {
    let id = body.trim();
    if id.len() != mode.id_len() {
        return Err(ProtocolError::ImplausibleReply(format!(
            "address reply {:?} is not a {} id",
            body, mode
        )));
    }
    DeviceAddress::new(mode, id)
        .map_err(|_| ProtocolError::ImplausibleReply(format!("address reply {:?}", body)))
}

/// Render a weight block the way a device sends it.
///
/// `digits` is the width of the weight field (8 for `gl`/`gw`, 9 for `gd`).
pub fn format_block(weight: f64, status: StatusFlag, digits: usize) -> String {
    let sign = if weight < 0.0 { '-' } else { ' ' };
    let decimals = digits.saturating_sub(5);
    format!(
        "{}{:0width$.prec$}{}",
        sign,
        weight.abs(),
        status.as_byte() as char,
        width = digits,
        prec = decimals
    )
}

/// Model and firmware revision strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub revision: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok_block() {
        let reading = parse_block(" 0002.130 ", 0);
        assert!((reading.weight - 2.130).abs() < 1e-9);
        assert_eq!(reading.status, StatusFlag::Ok);
        assert!(reading.is_valid());
        assert_eq!(reading.raw_text, " 0002.130 ");
    }

    #[test]
    fn test_parse_negative_motion_block() {
        let reading = parse_block("-0001.250M", 4);
        assert!((reading.weight + 1.250).abs() < 1e-9);
        assert_eq!(reading.status, StatusFlag::Motion);
        assert_eq!(reading.channel, 4);
        assert!(!reading.is_valid());
        assert_eq!(reading.fault, None);
    }

    #[test]
    fn test_status_table() {
        assert_eq!(StatusFlag::from_byte(b' '), StatusFlag::Ok);
        assert_eq!(StatusFlag::from_byte(b'M'), StatusFlag::Motion);
        assert_eq!(StatusFlag::from_byte(b'C'), StatusFlag::NotConnected);
        assert_eq!(StatusFlag::from_byte(b'E'), StatusFlag::EepromError);
        assert_eq!(StatusFlag::from_byte(b'X'), StatusFlag::Unknown);
    }

    #[test]
    fn test_unknown_status_is_invalid_not_fatal() {
        let reading = parse_block(" 0010.000Z", 1);
        assert!((reading.weight - 10.0).abs() < 1e-9);
        assert_eq!(reading.status, StatusFlag::Unknown);
        assert!(!reading.is_valid());
    }

    #[test]
    fn test_unparsable_weight_becomes_placeholder() {
        for block in [" 00x2.130 ", "          ", " 1.2.3.4. ", " inf      "] {
            let reading = parse_block(block, 2);
            assert_eq!(reading.weight, 0.0);
            assert_eq!(reading.fault, Some(ReadingFault::FieldParse));
            assert!(!reading.is_valid());
            assert_eq!(reading.raw_text, block);
        }
    }

    #[test]
    fn test_high_precision_block() {
        let reading = parse_block(" 0002.1305 ", 3);
        assert!((reading.weight - 2.1305).abs() < 1e-9);
        assert!(reading.is_valid());
    }

    #[test]
    fn test_parse_bulk_eight_blocks() {
        let body: String = (0..8)
            .map(|i| format_block(i as f64 * 0.5, StatusFlag::Ok, 8))
            .collect();
        let parsed = parse_bulk(&body, WEIGHT_BLOCK_WIDTH);
        assert_eq!(parsed.readings.len(), 8);
        assert!(!parsed.is_truncated());
        for (i, reading) in parsed.readings.iter().enumerate() {
            assert_eq!(reading.channel, i);
            assert!((reading.weight - i as f64 * 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn test_parse_bulk_drops_partial_tail() {
        let mut body: String = (0..7)
            .map(|_| format_block(1.0, StatusFlag::Ok, 8))
            .collect();
        body.push_str(" 0001");
        let parsed = parse_bulk(&body, WEIGHT_BLOCK_WIDTH);
        assert_eq!(parsed.readings.len(), 7);
        assert_eq!(parsed.trailing, 5);
        assert!(parsed.is_truncated());
    }

    #[test]
    fn test_parse_bulk_keeps_going_past_bad_block() {
        let body = format!(
            "{}{}{}",
            format_block(1.0, StatusFlag::Ok, 8),
            " garbage! ",
            format_block(3.0, StatusFlag::NotConnected, 8)
        );
        let parsed = parse_bulk(&body, WEIGHT_BLOCK_WIDTH);
        assert_eq!(parsed.readings.len(), 3);
        assert!(parsed.readings[0].is_valid());
        assert_eq!(parsed.readings[1].fault, Some(ReadingFault::FieldParse));
        assert_eq!(parsed.readings[2].status, StatusFlag::NotConnected);
    }

    #[test]
    fn test_parse_single_short_body() {
        let reading = parse_single(" 0002.1", WEIGHT_BLOCK_WIDTH, 0);
        assert_eq!(reading.fault, Some(ReadingFault::FieldParse));
    }

    #[test]
    fn test_parse_weights_single_block_verb_keeps_first_block() {
        let body = format!(
            "{}{}",
            format_block(1.0, StatusFlag::Ok, 8),
            format_block(2.0, StatusFlag::Ok, 8)
        );
        let parsed = parse_weights(&body, &Verb::ReadOneWeight.spec(), 5).unwrap();
        assert_eq!(parsed.readings.len(), 1);
        assert_eq!(parsed.readings[0].channel, 5);
        assert!((parsed.readings[0].weight - 1.0).abs() < 1e-9);
        assert_eq!(parsed.trailing, WEIGHT_BLOCK_WIDTH);
    }

    #[test]
    fn test_parse_weights_uses_catalog_width() {
        let body = format_block(2.1305, StatusFlag::Ok, 9);
        let parsed = parse_weights(&body, &Verb::ReadHighPrecision.spec(), 3).unwrap();
        assert!((parsed.readings[0].weight - 2.1305).abs() < 1e-9);
        assert_eq!(parsed.trailing, 0);

        let bulk: String = (0..3).map(|i| format_block(i as f64, StatusFlag::Ok, 8)).collect();
        let parsed = parse_weights(&bulk, &Verb::ReadAllWeights.spec(), 0).unwrap();
        assert_eq!(parsed.readings.len(), 3);
        assert_eq!(parsed.readings[2].channel, 2);
    }

    #[test]
    fn test_parse_weights_rejects_text_verbs() {
        let err = parse_weights("H1103", &Verb::ReadModel.spec(), 0).unwrap_err();
        assert!(matches!(err, ProtocolError::ImplausibleReply(_)));
    }

    #[test]
    fn test_format_block_widths() {
        assert_eq!(format_block(2.13, StatusFlag::Ok, 8), " 0002.130 ");
        assert_eq!(format_block(-1.25, StatusFlag::Motion, 8), "-0001.250M");
        assert_eq!(format_block(2.1305, StatusFlag::Ok, 9), " 0002.1305 ");
    }

    #[test]
    fn test_acknowledgement() {
        assert!(is_acknowledged("sz123", Verb::ZeroChannel));
        assert!(is_acknowledged("BR2", Verb::SetBaudrate));
        assert!(!is_acknowledged("ERR", Verb::ZeroChannel));
    }

    #[test]
    fn test_address_reply() {
        let addr = parse_address_reply("042", AddressMode::Standard).unwrap();
        assert_eq!(addr.id(), "042");
        assert!(parse_address_reply("0420", AddressMode::Standard).is_err());
        assert!(parse_address_reply("042", AddressMode::Extended).is_err());
    }
}
