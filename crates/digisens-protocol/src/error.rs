//! Protocol error types.

use thiserror::Error;

/// Errors that can occur when encoding or decoding protocol frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Device id does not match the length its address mode requires.
    #[error("invalid {mode} address {id:?}: expected {expected} printable characters")]
    InvalidAddress {
        /// Address mode name.
        mode: &'static str,
        /// The rejected id.
        id: String,
        /// Required id length.
        expected: usize,
    },

    /// Frame would overflow the two-digit length field.
    #[error("frame too long: length field maximum {max}, got {actual}")]
    FrameTooLong {
        /// Maximum length field value.
        max: usize,
        /// Length the frame would need.
        actual: usize,
    },

    /// Frame is too short to hold the envelope.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// First byte is neither `@` nor `#`.
    #[error("unknown frame header byte 0x{0:02X}")]
    UnknownHeader(u8),

    /// Payload contains a byte outside printable ASCII.
    #[error("non-ASCII byte 0x{0:02X} in frame payload")]
    NonAscii(u8),

    /// Received checksum disagrees with the recomputed one (strict mode only).
    #[error("checksum mismatch: computed {expected}, received {actual}")]
    ChecksumMismatch {
        /// Checksum recomputed over the received bytes.
        expected: String,
        /// Checksum field as received.
        actual: String,
    },

    /// Channel does not fit the request field of the command.
    #[error("channel {channel} out of range for {verb} (max {max})")]
    InvalidChannel {
        /// Command verb.
        verb: &'static str,
        /// Requested channel.
        channel: u8,
        /// Highest channel the field can encode.
        max: u8,
    },

    /// Baud rate or baud code outside the supported table.
    #[error("unsupported baud rate: {0}")]
    InvalidBaudrate(u32),

    /// Reply envelope was fine but its content cannot be what was asked for.
    #[error("implausible reply: {0}")]
    ImplausibleReply(String),
}

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
