//! Protocol constants.

// ============================================================================
// Framing
// ============================================================================

/// Header byte for the standard (3-character) address space.
pub const HEADER_STANDARD: u8 = b'@';

/// Header byte for the extended (16-character) address space.
pub const HEADER_EXTENDED: u8 = b'#';

/// Frame terminator. No line feed follows it.
pub const TERMINATOR: u8 = b'\r';

/// Header byte plus the two-digit length field.
pub const PREFIX_LEN: usize = 3;

/// Width of the rendered checksum.
pub const CHECKSUM_LEN: usize = 2;

/// Largest value the two-digit length field can carry.
pub const MAX_LENGTH_FIELD: usize = 99;

/// Largest command + address + data run that still fits the length field.
pub const MAX_PAYLOAD_LEN: usize = MAX_LENGTH_FIELD - PREFIX_LEN;

// ============================================================================
// Addressing
// ============================================================================

/// Length of a standard device id.
pub const STANDARD_ID_LEN: usize = 3;

/// Length of an extended device id.
pub const EXTENDED_ID_LEN: usize = 16;

// ============================================================================
// Command verbs
// ============================================================================

pub const CMD_READ_ALL_WEIGHTS: &str = "gl";
pub const CMD_READ_ONE_WEIGHT: &str = "gw";
pub const CMD_READ_HIGH_PRECISION: &str = "gd";
pub const CMD_ZERO_CHANNEL: &str = "sz";
pub const CMD_READ_ADDRESS: &str = "ag";
pub const CMD_READ_MODEL: &str = "gm";
pub const CMD_READ_REVISION: &str = "gr";
pub const CMD_SET_BAUDRATE: &str = "br";

// ============================================================================
// Reply layouts
// ============================================================================

/// sign(1) + weight(8) + status(1), used by `gl` and `gw`.
pub const WEIGHT_BLOCK_WIDTH: usize = 10;

/// sign(1) + weight(9) + status(1), used by `gd`.
pub const PRECISION_BLOCK_WIDTH: usize = 11;

// ============================================================================
// Status bytes
// ============================================================================

pub const STATUS_OK: u8 = b' ';
pub const STATUS_MOTION: u8 = b'M';
pub const STATUS_NOT_CONNECTED: u8 = b'C';
pub const STATUS_EEPROM_ERROR: u8 = b'E';

/// Byte rendered for statuses the device table does not define.
pub const STATUS_UNKNOWN: u8 = b'?';

// ============================================================================
// Baud rates
// ============================================================================

/// Supported line rates, indexed by their `br` code.
pub const BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Factory default line rate.
pub const DEFAULT_BAUD_RATE: u32 = 9600;
