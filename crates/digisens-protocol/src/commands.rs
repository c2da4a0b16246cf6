//! Command catalog.
//!
//! Each [`Verb`] has a fixed request shape and reply layout, described by its
//! [`CommandSpec`]. A [`Command`] is a verb together with its arguments and
//! knows how to encode itself for a given device address.

use std::fmt;

use crate::address::{AddressMode, DeviceAddress};
use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::FrameCodec;

// ============================================================================
// Verbs and their layouts
// ============================================================================

/// Protocol verbs understood by the controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// `gl`: every channel in one reply.
    ReadAllWeights,
    /// `gw`: one channel.
    ReadOneWeight,
    /// `gd`: one channel with an extra digit of precision.
    ReadHighPrecision,
    /// `sz`: store the current load as the channel's zero reference.
    ZeroChannel,
    /// `ag`: broadcast address query. Only valid with a single device on the bus.
    ReadAddress,
    /// `gm`: model string.
    ReadModel,
    /// `gr`: firmware revision string.
    ReadRevision,
    /// `br<n>`: change the line rate.
    SetBaudrate,
}

/// Shape of the request data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    /// No data.
    Empty,
    /// Channel as a single digit.
    Channel1,
    /// Channel as two zero-padded digits.
    Channel2,
    /// Single-digit channel followed by a single-digit mode.
    ChannelAndMode,
    /// Baud code folded into the command as its third character.
    BaudCode,
}

impl RequestShape {
    /// Highest channel the data field can carry, for channel-addressed shapes.
    pub const fn max_channel(self) -> Option<u8> {
        match self {
            RequestShape::Channel1 | RequestShape::ChannelAndMode => Some(9),
            RequestShape::Channel2 => Some(99),
            RequestShape::Empty | RequestShape::BaudCode => None,
        }
    }
}

/// How many fixed-width blocks a reply body carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCount {
    /// Exactly one block.
    Single,
    /// `body_length / width` blocks; a trailing partial block is dropped.
    Derived,
}

/// Layout of a reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyLayout {
    /// Fixed-width weight blocks: sign, weight digits, status byte.
    Weights {
        /// Characters per block.
        width: usize,
        /// Digits in the weight field.
        weight_digits: usize,
        /// Block count policy.
        count: BlockCount,
    },
    /// Success is signalled by the verb being echoed somewhere in the body.
    Echo,
    /// Free-form text.
    Text,
}

/// Static description of one verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Two-character verb code.
    pub code: &'static str,
    /// Request data shape.
    pub request: RequestShape,
    /// Reply body layout.
    pub reply: ReplyLayout,
    /// Shortest reply body that can be valid for this verb.
    pub min_reply_len: usize,
    /// Broadcast verbs carry no address.
    pub broadcast: bool,
}

impl CommandSpec {
    /// Width of one weight block, for weight-reading verbs.
    pub const fn block_width(&self) -> Option<usize> {
        match self.reply {
            ReplyLayout::Weights { width, .. } => Some(width),
            ReplyLayout::Echo | ReplyLayout::Text => None,
        }
    }

    /// Digits in the weight field, for weight-reading verbs.
    pub const fn weight_digits(&self) -> Option<usize> {
        match self.reply {
            ReplyLayout::Weights { weight_digits, .. } => Some(weight_digits),
            ReplyLayout::Echo | ReplyLayout::Text => None,
        }
    }
}

const fn weights(width: usize, count: BlockCount) -> ReplyLayout {
    ReplyLayout::Weights {
        width,
        weight_digits: width - 2,
        count,
    }
}

impl Verb {
    /// All verbs, in catalog order.
    pub const ALL: [Verb; 8] = [
        Verb::ReadAllWeights,
        Verb::ReadOneWeight,
        Verb::ReadHighPrecision,
        Verb::ZeroChannel,
        Verb::ReadAddress,
        Verb::ReadModel,
        Verb::ReadRevision,
        Verb::SetBaudrate,
    ];

    /// Two-character verb code.
    pub const fn code(self) -> &'static str {
        self.spec().code
    }

    /// Catalog entry for this verb.
    pub const fn spec(self) -> CommandSpec {
        match self {
            Verb::ReadAllWeights => CommandSpec {
                code: CMD_READ_ALL_WEIGHTS,
                request: RequestShape::Empty,
                reply: weights(WEIGHT_BLOCK_WIDTH, BlockCount::Derived),
                min_reply_len: WEIGHT_BLOCK_WIDTH,
                broadcast: false,
            },
            Verb::ReadOneWeight => CommandSpec {
                code: CMD_READ_ONE_WEIGHT,
                request: RequestShape::Channel2,
                reply: weights(WEIGHT_BLOCK_WIDTH, BlockCount::Single),
                min_reply_len: WEIGHT_BLOCK_WIDTH,
                broadcast: false,
            },
            Verb::ReadHighPrecision => CommandSpec {
                code: CMD_READ_HIGH_PRECISION,
                request: RequestShape::ChannelAndMode,
                reply: weights(PRECISION_BLOCK_WIDTH, BlockCount::Single),
                min_reply_len: PRECISION_BLOCK_WIDTH,
                broadcast: false,
            },
            Verb::ZeroChannel => CommandSpec {
                code: CMD_ZERO_CHANNEL,
                request: RequestShape::Channel1,
                reply: ReplyLayout::Echo,
                min_reply_len: 2,
                broadcast: false,
            },
            Verb::ReadAddress => CommandSpec {
                code: CMD_READ_ADDRESS,
                request: RequestShape::Empty,
                reply: ReplyLayout::Text,
                min_reply_len: STANDARD_ID_LEN,
                broadcast: true,
            },
            Verb::ReadModel => CommandSpec {
                code: CMD_READ_MODEL,
                request: RequestShape::Empty,
                reply: ReplyLayout::Text,
                min_reply_len: 1,
                broadcast: false,
            },
            Verb::ReadRevision => CommandSpec {
                code: CMD_READ_REVISION,
                request: RequestShape::Empty,
                reply: ReplyLayout::Text,
                min_reply_len: 1,
                broadcast: false,
            },
            Verb::SetBaudrate => CommandSpec {
                code: CMD_SET_BAUDRATE,
                request: RequestShape::BaudCode,
                reply: ReplyLayout::Echo,
                min_reply_len: 2,
                broadcast: false,
            },
        }
    }

    /// Look a verb up by the first two characters of a command field.
    pub fn from_code(code: &str) -> Option<Verb> {
        Verb::ALL.into_iter().find(|v| v.code() == code)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// Argument types
// ============================================================================

/// What a `gd` request measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionMode {
    /// Calibrated weight.
    #[default]
    Weight,
    /// Raw sensor frequency.
    Frequency,
}

impl PrecisionMode {
    pub const fn digit(self) -> char {
        match self {
            PrecisionMode::Weight => '0',
            PrecisionMode::Frequency => '1',
        }
    }

    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(PrecisionMode::Weight),
            '1' => Some(PrecisionMode::Frequency),
            _ => None,
        }
    }
}

/// Supported line rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Baudrate {
    #[default]
    B9600 = 0,
    B19200 = 1,
    B38400 = 2,
    B57600 = 3,
    B115200 = 4,
}

impl Baudrate {
    /// Every supported rate, in code order.
    pub const ALL: [Baudrate; 5] = [
        Baudrate::B9600,
        Baudrate::B19200,
        Baudrate::B38400,
        Baudrate::B57600,
        Baudrate::B115200,
    ];

    /// Code sent in the `br` command (0..=4).
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Line rate in bits per second.
    pub fn bps(self) -> u32 {
        BAUD_RATES[self.code() as usize]
    }

    /// Rate for a `br` code.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or(ProtocolError::InvalidBaudrate(code as u32))
    }
}

impl TryFrom<u32> for Baudrate {
    type Error = ProtocolError;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        BAUD_RATES
            .iter()
            .position(|&b| b == bps)
            .map(|i| Self::ALL[i])
            .ok_or(ProtocolError::InvalidBaudrate(bps))
    }
}

impl fmt::Display for Baudrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bps())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A request to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Read every channel (`gl`).
    ReadAllWeights,
    /// Read one channel (`gw`).
    ReadOneWeight {
        /// Channel index, 0..=99.
        channel: u8,
    },
    /// Read one channel with high precision (`gd`).
    ReadHighPrecision {
        /// Channel index, 0..=9.
        channel: u8,
        /// Weight or frequency.
        mode: PrecisionMode,
    },
    /// Store the zero reference of a channel (`sz`).
    ///
    /// This writes the device's EEPROM, which has a finite number of write
    /// cycles. Only issue it on an unloaded sensor and rate-limit it.
    ZeroChannel {
        /// Channel index, 0..=9.
        channel: u8,
    },
    /// Broadcast address query (`ag`).
    ///
    /// Every device on the bus answers at once. Never issue this when more
    /// than one device shares the bus.
    ReadAddress,
    /// Model string (`gm`).
    ReadModel,
    /// Firmware revision (`gr`).
    ReadRevision,
    /// Switch the device to a new line rate (`br<n>`).
    ///
    /// The device answers at the old rate and listens at the new one from then
    /// on; the transport must be reopened before the next exchange.
    SetBaudrate(Baudrate),
}

impl Command {
    /// The command's verb.
    pub fn verb(&self) -> Verb {
        match self {
            Command::ReadAllWeights => Verb::ReadAllWeights,
            Command::ReadOneWeight { .. } => Verb::ReadOneWeight,
            Command::ReadHighPrecision { .. } => Verb::ReadHighPrecision,
            Command::ZeroChannel { .. } => Verb::ZeroChannel,
            Command::ReadAddress => Verb::ReadAddress,
            Command::ReadModel => Verb::ReadModel,
            Command::ReadRevision => Verb::ReadRevision,
            Command::SetBaudrate(_) => Verb::SetBaudrate,
        }
    }

    /// Whether the command is a broadcast (sent without a device id).
    pub fn is_broadcast(&self) -> bool {
        self.verb().spec().broadcast
    }

    /// Channel argument, for the commands that address one channel.
    pub fn channel(&self) -> Option<u8> {
        match *self {
            Command::ReadOneWeight { channel }
            | Command::ReadHighPrecision { channel, .. }
            | Command::ZeroChannel { channel } => Some(channel),
            _ => None,
        }
    }

    /// Command field as sent: the verb code, plus the baud digit for `br`.
    pub fn command_field(&self) -> String {
        let spec = self.verb().spec();
        match (spec.request, self) {
            (RequestShape::BaudCode, Command::SetBaudrate(rate)) => {
                format!("{}{}", spec.code, rate.code())
            }
            _ => spec.code.to_string(),
        }
    }

    /// Request data field, laid out as the verb's [`RequestShape`] says.
    pub fn data_field(&self) -> ProtocolResult<String> {
        let spec = self.verb().spec();
        let channel = match spec.request.max_channel() {
            Some(max) => {
                let channel = self.channel().unwrap_or_default();
                check_channel(spec.code, channel, max)?;
                channel
            }
            None => 0,
        };
        Ok(match spec.request {
            RequestShape::Empty | RequestShape::BaudCode => String::new(),
            RequestShape::Channel1 => channel.to_string(),
            RequestShape::Channel2 => format!("{:02}", channel),
            RequestShape::ChannelAndMode => {
                let mode = match *self {
                    Command::ReadHighPrecision { mode, .. } => mode,
                    _ => PrecisionMode::default(),
                };
                format!("{}{}", channel, mode.digit())
            }
        })
    }

    /// Encode for a specific device.
    ///
    /// Broadcast commands only take the address mode from `address`.
    pub fn encode(&self, address: &DeviceAddress) -> ProtocolResult<Vec<u8>> {
        if self.is_broadcast() {
            return self.encode_broadcast(address.mode());
        }
        FrameCodec::encode(
            address.mode(),
            address.id(),
            &self.command_field(),
            &self.data_field()?,
        )
    }

    /// Encode without a device id.
    pub fn encode_broadcast(&self, mode: AddressMode) -> ProtocolResult<Vec<u8>> {
        FrameCodec::encode(mode, "", &self.command_field(), &self.data_field()?)
    }
}

fn check_channel(verb: &'static str, channel: u8, max: u8) -> ProtocolResult<()> {
    if channel > max {
        return Err(ProtocolError::InvalidChannel { verb, channel, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn std_addr() -> DeviceAddress {
        DeviceAddress::standard("123").unwrap()
    }

    #[test]
    fn test_zero_channel_matches_reference() {
        let frame = Command::ZeroChannel { channel: 0 }.encode(&std_addr()).unwrap();
        assert_eq!(frame, b"@09sz123040\r");
    }

    #[test]
    fn test_read_all() {
        let frame = Command::ReadAllWeights.encode(&std_addr()).unwrap();
        assert_eq!(frame, b"@08gl12373\r");
    }

    #[test]
    fn test_read_one_uses_two_digit_channel() {
        assert_eq!(Command::ReadOneWeight { channel: 3 }.data_field().unwrap(), "03");
        let frame = Command::ReadOneWeight { channel: 3 }.encode(&std_addr()).unwrap();
        assert!(frame.starts_with(b"@10gw12303"));
    }

    #[test]
    fn test_high_precision_data() {
        let cmd = Command::ReadHighPrecision {
            channel: 5,
            mode: PrecisionMode::Frequency,
        };
        assert_eq!(cmd.data_field().unwrap(), "51");
        let cmd = Command::ReadHighPrecision {
            channel: 10,
            mode: PrecisionMode::Weight,
        };
        assert!(matches!(
            cmd.data_field(),
            Err(ProtocolError::InvalidChannel { channel: 10, max: 9, .. })
        ));
    }

    #[test]
    fn test_broadcast_has_no_address() {
        let extended = DeviceAddress::extended("0123456789ABCDEF").unwrap();
        let frame = Command::ReadAddress.encode(&extended).unwrap();
        assert_eq!(frame, b"#05ag20\r");
        assert!(Command::ReadAddress.is_broadcast());
        assert!(!Command::ReadModel.is_broadcast());
    }

    #[test]
    fn test_set_baudrate_field() {
        let cmd = Command::SetBaudrate(Baudrate::B57600);
        assert_eq!(cmd.command_field(), "br3");
        let frame = cmd.encode(&std_addr()).unwrap();
        assert!(frame.starts_with(b"@09br3123"));
    }

    #[test]
    fn test_data_fields_follow_request_shape() {
        assert_eq!(Verb::ZeroChannel.spec().request, RequestShape::Channel1);
        assert_eq!(Command::ZeroChannel { channel: 7 }.data_field().unwrap(), "7");
        assert!(matches!(
            Command::ZeroChannel { channel: 12 }.data_field(),
            Err(ProtocolError::InvalidChannel { verb: "sz", max: 9, .. })
        ));
        assert_eq!(Command::ReadOneWeight { channel: 42 }.data_field().unwrap(), "42");
        assert_eq!(Command::ReadModel.data_field().unwrap(), "");
        assert_eq!(Command::SetBaudrate(Baudrate::B19200).data_field().unwrap(), "");
        assert_eq!(Command::ReadModel.channel(), None);
    }

    #[test]
    fn test_baudrate_table() {
        assert_eq!(Baudrate::B9600.code(), 0);
        assert_eq!(Baudrate::B115200.code(), 4);
        for (i, baud) in Baudrate::ALL.iter().enumerate() {
            assert_eq!(baud.code() as usize, i);
            assert_eq!(baud.bps(), BAUD_RATES[i]);
        }
        assert_eq!(Baudrate::B38400.bps(), 38400);
        assert_eq!(Baudrate::try_from(19200).unwrap(), Baudrate::B19200);
        assert!(Baudrate::try_from(4800).is_err());
        assert_eq!(Baudrate::from_code(3).unwrap(), Baudrate::B57600);
        assert!(Baudrate::from_code(5).is_err());
    }

    #[test]
    fn test_catalog_layouts() {
        assert_eq!(
            Verb::ReadAllWeights.spec().reply,
            ReplyLayout::Weights {
                width: 10,
                weight_digits: 8,
                count: BlockCount::Derived
            }
        );
        assert_eq!(
            Verb::ReadHighPrecision.spec().reply,
            ReplyLayout::Weights {
                width: 11,
                weight_digits: 9,
                count: BlockCount::Single
            }
        );
        assert_eq!(Verb::ReadOneWeight.spec().weight_digits(), Some(8));
        assert_eq!(Verb::ReadModel.spec().block_width(), None);
        assert_eq!(Verb::from_code("gw"), Some(Verb::ReadOneWeight));
        assert_eq!(Verb::from_code("zz"), None);
    }
}
