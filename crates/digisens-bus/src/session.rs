//! Request/response exchanges with one addressed device.

use std::time::Duration;

use digisens_metrics::{metric_defs, BusLabels};
use digisens_protocol::{
    is_acknowledged, parse_address_reply, parse_weights, AddressMode, Baudrate, BulkParse,
    Command, DecodedFrame, DeviceAddress, DeviceInfo, FrameCodec, PrecisionMode, ProtocolError,
    ReadingFault, Verb, WeightReading,
};
use tracing::{debug, info, trace, warn};

use crate::bus::Bus;
use crate::error::{SessionError, SessionResult};
use crate::transport::Transport;

/// Default per-exchange deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-device exchange settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for the reply terminator.
    pub timeout: Duration,
    /// Reject replies whose checksum does not verify.
    pub strict_checksum: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timeout: DEFAULT_TIMEOUT,
            strict_checksum: false,
        }
    }
}

/// Conversation with one device.
///
/// A session holds no connection of its own. Each call borrows the [`Bus`]
/// the device sits on, so the bus decides when the exchange may start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    address: DeviceAddress,
    config: SessionConfig,
}

impl DeviceSession {
    pub fn new(address: DeviceAddress, config: SessionConfig) -> Self {
        DeviceSession { address, config }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Send `command` and return the decoded reply frame.
    ///
    /// Fails with `Timeout` when no terminator arrives in time, `ShortResponse`
    /// when the body is too short for the verb, and `ChecksumMismatch` in
    /// strict mode.
    pub fn exchange<T: Transport>(
        &self,
        bus: &mut Bus<T>,
        command: &Command,
    ) -> SessionResult<DecodedFrame> {
        let request = command.encode(&self.address)?;
        run_exchange(bus, &self.address.to_string(), command.verb(), &request, &self.config)
    }

    /// Every channel in one `gl` exchange.
    pub fn read_all_weights<T: Transport>(&self, bus: &mut Bus<T>) -> SessionResult<BulkParse> {
        self.read_weights(bus, &Command::ReadAllWeights, 0)
    }

    /// One channel via `gw`.
    pub fn read_weight<T: Transport>(
        &self,
        bus: &mut Bus<T>,
        channel: u8,
    ) -> SessionResult<WeightReading> {
        let parsed = self.read_weights(bus, &Command::ReadOneWeight { channel }, channel as usize)?;
        Ok(first_reading(parsed, channel as usize))
    }

    /// One channel via `gd`, with the extra digit.
    pub fn read_high_precision<T: Transport>(
        &self,
        bus: &mut Bus<T>,
        channel: u8,
        mode: PrecisionMode,
    ) -> SessionResult<WeightReading> {
        let command = Command::ReadHighPrecision { channel, mode };
        let parsed = self.read_weights(bus, &command, channel as usize)?;
        Ok(first_reading(parsed, channel as usize))
    }

    /// Exchange a weight-reading command and parse the reply with the layout
    /// its verb has in the catalog.
    fn read_weights<T: Transport>(
        &self,
        bus: &mut Bus<T>,
        command: &Command,
        first_channel: usize,
    ) -> SessionResult<BulkParse> {
        let frame = self.exchange(bus, command)?;
        let verb = command.verb();
        let parsed = parse_weights(frame.body(), &verb.spec(), first_channel)?;

        let tags = BusLabels::new(bus.name(), self.address.to_string()).with_verb(verb.code());
        if parsed.is_truncated() {
            debug!(
                "{} {}: {} reply ends in {} stray character(s)",
                bus.name(),
                self.address,
                verb,
                parsed.trailing
            );
            metrics::counter!(metric_defs::BULK_TRUNCATED.name, tags.as_slice()).increment(1);
        }
        count_invalid(&tags, &parsed.readings);
        Ok(parsed)
    }

    /// Store the current load of `channel` as its zero reference.
    ///
    /// Each call costs one EEPROM write cycle on the device. Only call it
    /// for an unloaded sensor, and not in a loop.
    pub fn zero_channel<T: Transport>(&self, bus: &mut Bus<T>, channel: u8) -> SessionResult<()> {
        let frame = self.exchange(bus, &Command::ZeroChannel { channel })?;
        expect_ack(&frame, Verb::ZeroChannel)?;
        info!("{} {}: channel {} zeroed", bus.name(), self.address, channel);
        Ok(())
    }

    pub fn read_model<T: Transport>(&self, bus: &mut Bus<T>) -> SessionResult<String> {
        let frame = self.exchange(bus, &Command::ReadModel)?;
        Ok(frame.body().trim().to_string())
    }

    pub fn read_revision<T: Transport>(&self, bus: &mut Bus<T>) -> SessionResult<String> {
        let frame = self.exchange(bus, &Command::ReadRevision)?;
        Ok(frame.body().trim().to_string())
    }

    /// Model and revision in two exchanges.
    pub fn read_info<T: Transport>(&self, bus: &mut Bus<T>) -> SessionResult<DeviceInfo> {
        Ok(DeviceInfo {
            model: self.read_model(bus)?,
            revision: self.read_revision(bus)?,
        })
    }

    /// Switch the device to `baud`.
    ///
    /// The acknowledgement still arrives at the old rate. Afterwards the bus
    /// refuses exchanges until the caller runs [`Bus::apply_baudrate`] or
    /// [`Bus::reopen`].
    pub fn set_baudrate<T: Transport>(&self, bus: &mut Bus<T>, baud: Baudrate) -> SessionResult<()> {
        let frame = self.exchange(bus, &Command::SetBaudrate(baud))?;
        expect_ack(&frame, Verb::SetBaudrate)?;
        bus.baudrate_changed(baud);
        Ok(())
    }
}

/// Ask the only device on the bus for its address with the `ag` broadcast.
///
/// With more than one device on the bus every device answers at once. The
/// garbled reply is usually rejected as implausible, but nothing guarantees
/// it, so never call this on a shared bus.
pub fn discover_address<T: Transport>(
    bus: &mut Bus<T>,
    mode: AddressMode,
    config: &SessionConfig,
) -> SessionResult<DeviceAddress> {
    let request = Command::ReadAddress.encode_broadcast(mode)?;
    let frame = run_exchange(bus, "broadcast", Verb::ReadAddress, &request, config)?;
    let address = parse_address_reply(frame.body(), mode)?;
    info!("{}: found device {}", bus.name(), address);
    Ok(address)
}

/// Find the line rate of the only device on the bus.
///
/// Sends `ag` at every supported rate, slowest first, and stops at the first
/// plausible address. The line is left at the rate that answered. A rate that
/// stays silent or answers with garbage moves the scan on; a connection
/// failure ends it.
pub fn detect_baudrate<T: Transport>(
    bus: &mut Bus<T>,
    mode: AddressMode,
    config: &SessionConfig,
) -> SessionResult<(Baudrate, DeviceAddress)> {
    let mut last_error = None;
    for baud in Baudrate::ALL {
        bus.set_line_rate(baud)?;
        match discover_address(bus, mode, config) {
            Ok(address) => {
                info!("{}: {} answers at {} baud", bus.name(), address, baud);
                return Ok((baud, address));
            }
            Err(e) if e.halts_bus() => return Err(e),
            Err(e) => {
                debug!("{}: nothing usable at {} baud: {}", bus.name(), baud, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(SessionError::Timeout {
        verb: Verb::ReadAddress,
        timeout: config.timeout,
        received: 0,
    }))
}

fn run_exchange<T: Transport>(
    bus: &mut Bus<T>,
    device: &str,
    verb: Verb,
    request: &[u8],
    config: &SessionConfig,
) -> SessionResult<DecodedFrame> {
    let labels = BusLabels::new(bus.name(), device);
    let tags = labels.with_verb(verb.code());
    metrics::counter!(metric_defs::EXCHANGE_TOTAL.name, tags.as_slice()).increment(1);
    trace!("{} {}: sending {}", bus.name(), device, verb);

    let result = bus
        .exchange(verb, request, config.timeout)
        .and_then(|reply| {
            metrics::histogram!(metric_defs::EXCHANGE_LATENCY.name, tags.as_slice())
                .record(reply.latency.as_secs_f64());
            decode_reply(verb, &reply.bytes, config.strict_checksum)
        });

    if let Err(e) = &result {
        let failure = labels.with(&[("verb", verb.code().to_string()), ("kind", e.kind().to_string())]);
        metrics::counter!(metric_defs::EXCHANGE_FAILURES.name, failure.as_slice()).increment(1);
        match e {
            SessionError::Timeout { .. } | SessionError::ShortResponse { .. } => {
                warn!("{} {}: {}", bus.name(), device, e)
            }
            _ => debug!("{} {}: {}", bus.name(), device, e),
        }
    }
    result
}

/// Turn a terminated reply into a frame, enforcing the verb's minimum body.
fn decode_reply(verb: Verb, bytes: &[u8], strict: bool) -> SessionResult<DecodedFrame> {
    let expected = verb.spec().min_reply_len;
    let frame = match FrameCodec::decode(bytes) {
        Ok(frame) => frame,
        Err(ProtocolError::FrameTooShort { .. }) => {
            return Err(SessionError::ShortResponse {
                verb,
                expected,
                actual: 0,
            })
        }
        Err(e) => return Err(e.into()),
    };
    if !frame.length_consistent() {
        trace!(
            "{} reply length field {:?} disagrees with the characters received",
            verb,
            frame.declared_length()
        );
    }

    if frame.body().len() < expected {
        return Err(SessionError::ShortResponse {
            verb,
            expected,
            actual: frame.body().len(),
        });
    }
    if strict {
        if let Err(ProtocolError::ChecksumMismatch { expected, actual }) = frame.verify_checksum() {
            return Err(SessionError::ChecksumMismatch {
                verb,
                expected,
                actual,
            });
        }
    }
    Ok(frame)
}

fn expect_ack(frame: &DecodedFrame, verb: Verb) -> SessionResult<()> {
    if is_acknowledged(frame.body(), verb) {
        Ok(())
    } else {
        Err(SessionError::NotAcknowledged {
            verb,
            body: frame.body().to_string(),
        })
    }
}

/// The one reading of a single-block reply.
fn first_reading(parsed: BulkParse, channel: usize) -> WeightReading {
    parsed
        .readings
        .into_iter()
        .next()
        .unwrap_or_else(|| WeightReading::invalid(channel, ReadingFault::FieldParse))
}

fn count_invalid(tags: &[(&'static str, String)], readings: &[WeightReading]) {
    let invalid = readings.iter().filter(|r| !r.is_valid()).count();
    if invalid > 0 {
        metrics::counter!(metric_defs::READINGS_INVALID.name, tags).increment(invalid as u64);
    }
}
