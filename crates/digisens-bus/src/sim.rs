//! In-memory devices that answer real frames.
//!
//! A [`SimulatedBus`] is a [`Transport`] with any number of
//! [`SimulatedDevice`]s behind it. Requests are decoded and checksum-verified
//! exactly as a controller would; a device only answers frames addressed to
//! it at the rate it is listening on. Anything it would ignore produces
//! silence, which the caller sees as a timeout.

use std::thread;
use std::time::Duration;

use digisens_protocol::{
    format_block, AddressMode, Baudrate, DecodedFrame, DeviceAddress, FrameCodec, PrecisionMode,
    RequestShape, StatusFlag, Verb, DEFAULT_BAUD_RATE,
};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::mock::{EventKind, RecordingLog};
use crate::transport::Transport;

/// Frequency reported by `gd` frequency mode for an unloaded cell.
const BASE_FREQUENCY_HZ: f64 = 5000.0;
/// Frequency change per kg of load.
const HZ_PER_KG: f64 = 100.0;

/// One simulated load-cell input.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedChannel {
    /// Load on the cell in kg.
    pub load: f64,
    /// Load stored by the last `sz`.
    pub zero: f64,
    pub status: StatusFlag,
}

impl SimulatedChannel {
    fn weight(&self) -> f64 {
        self.load - self.zero
    }
}

/// A controller with its channels, identity strings and line rate.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    address: DeviceAddress,
    channels: Vec<SimulatedChannel>,
    model: String,
    revision: String,
    baud: Baudrate,
    eeprom_writes: u32,
}

impl SimulatedDevice {
    /// A device with `channels` unloaded, stable channels at 9600 baud.
    pub fn new(address: DeviceAddress, channels: usize) -> Self {
        SimulatedDevice {
            address,
            channels: vec![
                SimulatedChannel {
                    load: 0.0,
                    zero: 0.0,
                    status: StatusFlag::Ok,
                };
                channels
            ],
            model: "DIGIsens H1103".to_string(),
            revision: "2.1".to_string(),
            baud: Baudrate::default(),
            eeprom_writes: 0,
        }
    }

    /// Builder: put `kg` on `channel`.
    pub fn with_load(mut self, channel: usize, kg: f64) -> Self {
        self.set_load(channel, kg);
        self
    }

    /// Builder: force the status byte of `channel`.
    pub fn with_status(mut self, channel: usize, status: StatusFlag) -> Self {
        self.set_status(channel, status);
        self
    }

    /// Builder: listen at `baud` instead of 9600.
    pub fn with_baud(mut self, baud: Baudrate) -> Self {
        self.baud = baud;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, revision: impl Into<String>) -> Self {
        self.model = model.into();
        self.revision = revision.into();
        self
    }

    pub fn set_load(&mut self, channel: usize, kg: f64) {
        if let Some(ch) = self.channels.get_mut(channel) {
            ch.load = kg;
        }
    }

    pub fn set_status(&mut self, channel: usize, status: StatusFlag) {
        if let Some(ch) = self.channels.get_mut(channel) {
            ch.status = status;
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn channels(&self) -> &[SimulatedChannel] {
        &self.channels
    }

    /// Rate the device is currently listening at.
    pub fn baud(&self) -> Baudrate {
        self.baud
    }

    /// Number of zero references stored so far.
    pub fn eeprom_writes(&self) -> u32 {
        self.eeprom_writes
    }

    /// One weight block laid out for `verb`.
    fn block(&self, verb: Verb, channel: usize, mode: PrecisionMode) -> Option<String> {
        let digits = verb.spec().weight_digits()?;
        Some(match self.channels.get(channel) {
            Some(ch) => {
                let value = match mode {
                    PrecisionMode::Weight => ch.weight(),
                    PrecisionMode::Frequency => BASE_FREQUENCY_HZ + ch.load * HZ_PER_KG,
                };
                format_block(value, ch.status, digits)
            }
            None => format_block(0.0, StatusFlag::NotConnected, digits),
        })
    }

    /// Reply body for a request addressed to this device, or `None` to stay silent.
    fn respond(&mut self, verb: Verb, command: &str, data: &str) -> Option<String> {
        match verb {
            Verb::ReadAllWeights => (0..self.channels.len())
                .map(|ch| self.block(verb, ch, PrecisionMode::Weight))
                .collect(),
            Verb::ReadOneWeight => {
                let channel = data.get(..2)?.parse().ok()?;
                self.block(verb, channel, PrecisionMode::Weight)
            }
            Verb::ReadHighPrecision => {
                let mut digits = data.chars();
                let channel = digits.next()?.to_digit(10)? as usize;
                let mode = PrecisionMode::from_digit(digits.next()?)?;
                self.block(verb, channel, mode)
            }
            Verb::ZeroChannel => {
                let channel: usize = data.parse().ok()?;
                let ch = self.channels.get_mut(channel)?;
                ch.zero = ch.load;
                self.eeprom_writes += 1;
                Some(format!("{}{}", command, self.address.id()))
            }
            Verb::ReadModel => Some(self.model.clone()),
            Verb::ReadRevision => Some(self.revision.clone()),
            Verb::SetBaudrate => {
                let code = command.get(2..3)?.parse().ok()?;
                let baud = Baudrate::from_code(code).ok()?;
                let ack = format!("{}{}", command, self.address.id());
                self.baud = baud;
                Some(ack)
            }
            Verb::ReadAddress => Some(self.address.id().to_string()),
        }
    }
}

/// A bus segment full of simulated devices.
pub struct SimulatedBus {
    name: String,
    devices: Vec<SimulatedDevice>,
    line_baud: u32,
    pending: Vec<u8>,
    connected: bool,
    log: Option<RecordingLog>,
}

impl SimulatedBus {
    pub fn new(name: impl Into<String>) -> Self {
        SimulatedBus {
            name: name.into(),
            devices: Vec::new(),
            line_baud: DEFAULT_BAUD_RATE,
            pending: Vec::new(),
            connected: true,
            log: None,
        }
    }

    /// Builder: attach a device.
    pub fn with_device(mut self, device: SimulatedDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Builder: record traffic into `log`.
    pub fn with_log(mut self, log: RecordingLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn add_device(&mut self, device: SimulatedDevice) {
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[SimulatedDevice] {
        &self.devices
    }

    pub fn device(&self, address: &DeviceAddress) -> Option<&SimulatedDevice> {
        self.devices.iter().find(|d| d.address == *address)
    }

    pub fn device_mut(&mut self, address: &DeviceAddress) -> Option<&mut SimulatedDevice> {
        self.devices.iter_mut().find(|d| d.address == *address)
    }

    /// Rate the simulated line currently runs at.
    pub fn line_baud(&self) -> u32 {
        self.line_baud
    }

    /// Pull the plug: every later call fails with [`TransportError::Closed`].
    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    fn record(&self, kind: EventKind) {
        if let Some(log) = &self.log {
            log.record(&self.name, kind);
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Work out the reply to one request, if any device sends one.
    fn answer(&mut self, frame: &DecodedFrame) -> Option<(AddressMode, String)> {
        let mode = frame.mode()?;
        let payload = frame.body();
        let verb = Verb::from_code(payload.get(..2)?)?;
        let line_baud = self.line_baud;

        if verb == Verb::ReadAddress {
            let listening: Vec<&SimulatedDevice> = self
                .devices
                .iter()
                .filter(|d| d.address.mode() == mode && d.baud.bps() == line_baud)
                .collect();
            if listening.len() > 1 {
                debug!("{}: {} devices answer a broadcast", self.name, listening.len());
            }
            // Simultaneous answers run into each other on the wire.
            let body: String = listening.iter().map(|d| d.address.id()).collect();
            return (!body.is_empty()).then_some((mode, body));
        }

        let command_len = match verb.spec().request {
            RequestShape::BaudCode => 3,
            _ => 2,
        };
        let command = payload.get(..command_len)?;
        let id = payload.get(command_len..command_len + mode.id_len())?;
        let data = payload.get(command_len + mode.id_len()..)?;

        let device = self
            .devices
            .iter_mut()
            .find(|d| d.address.mode() == mode && d.address.id() == id)?;
        if device.baud.bps() != line_baud {
            trace!("{}: {} listens at {} baud", self.name, device.address, device.baud);
            return None;
        }
        device.respond(verb, command, data).map(|body| (mode, body))
    }
}

impl Transport for SimulatedBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.record(EventKind::Write(bytes.to_vec()));

        let frame = match FrameCodec::decode_strict(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{}: devices ignore request: {}", self.name, e);
                return Ok(());
            }
        };
        if let Some((mode, body)) = self.answer(&frame) {
            match FrameCodec::encode_payload(mode.header(), body.as_bytes()) {
                Ok(reply) => self.pending.extend_from_slice(&reply),
                Err(e) => debug!("{}: reply does not fit a frame: {}", self.name, e),
            }
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected()?;
        let line = match self.pending.iter().position(|&b| b == terminator) {
            Some(pos) => self.pending.drain(..=pos).collect(),
            None => {
                thread::sleep(timeout);
                std::mem::take(&mut self.pending)
            }
        };
        self.record(EventKind::Read(line.clone()));
        Ok(line)
    }

    fn discard_pending(&mut self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if !self.pending.is_empty() {
            self.record(EventKind::Discard(self.pending.len()));
            self.pending.clear();
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.line_baud = baud;
        self.record(EventKind::BaudRate(baud));
        Ok(())
    }
}
