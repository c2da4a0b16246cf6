//! RS485 transport over a local serial port.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::transport::Transport;

/// Longest single blocking read; keeps deadline overshoot small.
const READ_SLICE: Duration = Duration::from_millis(20);

/// A serial port opened 8N1 without flow control.
pub struct SerialTransport {
    name: String,
    port: Box<dyn SerialPort>,
    /// Bytes read past a terminator, or not yet terminated.
    pending: BytesMut,
}

impl SerialTransport {
    /// Open `path` at `baud` and flush both directions.
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_SLICE)
            .open()?;
        port.clear(ClearBuffer::All)?;
        debug!("opened {} at {} baud", path, baud);

        Ok(SerialTransport {
            name: path.to_string(),
            port,
            pending: BytesMut::with_capacity(256),
        })
    }

    /// Current line rate as reported by the driver.
    pub fn baud_rate(&self) -> Result<u32, TransportError> {
        Ok(self.port.baud_rate()?)
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!("{} <- {:?}", self.name, String::from_utf8_lossy(bytes));
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];

        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == terminator) {
                let line = self.pending.split_to(pos + 1).to_vec();
                trace!("{} -> {:?}", self.name, String::from_utf8_lossy(&line));
                return Ok(line);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(self.pending.split().to_vec());
            }
            self.port.set_timeout((deadline - now).min(READ_SLICE))?;

            match self.port.read(&mut chunk) {
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn discard_pending(&mut self) -> Result<(), TransportError> {
        if !self.pending.is_empty() {
            debug!("{}: discarding {} stale byte(s)", self.name, self.pending.len());
            self.pending.clear();
        }
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.port.set_baud_rate(baud)?;
        debug!("{} now at {} baud", self.name, baud);
        Ok(())
    }
}
