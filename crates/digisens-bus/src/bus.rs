//! One physical bus: an owned transport plus the settle-delay bookkeeping.
//!
//! Every exchange on a bus goes through [`Bus::exchange`], which takes
//! `&mut self`. Two exchanges on the same bus therefore cannot overlap, and
//! there is no lock to forget.

use std::thread;
use std::time::{Duration, Instant};

use digisens_protocol::{Baudrate, Verb, TERMINATOR};
use tracing::{debug, info, trace, warn};

use crate::error::{SessionError, SessionResult};
use crate::transport::Transport;

/// Default idle time between exchanges on one bus.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Per-bus timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Minimum idle time between the end of one exchange and the start of the next.
    pub settle_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Whether the bus accepts exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Ready,
    /// The transport failed; nothing runs until [`Bus::reopen`].
    Failed { reason: String },
    /// A device switched rates; nothing runs until the line follows.
    AwaitingReopen { baud: Baudrate },
}

/// Bytes of one completed exchange.
#[derive(Debug, Clone)]
pub(crate) struct RawReply {
    /// Reply up to and including the terminator.
    pub bytes: Vec<u8>,
    /// From the end of the write to the terminator.
    pub latency: Duration,
}

/// A transport together with the discipline for sharing it.
pub struct Bus<T: Transport> {
    transport: T,
    config: BusConfig,
    state: LinkState,
    last_exchange_end: Option<Instant>,
    exchanges: u64,
}

impl<T: Transport> Bus<T> {
    pub fn new(transport: T, config: BusConfig) -> Self {
        Bus {
            transport,
            config,
            state: LinkState::Ready,
            last_exchange_end: None,
            exchanges: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Direct access to the transport, e.g. to adjust a simulator between cycles.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Exchanges attempted on this bus so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges
    }

    /// Swap in a freshly opened transport and accept exchanges again.
    ///
    /// Returns the old transport so the caller decides when it is closed.
    pub fn reopen(&mut self, transport: T) -> T {
        info!("{}: reopened (was {:?})", transport.name(), self.state);
        self.state = LinkState::Ready;
        std::mem::replace(&mut self.transport, transport)
    }

    /// Follow a device to the rate it switched to, on the same transport.
    pub fn apply_baudrate(&mut self) -> SessionResult<()> {
        let baud = match self.state {
            LinkState::AwaitingReopen { baud } => baud,
            LinkState::Ready => return Ok(()),
            LinkState::Failed { ref reason } => {
                return Err(SessionError::ConnectionFailure {
                    bus: self.name().to_string(),
                    reason: reason.clone(),
                })
            }
        };
        self.set_line_rate(baud)?;
        info!("{}: line rate now {} baud", self.name(), baud);
        Ok(())
    }

    /// Set the local line rate without telling any device.
    ///
    /// A bus waiting for a device's new rate becomes ready once the line
    /// matches it; any other rate leaves it waiting.
    pub fn set_line_rate(&mut self, baud: Baudrate) -> SessionResult<()> {
        if let LinkState::Failed { reason } = &self.state {
            return Err(SessionError::ConnectionFailure {
                bus: self.name().to_string(),
                reason: reason.clone(),
            });
        }
        if let Err(e) = self.transport.set_baud_rate(baud.bps()) {
            return Err(self.fail(e.to_string()));
        }
        debug!("{}: line set to {} baud", self.name(), baud);
        if self.state == (LinkState::AwaitingReopen { baud }) {
            self.state = LinkState::Ready;
        }
        Ok(())
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub(crate) fn baudrate_changed(&mut self, baud: Baudrate) {
        info!("{}: device switched to {} baud", self.name(), baud);
        self.state = LinkState::AwaitingReopen { baud };
    }

    fn fail(&mut self, reason: String) -> SessionError {
        warn!("{}: connection failure: {}", self.name(), reason);
        self.state = LinkState::Failed {
            reason: reason.clone(),
        };
        SessionError::ConnectionFailure {
            bus: self.name().to_string(),
            reason,
        }
    }

    fn ensure_ready(&self) -> SessionResult<()> {
        match &self.state {
            LinkState::Ready => Ok(()),
            LinkState::Failed { reason } => Err(SessionError::ConnectionFailure {
                bus: self.name().to_string(),
                reason: reason.clone(),
            }),
            LinkState::AwaitingReopen { baud } => Err(SessionError::BaudrateChanged {
                bus: self.name().to_string(),
                baud: *baud,
            }),
        }
    }

    fn wait_settled(&self) {
        if let Some(end) = self.last_exchange_end {
            let idle = end.elapsed();
            if idle < self.config.settle_delay {
                let wait = self.config.settle_delay - idle;
                trace!("{}: settling for {:?}", self.name(), wait);
                thread::sleep(wait);
            }
        }
    }

    /// Run one write/read exchange.
    ///
    /// Waits out the settle delay, drops stale input, writes `request` and
    /// reads until the terminator or `timeout`. The end of the exchange is
    /// recorded on every path so the next one settles after it.
    pub(crate) fn exchange(
        &mut self,
        verb: Verb,
        request: &[u8],
        timeout: Duration,
    ) -> SessionResult<RawReply> {
        self.ensure_ready()?;
        self.wait_settled();

        let result = self.write_then_read(request, timeout);
        self.last_exchange_end = Some(Instant::now());
        self.exchanges += 1;

        let (bytes, latency) = match result {
            Ok(ok) => ok,
            Err(e) => return Err(self.fail(e.to_string())),
        };

        if bytes.last() != Some(&TERMINATOR) {
            debug!(
                "{}: no terminator for {} within {:?} ({} byte(s))",
                self.name(),
                verb,
                timeout,
                bytes.len()
            );
            return Err(SessionError::Timeout {
                verb,
                timeout,
                received: bytes.len(),
            });
        }
        Ok(RawReply { bytes, latency })
    }

    fn write_then_read(
        &mut self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<(Vec<u8>, Duration), crate::error::TransportError> {
        self.transport.discard_pending()?;
        self.transport.write_all(request)?;
        let sent = Instant::now();
        let bytes = self.transport.read_until(TERMINATOR, timeout)?;
        Ok((bytes, sent.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{EventKind, RecordingLog, ScriptedReply, ScriptedTransport};

    fn bus_with(replies: Vec<ScriptedReply>, settle: Duration) -> (Bus<ScriptedTransport>, RecordingLog) {
        let log = RecordingLog::new();
        let mut transport = ScriptedTransport::new("bus0", log.clone());
        for reply in replies {
            transport.push_reply(reply);
        }
        (Bus::new(transport, BusConfig { settle_delay: settle }), log)
    }

    #[test]
    fn test_exchange_returns_terminated_reply() {
        let (mut bus, _) = bus_with(vec![ScriptedReply::Raw(b"@05gm\r".to_vec())], Duration::ZERO);
        let reply = bus
            .exchange(Verb::ReadModel, b"@08gm12300\r", Duration::from_millis(20))
            .unwrap();
        assert_eq!(reply.bytes, b"@05gm\r");
        assert_eq!(bus.exchange_count(), 1);
    }

    #[test]
    fn test_missing_terminator_is_timeout() {
        let (mut bus, _) = bus_with(vec![ScriptedReply::Raw(b"@13 0002".to_vec())], Duration::ZERO);
        let err = bus
            .exchange(Verb::ReadOneWeight, b"req", Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { received: 8, .. }));
        assert!(bus.is_ready());
    }

    #[test]
    fn test_settle_delay_between_exchanges() {
        let settle = Duration::from_millis(40);
        let (mut bus, log) = bus_with(
            vec![
                ScriptedReply::Raw(b"a\r".to_vec()),
                ScriptedReply::Raw(b"b\r".to_vec()),
            ],
            settle,
        );
        bus.exchange(Verb::ReadModel, b"1", Duration::from_millis(10)).unwrap();
        bus.exchange(Verb::ReadModel, b"2", Duration::from_millis(10)).unwrap();

        let spans = log.exchanges();
        assert_eq!(spans.len(), 2);
        assert!(spans[1].written_at.duration_since(spans[0].read_at) >= settle);
    }

    #[test]
    fn test_connection_failure_halts_bus() {
        let (mut bus, log) = bus_with(vec![ScriptedReply::Disconnect], Duration::ZERO);
        let err = bus
            .exchange(Verb::ReadAllWeights, b"1", Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailure { .. }));
        assert!(matches!(bus.state(), LinkState::Failed { .. }));

        let before = log.events().len();
        let err = bus
            .exchange(Verb::ReadAllWeights, b"2", Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailure { .. }));
        assert_eq!(log.events().len(), before);

        let fresh = ScriptedTransport::new("bus0", log.clone())
            .with_reply(ScriptedReply::Raw(b"ok\r".to_vec()));
        let old = bus.reopen(fresh);
        assert!(old.is_closed());
        assert!(bus.exchange(Verb::ReadModel, b"3", Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_awaiting_reopen_blocks_until_applied() {
        let (mut bus, log) = bus_with(vec![ScriptedReply::Raw(b"ok\r".to_vec())], Duration::ZERO);
        bus.baudrate_changed(Baudrate::B19200);
        let err = bus
            .exchange(Verb::ReadModel, b"1", Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SessionError::BaudrateChanged { baud: Baudrate::B19200, .. }));

        bus.apply_baudrate().unwrap();
        assert_eq!(bus.transport().baud_rate(), 19200);
        assert!(log.events().iter().any(|e| e.kind == EventKind::BaudRate(19200)));
        assert!(bus.exchange(Verb::ReadModel, b"1", Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_line_rate_must_match_switched_device() {
        let (mut bus, _) = bus_with(vec![ScriptedReply::Raw(b"ok\r".to_vec())], Duration::ZERO);
        bus.baudrate_changed(Baudrate::B57600);

        bus.set_line_rate(Baudrate::B19200).unwrap();
        assert_eq!(bus.transport().baud_rate(), 19200);
        assert!(matches!(bus.state(), LinkState::AwaitingReopen { .. }));

        bus.set_line_rate(Baudrate::B57600).unwrap();
        assert!(bus.is_ready());
        assert!(bus.exchange(Verb::ReadModel, b"1", Duration::from_millis(10)).is_ok());
    }
}
