//! Scripted transport and event recording for tests.
//!
//! [`ScriptedTransport`] plays back queued replies, one per request, and
//! writes every write/read/discard into a shared [`RecordingLog`]. Several
//! transports can share one log to check ordering across buses.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use digisens_protocol::{AddressMode, FrameCodec, ProtocolResult};
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::transport::Transport;

/// What happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Request bytes written.
    Write(Vec<u8>),
    /// Bytes handed back by `read_until`.
    Read(Vec<u8>),
    /// Stale bytes dropped before an exchange.
    Discard(usize),
    /// Local line rate changed.
    BaudRate(u32),
}

/// One recorded transport event.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    /// Transport name.
    pub bus: String,
    /// When the call returned.
    pub at: Instant,
    pub kind: EventKind,
}

/// A write followed by the read that answered it.
#[derive(Debug, Clone)]
pub struct ExchangeSpan {
    pub bus: String,
    pub request: Vec<u8>,
    pub reply: Vec<u8>,
    pub written_at: Instant,
    pub read_at: Instant,
}

/// Shared, append-only event log.
#[derive(Debug, Clone, Default)]
pub struct RecordingLog {
    events: Arc<Mutex<Vec<TransportEvent>>>,
}

impl RecordingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bus: &str, kind: EventKind) {
        self.events.lock().push(TransportEvent {
            bus: bus.to_string(),
            at: Instant::now(),
            kind,
        });
    }

    /// Snapshot of every event so far, in recording order.
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    /// Requests written on `bus`, in order.
    pub fn writes(&self, bus: &str) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.bus == bus)
            .filter_map(|e| match &e.kind {
                EventKind::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Pair every write with the next read on the same bus.
    ///
    /// A write that was never followed by a read (the transport failed) has
    /// no span.
    pub fn exchanges(&self) -> Vec<ExchangeSpan> {
        let events = self.events.lock();
        let mut open: Vec<(String, Vec<u8>, Instant)> = Vec::new();
        let mut spans = Vec::new();

        for event in events.iter() {
            match &event.kind {
                EventKind::Write(bytes) => {
                    open.retain(|(bus, _, _)| *bus != event.bus);
                    open.push((event.bus.clone(), bytes.clone(), event.at));
                }
                EventKind::Read(bytes) => {
                    if let Some(pos) = open.iter().position(|(bus, _, _)| *bus == event.bus) {
                        let (bus, request, written_at) = open.remove(pos);
                        spans.push(ExchangeSpan {
                            bus,
                            request,
                            reply: bytes.clone(),
                            written_at,
                            read_at: event.at,
                        });
                    }
                }
                EventKind::Discard(_) | EventKind::BaudRate(_) => {}
            }
        }
        spans
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// How a scripted transport answers one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// These exact bytes. Without a terminator the read runs into its timeout.
    Raw(Vec<u8>),
    /// Nothing at all; the read waits out its timeout.
    Silence,
    /// The transport goes away mid-exchange.
    Disconnect,
}

impl ScriptedReply {
    /// A well-formed reply frame carrying `body`.
    pub fn body(mode: AddressMode, body: &str) -> ProtocolResult<Self> {
        Ok(ScriptedReply::Raw(FrameCodec::encode_payload(
            mode.header(),
            body.as_bytes(),
        )?))
    }

    /// A reply frame whose checksum field has been replaced.
    pub fn corrupted(mode: AddressMode, body: &str) -> ProtocolResult<Self> {
        let mut frame = FrameCodec::encode_payload(mode.header(), body.as_bytes())?;
        let cs = frame.len() - 3;
        frame[cs] = if frame[cs] == b'0' { b'1' } else { b'0' };
        Ok(ScriptedReply::Raw(frame))
    }
}

/// Transport that answers requests from a queue.
pub struct ScriptedTransport {
    name: String,
    replies: VecDeque<ScriptedReply>,
    current: Option<ScriptedReply>,
    pending: Vec<u8>,
    log: RecordingLog,
    baud: u32,
    closed: bool,
}

impl ScriptedTransport {
    pub fn new(name: impl Into<String>, log: RecordingLog) -> Self {
        ScriptedTransport {
            name: name.into(),
            replies: VecDeque::new(),
            current: None,
            pending: Vec::new(),
            log,
            baud: digisens_protocol::DEFAULT_BAUD_RATE,
            closed: false,
        }
    }

    /// Queue the answer to the next unanswered request.
    pub fn push_reply(&mut self, reply: ScriptedReply) -> &mut Self {
        self.replies.push_back(reply);
        self
    }

    /// Builder form of [`push_reply`](Self::push_reply).
    pub fn with_reply(mut self, reply: ScriptedReply) -> Self {
        self.replies.push_back(reply);
        self
    }

    /// Bytes sitting in the receive buffer before the next exchange.
    pub fn push_stale(&mut self, bytes: &[u8]) -> &mut Self {
        self.pending.extend_from_slice(bytes);
        self
    }

    pub fn remaining_replies(&self) -> usize {
        self.replies.len()
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn log(&self) -> &RecordingLog {
        &self.log
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.log.record(&self.name, EventKind::Write(bytes.to_vec()));
        self.current = Some(self.replies.pop_front().unwrap_or(ScriptedReply::Silence));
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.current.take() {
            Some(ScriptedReply::Disconnect) => {
                self.closed = true;
                return Err(TransportError::Closed);
            }
            Some(ScriptedReply::Raw(bytes)) => self.pending.extend_from_slice(&bytes),
            Some(ScriptedReply::Silence) | None => {}
        }

        let line = match self.pending.iter().position(|&b| b == terminator) {
            Some(pos) => self.pending.drain(..=pos).collect(),
            None => {
                thread::sleep(timeout);
                std::mem::take(&mut self.pending)
            }
        };
        self.log.record(&self.name, EventKind::Read(line.clone()));
        Ok(line)
    }

    fn discard_pending(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if !self.pending.is_empty() {
            self.log.record(&self.name, EventKind::Discard(self.pending.len()));
            self.pending.clear();
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.baud = baud;
        self.log.record(&self.name, EventKind::BaudRate(baud));
        Ok(())
    }
}
