//! Error types for transports and device sessions.

use std::time::Duration;

use digisens_protocol::{Baudrate, ProtocolError, ReadingFault, Verb};
use thiserror::Error;

/// Failures of the byte stream underneath a bus.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been closed or unplugged.
    #[error("transport closed")]
    Closed,

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port driver error.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Errors that end one exchange with one device.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport is unavailable. No further exchanges run on this bus
    /// until it is reopened.
    #[error("connection failure on {bus}: {reason}")]
    ConnectionFailure {
        /// Bus name.
        bus: String,
        /// What the transport reported.
        reason: String,
    },

    /// No terminator arrived before the deadline.
    #[error("timed out after {timeout:?} waiting for {verb} reply ({received} byte(s) received)")]
    Timeout {
        /// Verb that was sent.
        verb: Verb,
        /// Deadline that expired.
        timeout: Duration,
        /// Bytes received before the deadline.
        received: usize,
    },

    /// A terminator arrived but the body is too short for the verb.
    #[error("short {verb} reply: expected at least {expected} body characters, got {actual}")]
    ShortResponse {
        /// Verb that was sent.
        verb: Verb,
        /// Minimum body length for the verb.
        expected: usize,
        /// Body length received.
        actual: usize,
    },

    /// Strict mode: the reply checksum does not match its contents.
    #[error("checksum mismatch in {verb} reply: computed {expected}, received {actual}")]
    ChecksumMismatch {
        /// Verb that was sent.
        verb: Verb,
        /// Recomputed checksum.
        expected: String,
        /// Received checksum field.
        actual: String,
    },

    /// A write command's reply did not echo the verb.
    #[error("{verb} not acknowledged: reply body {body:?}")]
    NotAcknowledged {
        /// Verb that was sent.
        verb: Verb,
        /// Reply body received instead.
        body: String,
    },

    /// The device now listens at a different line rate.
    #[error("bus {bus} switched to {baud} baud; reopen the transport before the next exchange")]
    BaudrateChanged {
        /// Bus name.
        bus: String,
        /// Rate the device switched to.
        baud: Baudrate,
    },

    /// Request could not be encoded, or the reply could not be interpreted.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Fault recorded on the placeholder readings that stand in for this failure.
    pub fn fault(&self) -> ReadingFault {
        match self {
            SessionError::ConnectionFailure { .. } | SessionError::BaudrateChanged { .. } => {
                ReadingFault::ConnectionFailure
            }
            SessionError::Timeout { .. } => ReadingFault::Timeout,
            SessionError::ShortResponse { .. } => ReadingFault::ShortResponse,
            SessionError::ChecksumMismatch { .. } => ReadingFault::ChecksumMismatch,
            SessionError::NotAcknowledged { .. } | SessionError::Protocol(_) => {
                ReadingFault::Malformed
            }
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::ConnectionFailure { .. } => "connection",
            SessionError::Timeout { .. } => "timeout",
            SessionError::ShortResponse { .. } => "short_response",
            SessionError::ChecksumMismatch { .. } => "checksum",
            SessionError::NotAcknowledged { .. } => "not_acknowledged",
            SessionError::BaudrateChanged { .. } => "baudrate_changed",
            SessionError::Protocol(_) => "protocol",
        }
    }

    /// Whether this failure halts further exchanges on the bus.
    pub fn halts_bus(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionFailure { .. } | SessionError::BaudrateChanged { .. }
        )
    }
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
