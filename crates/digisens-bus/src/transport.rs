//! The byte-stream seam underneath a bus.

use std::time::Duration;

use crate::error::TransportError;

/// A half-duplex byte stream to one physical bus.
///
/// Implementations never need to be shareable: a transport is owned by exactly
/// one [`Bus`](crate::Bus), and only that bus ever touches it.
pub trait Transport: Send {
    /// Name used in logs, metrics and errors (usually the port path).
    fn name(&self) -> &str;

    /// Write a complete request frame.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read until `terminator` has been received or `timeout` has elapsed.
    ///
    /// On success the returned bytes end with the terminator. If the deadline
    /// passes first, whatever arrived is returned without a terminator; that is
    /// not an error at this level. Errors are reserved for a transport that is
    /// no longer usable.
    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drop any bytes that arrived outside an exchange.
    fn discard_pending(&mut self) -> Result<(), TransportError>;

    /// Switch the local line rate.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(bytes)
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read_until(terminator, timeout)
    }

    fn discard_pending(&mut self) -> Result<(), TransportError> {
        (**self).discard_pending()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        (**self).set_baud_rate(baud)
    }
}
