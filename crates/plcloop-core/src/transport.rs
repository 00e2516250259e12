//! Non-blocking transport capability.
//!
//! A [`Transport`] is the byte pipe under one connection: a TCP socket, a
//! serial port, or a scripted fake in tests. Every method must return
//! immediately. "Not yet" is expressed as [`Poll::Pending`], never by
//! blocking the caller.

use std::task::Poll;

use bytes::BytesMut;

use crate::error::TransportError;

/// Byte transport driven by a [`Connection`](crate::connection::Connection).
///
/// # Invariants
///
/// - No method blocks.
/// - `poll_dial` is only called until it yields `Ready`.
/// - `read_available` and `write_available` are only called after a
///   successful dial.
/// - `close` is called at most once per transport by the engine.
pub trait Transport: Send {
    /// Drive the dial forward.
    ///
    /// `Ready(Ok(()))` once the link is usable, `Ready(Err(_))` if it never
    /// will be, `Pending` while still in progress.
    fn poll_dial(&mut self) -> Poll<Result<(), TransportError>>;

    /// Append whatever bytes are available to `buf`.
    ///
    /// Returns the number of bytes appended. `Ready(Ok(0))` means the peer
    /// closed the link. `Pending` means nothing is available right now.
    fn read_available(&mut self, buf: &mut BytesMut) -> Poll<Result<usize, TransportError>>;

    /// Write a prefix of `data`.
    ///
    /// Returns how many bytes were accepted, which may be fewer than
    /// `data.len()`. `Pending` means the transport cannot accept anything
    /// right now.
    fn write_available(&mut self, data: &[u8]) -> Poll<Result<usize, TransportError>>;

    /// Close the link. Must not block.
    fn close(&mut self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn poll_dial(&mut self) -> Poll<Result<(), TransportError>> {
        (**self).poll_dial()
    }

    fn read_available(&mut self, buf: &mut BytesMut) -> Poll<Result<usize, TransportError>> {
        (**self).read_available(buf)
    }

    fn write_available(&mut self, data: &[u8]) -> Poll<Result<usize, TransportError>> {
        (**self).write_available(data)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

/// Stand-in for a transport whose setup already failed.
///
/// The first `poll_dial` reports the setup error, so the failure reaches the
/// caller through the connection-error callback like any other dial failure.
#[derive(Debug)]
pub(crate) struct FailedTransport {
    error: Option<TransportError>,
}

impl FailedTransport {
    pub(crate) fn new(error: TransportError) -> Self {
        Self { error: Some(error) }
    }
}

impl Transport for FailedTransport {
    fn poll_dial(&mut self) -> Poll<Result<(), TransportError>> {
        Poll::Ready(Err(self.error.take().unwrap_or(TransportError::Closed)))
    }

    fn read_available(&mut self, _buf: &mut BytesMut) -> Poll<Result<usize, TransportError>> {
        Poll::Ready(Err(TransportError::Closed))
    }

    fn write_available(&mut self, _data: &[u8]) -> Poll<Result<usize, TransportError>> {
        Poll::Ready(Err(TransportError::Closed))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
