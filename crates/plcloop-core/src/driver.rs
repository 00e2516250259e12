//! Driver plugin contract.
//!
//! A [`Driver`] is registered under a URI scheme and turns a parsed
//! [`ConnectionString`] into a [`Session`]: the transport that carries bytes
//! plus the [`Protocol`] state machine that frames them. The engine never
//! looks inside either; it only drives them through the traits below.

use bytes::{Bytes, BytesMut};

use crate::{
    error::{DriverError, ProtocolError, TransportError},
    transport::{FailedTransport, Transport},
    uri::ConnectionString,
};

/// Protocol driver registered under a URI scheme.
pub trait Driver: Send {
    /// Scheme served by this driver, e.g. `"s7"`. Compared case-insensitively.
    fn scheme(&self) -> &str;

    /// One-time initialisation, run by [`System::init`] or on registration
    /// after init.
    ///
    /// [`System::init`]: crate::system::System::init
    fn load(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Build the transport and protocol for one connection.
    ///
    /// Must not block on the network: dialing happens later through
    /// [`Transport::poll_dial`].
    fn create_connection(&mut self, target: &ConnectionString) -> Result<Session, DriverError>;
}

/// Wire protocol state machine for one connection.
///
/// Sans-IO: it never touches the transport. Inbound bytes are handed to
/// [`decode`](Protocol::decode) and outbound frames are pulled with
/// [`poll_outbound`](Protocol::poll_outbound).
pub trait Protocol: Send {
    /// Link is up. Typically queues the protocol's handshake frames.
    fn on_connected(&mut self) {}

    /// Consume complete frames from the front of `inbound`.
    ///
    /// A trailing partial frame must be left in place; it is completed by
    /// later reads.
    fn decode(&mut self, inbound: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Next frame to send, if any.
    fn poll_outbound(&mut self) -> Option<Bytes>;

    /// Graceful disconnect requested. May queue a final frame.
    fn on_disconnect(&mut self) {}
}

/// Transport and protocol bound to one connection.
pub struct Session {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) protocol: Box<dyn Protocol>,
}

impl Session {
    /// Bundle a transport with its protocol.
    pub fn new(transport: impl Transport + 'static, protocol: impl Protocol + 'static) -> Self {
        Self { transport: Box::new(transport), protocol: Box::new(protocol) }
    }

    /// Bundle already boxed parts.
    pub fn from_boxed(transport: Box<dyn Transport>, protocol: Box<dyn Protocol>) -> Self {
        Self { transport, protocol }
    }

    /// Session whose dial fails with `error` on first poll.
    pub(crate) fn failed(error: TransportError) -> Self {
        Self::new(FailedTransport::new(error), Inert)
    }
}

/// Protocol of a session that never connects.
struct Inert;

impl Protocol for Inert {
    fn decode(&mut self, inbound: &mut BytesMut) -> Result<(), ProtocolError> {
        inbound.clear();
        Ok(())
    }

    fn poll_outbound(&mut self) -> Option<Bytes> {
        None
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}
