//! Non-blocking TCP transport and a generic stream driver.
//!
//! [`TcpTransport`] wraps a `socket2` socket in non-blocking mode: the
//! connect is started when the transport is created and completed by
//! [`Transport::poll_dial`]. [`StreamDriver`] pairs it with any
//! [`Protocol`], which is how TCP-hosted PLC protocols (S7 on 102, Modbus on
//! 502) plug into the engine.
//!
//! Hosts must be IP literals. Name resolution blocks, so it is left to the
//! caller, before the connection string is built.

use std::{
    fmt,
    io::{self, Read, Write},
    net::{IpAddr, Shutdown, SocketAddr},
    task::Poll,
};

use bytes::BytesMut;
use socket2::{Domain, Protocol as IpProtocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::{
    driver::{Driver, Protocol, Session},
    error::{DriverError, TransportError},
    transport::Transport,
    uri::ConnectionString,
};

/// Bytes read per call when the buffer has no spare capacity.
const MIN_READ: usize = 1024;

/// Upper bound on bytes read per call.
const MAX_READ: usize = 16 * 1024;

/// TCP transport in non-blocking mode.
pub struct TcpTransport {
    socket: Option<Socket>,
    peer: SocketAddr,
    /// Setup failure, reported by the first `poll_dial`.
    deferred: Option<TransportError>,
    closed: bool,
}

impl TcpTransport {
    /// Start a non-blocking connect to `peer`.
    ///
    /// Never fails here. A socket that cannot be created or a connect that is
    /// rejected immediately is reported by the first [`Transport::poll_dial`].
    pub fn connect(peer: SocketAddr) -> Self {
        match Self::start(peer) {
            Ok(socket) => {
                debug!(%peer, "tcp connect started");
                Self { socket: Some(socket), peer, deferred: None, closed: false }
            },
            Err(err) => {
                debug!(%peer, error = %err, "tcp connect rejected");
                Self { socket: None, peer, deferred: Some(err), closed: false }
            },
        }
    }

    fn start(peer: SocketAddr) -> Result<Socket, TransportError> {
        let socket = Socket::new(Domain::for_address(peer), Type::STREAM, Some(IpProtocol::TCP))?;
        socket.set_nonblocking(true)?;

        match socket.connect(&SockAddr::from(peer)) {
            Ok(()) => Ok(socket),
            Err(err) if is_connect_failure(&err) => Err(err.into()),
            // EINPROGRESS / WSAEWOULDBLOCK: completion is observed by poll_dial.
            Err(_) => Ok(socket),
        }
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn socket(&mut self) -> Result<&mut Socket, TransportError> {
        self.socket.as_mut().ok_or(TransportError::Closed)
    }
}

fn is_connect_failure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::TimedOut
    )
}

impl Transport for TcpTransport {
    fn poll_dial(&mut self) -> Poll<Result<(), TransportError>> {
        if let Some(err) = self.deferred.take() {
            return Poll::Ready(Err(err));
        }
        let socket = match self.socket() {
            Ok(socket) => socket,
            Err(err) => return Poll::Ready(Err(err)),
        };

        match socket.take_error() {
            Ok(Some(err)) | Err(err) => return Poll::Ready(Err(err.into())),
            Ok(None) => {},
        }

        match socket.peer_addr() {
            Ok(_) => Poll::Ready(Ok(())),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Poll::Pending,
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn read_available(&mut self, buf: &mut BytesMut) -> Poll<Result<usize, TransportError>> {
        let socket = match self.socket() {
            Ok(socket) => socket,
            Err(err) => return Poll::Ready(Err(err)),
        };

        let start = buf.len();
        let chunk = (buf.capacity() - start).clamp(MIN_READ, MAX_READ);
        buf.resize(start + chunk, 0);

        let result = socket.read(&mut buf[start..]);
        match result {
            Ok(n) => {
                buf.truncate(start + n);
                trace!(peer = %self.peer, n, "tcp read");
                Poll::Ready(Ok(n))
            },
            Err(err) => {
                buf.truncate(start);
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Poll::Pending,
                    _ => Poll::Ready(Err(err.into())),
                }
            },
        }
    }

    fn write_available(&mut self, data: &[u8]) -> Poll<Result<usize, TransportError>> {
        let socket = match self.socket() {
            Ok(socket) => socket,
            Err(err) => return Poll::Ready(Err(err)),
        };

        match socket.write(data) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Poll::Pending
            },
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.closed = true;
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };
        match socket.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("open", &self.socket.is_some())
            .finish()
    }
}

/// Peer address for `host:port`. Only IP literals are accepted.
fn peer_addr(host: &str, port: u16) -> Result<SocketAddr, DriverError> {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| DriverError::InvalidTarget(format!("host '{host}' is not an IP address")))
}

/// [`Driver`] that dials TCP and builds a protocol per connection.
pub struct StreamDriver<F> {
    scheme: String,
    default_port: u16,
    factory: F,
}

impl<F> StreamDriver<F>
where
    F: FnMut(&ConnectionString) -> Box<dyn Protocol> + Send,
{
    /// Driver for `scheme` that dials `default_port` unless the connection
    /// string names a port.
    pub fn new(scheme: impl Into<String>, default_port: u16, factory: F) -> Self {
        Self { scheme: scheme.into(), default_port, factory }
    }
}

impl<F> Driver for StreamDriver<F>
where
    F: FnMut(&ConnectionString) -> Box<dyn Protocol> + Send,
{
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn create_connection(&mut self, target: &ConnectionString) -> Result<Session, DriverError> {
        let port = target.port().unwrap_or(self.default_port);
        let peer = peer_addr(target.host(), port)?;
        let transport = TcpTransport::connect(peer);
        let protocol = (self.factory)(target);
        Ok(Session::from_boxed(Box::new(transport), protocol))
    }
}

impl<F> fmt::Debug for StreamDriver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDriver")
            .field("scheme", &self.scheme)
            .field("default_port", &self.default_port)
            .finish_non_exhaustive()
    }
}
