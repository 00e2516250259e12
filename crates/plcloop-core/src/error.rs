//! Error types for the plcloop engine.
//!
//! Every layer has its own strongly-typed error: transports, protocol
//! decoders, drivers, connection strings and the System itself. Each of them
//! maps onto the closed [`ErrorCode`] taxonomy through `code()`, which is what
//! callbacks report and what a C-style host surface would hand out.
//!
//! Nothing in the engine panics on bad input; every fallible operation
//! returns one of these errors.

use std::{fmt, io};

use thiserror::Error;

use crate::{connection::ConnectionState, handle::ConnectionHandle};

/// Closed error taxonomy shared by every fallible operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error.
    Ok,
    /// Failure that fits no other category (protocol faults, aborted
    /// teardown).
    UnknownError,
    /// Allocation failed or a configured capacity was exhausted.
    NoMemory,
    /// Connection string is malformed or names an unknown scheme.
    InvalidConnectionString,
    /// Remote device could not be reached or dropped the connection.
    NotReachable,
    /// Operating system refused access to the device or port.
    PermissionDenied,
    /// Engine invariant violated or API misuse (stale handle, bad state).
    InternalError,
}

impl ErrorCode {
    /// Human readable description of the code.
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "no error",
            Self::UnknownError => "unknown error",
            Self::NoMemory => "out of memory",
            Self::InvalidConnectionString => "invalid connection string",
            Self::NotReachable => "device not reachable",
            Self::PermissionDenied => "permission denied",
            Self::InternalError => "internal error",
        }
    }

    /// Returns true for [`ErrorCode::Ok`].
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for ErrorCode {}

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer refused, reset or could not be routed to.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// OS denied access to the socket or device.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation on a transport that is already closed.
    #[error("transport closed")]
    Closed,

    /// Any other I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unreachable(_) | Self::Closed => ErrorCode::NotReachable,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::Io(_) => ErrorCode::UnknownError,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe => Self::Unreachable(err.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Errors raised by a protocol decoder while a connection is live.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Inbound bytes do not form a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame is valid but not acceptable in the current protocol state.
    #[error("unexpected frame: {0}")]
    Unexpected(String),

    /// Peer signalled an unrecoverable protocol-level error.
    #[error("peer aborted: {0}")]
    PeerAbort(String),

    /// Undecoded inbound bytes exceeded the configured limit.
    #[error("inbound buffer overflow: {buffered} bytes buffered, limit {limit}")]
    InboundOverflow {
        /// Bytes left undecoded.
        buffered: usize,
        /// Configured `max_inbound`.
        limit: usize,
    },
}

impl ProtocolError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::UnknownError
    }
}

/// Errors raised by a [`Driver`](crate::driver::Driver).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Target host/options are not usable by this driver.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Driver could not be loaded (missing device, library, permission).
    #[error("load failed: {0}")]
    Load(String),

    /// Transport setup failed while creating the session.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DriverError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidTarget(_) => ErrorCode::InvalidConnectionString,
            Self::Load(_) => ErrorCode::UnknownError,
            Self::Transport(err) => err.code(),
        }
    }
}

/// Connection string parse failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    /// No `://` separator.
    #[error("missing '://' after scheme")]
    MissingSeparator,

    /// Scheme is empty or contains invalid characters.
    #[error("invalid scheme '{0}'")]
    InvalidScheme(String),

    /// Host part is empty.
    #[error("missing host")]
    MissingHost,

    /// Host contains characters that are never valid in a host.
    #[error("invalid host '{0}'")]
    InvalidHost(String),

    /// Port is not a number in `0..=65535`.
    #[error("invalid port '{0}'")]
    InvalidPort(String),

    /// An option has an empty key.
    #[error("invalid option '{0}'")]
    InvalidOption(String),
}

/// Errors returned by synchronous [`System`](crate::system::System)
/// operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SystemError {
    /// Allocation for the named structure failed.
    #[error("out of memory while allocating {0}")]
    NoMemory(&'static str),

    /// Configured connection limit reached.
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    /// Connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(#[from] UriError),

    /// No loaded driver serves this scheme.
    #[error("no driver loaded for scheme '{0}'")]
    UnknownScheme(String),

    /// A driver for this scheme is already registered.
    #[error("scheme '{0}' is already registered")]
    DuplicateScheme(String),

    /// Handle is stale (destroyed) or belongs to another System.
    #[error("stale or foreign handle {0}")]
    StaleHandle(String),

    /// Operation not valid in the connection's current state.
    #[error("cannot {operation} connection {handle} in state {state:?}")]
    InvalidState {
        /// Connection the operation targeted
        handle: ConnectionHandle,
        /// State when the operation was attempted
        state: ConnectionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// System is draining connections and refuses new ones.
    #[error("system is shutting down")]
    ShuttingDown,

    /// Live connection list and handle table disagree.
    #[error("handle table corrupted: {0}")]
    TableCorrupted(String),

    /// Driver rejected the request.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

impl SystemError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoMemory(_) | Self::ConnectionLimit(_) => ErrorCode::NoMemory,
            Self::InvalidConnectionString(_) | Self::UnknownScheme(_) => {
                ErrorCode::InvalidConnectionString
            },
            Self::DuplicateScheme(_)
            | Self::StaleHandle(_)
            | Self::InvalidState { .. }
            | Self::ShuttingDown
            | Self::TableCorrupted(_) => ErrorCode::InternalError,
            Self::Driver(err) => err.code(),
        }
    }
}
