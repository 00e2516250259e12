//! Driver and connection management engine for PLC clients.
//!
//! A [`System`] owns a registry of protocol drivers keyed by URI scheme, a
//! generation-checked table of connections, and a cooperative polling loop.
//! Every [`System::tick`] advances each live connection's state machine as
//! far as it can go without blocking, then dispatches the resulting callbacks
//! synchronously.
//!
//! ```text
//! System::new ─> register_driver ─> init ─> connect("s7://10.0.0.5") ─┐
//!                                                                     ↓
//!                                       loop { tick() } ─> callbacks
//!                                                                     ↓
//!                                          shutdown / destroy (graceful)
//! ```
//!
//! # Architecture
//!
//! - [`Connection`] is sans-IO in the sense that matters: it only talks to a
//!   non-blocking [`Transport`] and a [`Protocol`] state machine, and takes
//!   time as a parameter.
//! - [`Environment`] supplies the clock, so timeouts run on virtual time in
//!   simulation.
//! - Callers hold [`ConnectionHandle`]s and [`DriverHandle`]s only. Handles
//!   of destroyed objects, or of another System, never resolve.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod callbacks;
pub mod connection;
pub mod driver;
pub mod env;
pub mod error;
pub mod handle;
pub mod registry;
pub mod system;
#[cfg(feature = "tcp")]
pub mod tcp;
pub mod transport;
pub mod uri;

pub use callbacks::SystemEvent;
pub use connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};
pub use driver::{Driver, Protocol, Session};
pub use env::{Environment, SystemEnv};
pub use error::{
    DriverError, ErrorCode, ProtocolError, SystemError, TransportError, UriError,
};
pub use handle::{ConnectionHandle, DriverHandle, SystemId};
pub use registry::DriverStatus;
pub use system::{System, SystemConfig, SystemContext};
#[cfg(feature = "tcp")]
pub use tcp::{StreamDriver, TcpTransport};
pub use transport::Transport;
pub use uri::ConnectionString;
