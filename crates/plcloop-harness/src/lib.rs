//! Deterministic simulation harness for the plcloop engine.
//!
//! Virtual-time [`SimEnv`], scripted [`SimTransport`]s and a [`MockDriver`]
//! let tests run a real [`System`](plcloop_core::System) through dial
//! failures, timeouts, partial writes and peer resets without touching the
//! network.
//!
//! # Invariant Testing
//!
//! [`CallbackRecorder`] logs every callback. [`SystemSnapshot`] pairs that
//! log with the live connection states, and [`InvariantRegistry::standard()`]
//! checks lifecycle properties against it (exactly one on-disconnection per
//! closed connection, ordered callbacks, stale destroyed handles).
//!
//! # Model-Based Testing
//!
//! The `model` module turns generated [`Operation`] sequences into calls on
//! a [`World`] and tracks which handles should be live.
//!
//! # Chaos
//!
//! [`ChaoticTransport`] wraps any transport and injects seeded faults.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod chaotic;
pub mod invariants;
pub mod mock_driver;
pub mod model;
pub mod recorder;
pub mod sim_env;
pub mod sim_transport;

pub use chaotic::ChaoticTransport;
pub use invariants::{
    ConnectionSnapshot, DestroyedHandlesStale, DisconnectExactlyOnce, ErrorStateHasCode,
    Invariant, InvariantRegistry, InvariantResult, OrderedLifecycle, SilentAfterClose,
    SingleDialOutcome, SystemSnapshot, TransportContract, Violation,
};
pub use mock_driver::{GOODBYE, HANDSHAKE, MockConnection, MockDriver, MockProbe, MockProtocol};
pub use model::{Operation, Slot, Target, World, scripted_driver};
pub use recorder::{CallbackRecorder, event_connection};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_transport::{DialPlan, Inbound, SimTransport, SimTransportHandle, TransportScript};
