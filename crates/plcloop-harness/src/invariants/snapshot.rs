//! Observable state snapshots for invariant checking.
//!
//! Invariants operate on a snapshot rather than on a live [`System`], so one
//! check sees a consistent view: the callback log, every live connection's
//! state, and what the test did to the handle table.

use plcloop_core::{ConnectionHandle, ConnectionState, Environment, ErrorCode, System, SystemEvent};

use crate::recorder::CallbackRecorder;

/// Snapshot of a System and of the callbacks it fired.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Every callback fired so far, in dispatch order.
    pub events: Vec<SystemEvent>,
    /// Live connections.
    pub connections: Vec<ConnectionSnapshot>,
    /// Handles the test destroyed.
    pub destroyed: Vec<ConnectionHandle>,
    /// Destroyed handles that still resolved when the snapshot was taken.
    pub stale_resolutions: Vec<ConnectionHandle>,
    /// Transport contract violations reported by simulated transports.
    pub transport_misuse: Vec<String>,
}

/// One live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Connection handle.
    pub handle: ConnectionHandle,
    /// State at snapshot time.
    pub state: ConnectionState,
    /// Last failure code.
    pub last_error: Option<ErrorCode>,
}

impl SystemSnapshot {
    /// Snapshot with nothing in it.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture `system` and the events `recorder` has seen.
    ///
    /// `destroyed` lists handles the caller destroyed; each is probed to
    /// confirm it no longer resolves.
    pub fn capture<E: Environment>(
        system: &System<E>,
        recorder: &CallbackRecorder,
        destroyed: &[ConnectionHandle],
        transport_misuse: Vec<String>,
    ) -> Self {
        let connections = system
            .connections()
            .into_iter()
            .filter_map(|handle| {
                let state = system.connection_state(handle).ok()?;
                let last_error = system.last_error(handle).ok()?;
                Some(ConnectionSnapshot { handle, state, last_error })
            })
            .collect();

        let stale_resolutions =
            destroyed.iter().copied().filter(|&h| system.connection_state(h).is_ok()).collect();

        Self {
            events: recorder.events(),
            connections,
            destroyed: destroyed.to_vec(),
            stale_resolutions,
            transport_misuse,
        }
    }

    /// Snapshot of one connection, if it is live.
    pub fn connection(&self, handle: ConnectionHandle) -> Option<&ConnectionSnapshot> {
        self.connections.iter().find(|c| c.handle == handle)
    }
}
