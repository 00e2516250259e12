//! Standard invariant checks.
//!
//! Each check is a lifecycle property that must hold for every connection
//! after any sequence of operations.

use std::collections::HashMap;

use plcloop_core::{ConnectionHandle, ConnectionState, ErrorCode, SystemEvent};

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};
use crate::recorder::event_connection;

fn per_connection(state: &SystemSnapshot) -> HashMap<ConnectionHandle, Vec<&SystemEvent>> {
    let mut map: HashMap<ConnectionHandle, Vec<&SystemEvent>> = HashMap::new();
    for event in &state.events {
        if let Some(handle) = event_connection(event) {
            map.entry(handle).or_default().push(event);
        }
    }
    map
}

fn is_disconnected(event: &SystemEvent) -> bool {
    matches!(event, SystemEvent::Disconnected(_))
}

fn is_failure(event: &SystemEvent) -> bool {
    matches!(
        event,
        SystemEvent::ConnectionError { .. }
            | SystemEvent::LoopError { .. }
            | SystemEvent::DisconnectionError { .. }
    )
}

/// On-disconnection fires at most once per connection, and exactly once for
/// a connection in `Closed`.
pub struct DisconnectExactlyOnce;

impl Invariant for DisconnectExactlyOnce {
    fn name(&self) -> &'static str {
        "disconnect_exactly_once"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        let events = per_connection(state);
        for (handle, log) in &events {
            let count = log.iter().filter(|e| is_disconnected(e)).count();
            if count > 1 {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{handle}: on-disconnection fired {count} times"),
                });
            }
        }
        for conn in &state.connections {
            if conn.state != ConnectionState::Closed {
                continue;
            }
            let fired = events
                .get(&conn.handle)
                .is_some_and(|log| log.iter().any(|e| is_disconnected(e)));
            if !fired {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{}: closed without on-disconnection", conn.handle),
                });
            }
        }
        Ok(())
    }
}

/// Nothing is reported for a connection after its on-disconnection.
pub struct SilentAfterClose;

impl Invariant for SilentAfterClose {
    fn name(&self) -> &'static str {
        "silent_after_close"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (handle, log) in per_connection(state) {
            if let Some(pos) = log.iter().position(|e| is_disconnected(e))
                && let Some(late) = log.get(pos + 1)
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{handle}: {late:?} after on-disconnection"),
                });
            }
        }
        Ok(())
    }
}

/// A dial resolves at most once: on-connection or connection-error, never
/// both, never twice.
pub struct SingleDialOutcome;

impl Invariant for SingleDialOutcome {
    fn name(&self) -> &'static str {
        "single_dial_outcome"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (handle, log) in per_connection(state) {
            let outcomes = log
                .iter()
                .filter(|e| {
                    matches!(e, SystemEvent::Connected(_) | SystemEvent::ConnectionError { .. })
                })
                .count();
            if outcomes > 1 {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{handle}: {outcomes} dial outcomes reported"),
                });
            }
        }
        Ok(())
    }
}

/// Callbacks follow the state machine: a loop error needs a prior
/// on-connection, and after any failure only disconnection outcomes follow.
pub struct OrderedLifecycle;

impl Invariant for OrderedLifecycle {
    fn name(&self) -> &'static str {
        "ordered_lifecycle"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (handle, log) in per_connection(state) {
            let mut connected = false;
            let mut failed = false;
            for event in log {
                let ok = match event {
                    SystemEvent::Connected(_) => !failed,
                    SystemEvent::LoopError { .. } => connected && !failed,
                    SystemEvent::ConnectionError { .. } => !connected && !failed,
                    SystemEvent::Disconnected(_)
                    | SystemEvent::DisconnectionError { .. }
                    | SystemEvent::DriverLoaded(_)
                    | SystemEvent::DriverLoadError { .. } => true,
                };
                if !ok {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("{handle}: {event:?} out of order"),
                    });
                }
                connected |= matches!(event, SystemEvent::Connected(_));
                failed |= is_failure(event);
            }
        }
        Ok(())
    }
}

/// A connection in `Error` carries a failure code.
pub struct ErrorStateHasCode;

impl Invariant for ErrorStateHasCode {
    fn name(&self) -> &'static str {
        "error_state_has_code"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for conn in &state.connections {
            if conn.state == ConnectionState::Error
                && matches!(conn.last_error, None | Some(ErrorCode::Ok))
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{}: in Error with code {:?}", conn.handle, conn.last_error),
                });
            }
        }
        Ok(())
    }
}

/// Destroyed handles never resolve again.
pub struct DestroyedHandlesStale;

impl Invariant for DestroyedHandlesStale {
    fn name(&self) -> &'static str {
        "destroyed_handles_stale"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        if let Some(handle) = state.stale_resolutions.first() {
            return Err(Violation {
                invariant: self.name(),
                message: format!("{handle} resolves after destroy_connection"),
            });
        }
        if let Some(conn) = state.connections.iter().find(|c| state.destroyed.contains(&c.handle))
        {
            return Err(Violation {
                invariant: self.name(),
                message: format!("{} still listed after destroy_connection", conn.handle),
            });
        }
        Ok(())
    }
}

/// The engine never uses a transport outside its contract.
pub struct TransportContract;

impl Invariant for TransportContract {
    fn name(&self) -> &'static str {
        "transport_contract"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        if state.transport_misuse.is_empty() {
            return Ok(());
        }
        Err(Violation {
            invariant: self.name(),
            message: state.transport_misuse.join("; "),
        })
    }
}
