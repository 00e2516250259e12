//! Records every callback a [`System`] fires.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use plcloop_core::{ConnectionHandle, Environment, System, SystemEvent};

/// Shared log of [`SystemEvent`]s, in dispatch order.
#[derive(Debug, Clone, Default)]
pub struct CallbackRecorder {
    events: Arc<Mutex<Vec<SystemEvent>>>,
}

impl CallbackRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SystemEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: SystemEvent) {
        self.lock().push(event);
    }

    /// Install all seven callbacks on `system`, replacing existing ones.
    pub fn install<E: Environment>(&self, system: &mut System<E>) {
        let rec = self.clone();
        system.set_on_driver_loaded(move |_, driver| rec.push(SystemEvent::DriverLoaded(driver)));

        let rec = self.clone();
        system.set_on_driver_load_error(move |_, name, code| {
            rec.push(SystemEvent::DriverLoadError { name: name.to_string(), code });
        });

        let rec = self.clone();
        system.set_on_connection(move |_, connection| rec.push(SystemEvent::Connected(connection)));

        let rec = self.clone();
        system.set_on_connection_error(move |_, connection, target, code| {
            rec.push(SystemEvent::ConnectionError { connection, target: target.to_string(), code });
        });

        let rec = self.clone();
        system.set_on_disconnection(move |_, connection| {
            rec.push(SystemEvent::Disconnected(connection));
        });

        let rec = self.clone();
        system.set_on_disconnection_error(move |_, connection, code| {
            rec.push(SystemEvent::DisconnectionError { connection, code });
        });

        let rec = self.clone();
        system.set_on_loop_error(move |_, driver, connection, code| {
            rec.push(SystemEvent::LoopError { driver, connection, code });
        });
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<SystemEvent> {
        self.lock().clone()
    }

    /// Drain the log.
    pub fn take(&self) -> Vec<SystemEvent> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&SystemEvent) -> bool) -> usize {
        self.lock().iter().filter(|e| pred(e)).count()
    }

    /// Number of on-connection callbacks.
    pub fn connected(&self) -> usize {
        self.count(|e| matches!(e, SystemEvent::Connected(_)))
    }

    /// Number of connection-error callbacks.
    pub fn connection_errors(&self) -> usize {
        self.count(|e| matches!(e, SystemEvent::ConnectionError { .. }))
    }

    /// Number of on-disconnection callbacks.
    pub fn disconnected(&self) -> usize {
        self.count(|e| matches!(e, SystemEvent::Disconnected(_)))
    }

    /// Number of disconnection-error callbacks.
    pub fn disconnection_errors(&self) -> usize {
        self.count(|e| matches!(e, SystemEvent::DisconnectionError { .. }))
    }

    /// Number of loop-error callbacks.
    pub fn loop_errors(&self) -> usize {
        self.count(|e| matches!(e, SystemEvent::LoopError { .. }))
    }

    /// Events concerning one connection, in order.
    pub fn for_connection(&self, handle: ConnectionHandle) -> Vec<SystemEvent> {
        self.lock().iter().filter(|e| event_connection(e) == Some(handle)).cloned().collect()
    }
}

/// Connection an event refers to, if any.
pub fn event_connection(event: &SystemEvent) -> Option<ConnectionHandle> {
    match event {
        SystemEvent::Connected(h) | SystemEvent::Disconnected(h) => Some(*h),
        SystemEvent::ConnectionError { connection, .. }
        | SystemEvent::DisconnectionError { connection, .. }
        | SystemEvent::LoopError { connection, .. } => Some(*connection),
        SystemEvent::DriverLoaded(_) | SystemEvent::DriverLoadError { .. } => None,
    }
}
