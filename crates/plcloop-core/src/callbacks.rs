//! Per-System observer slots.
//!
//! Each [`System`](crate::system::System) has seven optional callbacks, one
//! per [`SystemEvent`] kind. Dispatch is synchronous, on the thread that
//! drove the System, and in the order events occur. Every callback receives a
//! [`SystemContext`] so it can connect, disconnect or inspect from inside the
//! notification.

use tracing::debug;

use crate::{
    env::Environment,
    error::ErrorCode,
    handle::{ConnectionHandle, DriverHandle},
    system::{Core, SystemContext},
};

/// Driver finished loading.
pub type DriverLoadedCallback<E> = Box<dyn FnMut(&mut SystemContext<'_, E>, DriverHandle) + Send>;

/// Driver failed to load. Receives the driver scheme and the failure code.
pub type DriverLoadErrorCallback<E> =
    Box<dyn FnMut(&mut SystemContext<'_, E>, &str, ErrorCode) + Send>;

/// Connection reached `Connected`.
pub type ConnectionCallback<E> =
    Box<dyn FnMut(&mut SystemContext<'_, E>, ConnectionHandle) + Send>;

/// Dial failed. Receives the connection string and the failure code.
pub type ConnectionErrorCallback<E> =
    Box<dyn FnMut(&mut SystemContext<'_, E>, ConnectionHandle, &str, ErrorCode) + Send>;

/// Graceful disconnect completed.
pub type DisconnectionCallback<E> =
    Box<dyn FnMut(&mut SystemContext<'_, E>, ConnectionHandle) + Send>;

/// Graceful disconnect failed.
pub type DisconnectionErrorCallback<E> =
    Box<dyn FnMut(&mut SystemContext<'_, E>, ConnectionHandle, ErrorCode) + Send>;

/// Live connection faulted during a tick.
pub type LoopErrorCallback<E> =
    Box<dyn FnMut(&mut SystemContext<'_, E>, DriverHandle, ConnectionHandle, ErrorCode) + Send>;

/// Notification produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// Driver loaded.
    DriverLoaded(DriverHandle),
    /// Driver failed to load, or an enabled scheme has no driver.
    DriverLoadError {
        /// Scheme of the driver
        name: String,
        /// Failure code
        code: ErrorCode,
    },
    /// Connection established.
    Connected(ConnectionHandle),
    /// Dial failed.
    ConnectionError {
        /// Failed connection
        connection: ConnectionHandle,
        /// Connection string as given to `connect`, normalised
        target: String,
        /// Failure code
        code: ErrorCode,
    },
    /// Connection closed gracefully.
    Disconnected(ConnectionHandle),
    /// Graceful close failed.
    DisconnectionError {
        /// Connection being closed
        connection: ConnectionHandle,
        /// Failure code
        code: ErrorCode,
    },
    /// Live connection faulted.
    LoopError {
        /// Driver of the faulted connection
        driver: DriverHandle,
        /// Faulted connection
        connection: ConnectionHandle,
        /// Failure code
        code: ErrorCode,
    },
}

pub(crate) struct Callbacks<E: Environment> {
    pub(crate) driver_loaded: Option<DriverLoadedCallback<E>>,
    pub(crate) driver_load_error: Option<DriverLoadErrorCallback<E>>,
    pub(crate) connection: Option<ConnectionCallback<E>>,
    pub(crate) connection_error: Option<ConnectionErrorCallback<E>>,
    pub(crate) disconnection: Option<DisconnectionCallback<E>>,
    pub(crate) disconnection_error: Option<DisconnectionErrorCallback<E>>,
    pub(crate) loop_error: Option<LoopErrorCallback<E>>,
}

impl<E: Environment> Default for Callbacks<E> {
    fn default() -> Self {
        Self {
            driver_loaded: None,
            driver_load_error: None,
            connection: None,
            connection_error: None,
            disconnection: None,
            disconnection_error: None,
            loop_error: None,
        }
    }
}

impl<E: Environment> Callbacks<E> {
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    /// Deliver one event to its slot. Unset slots drop the event.
    pub(crate) fn dispatch(&mut self, core: &mut Core<E>, event: SystemEvent) {
        debug!(system = %core.id(), ?event, "dispatch");
        let mut ctx = SystemContext::new(core);

        match event {
            SystemEvent::DriverLoaded(driver) => {
                if let Some(cb) = self.driver_loaded.as_mut() {
                    cb(&mut ctx, driver);
                }
            },
            SystemEvent::DriverLoadError { name, code } => {
                if let Some(cb) = self.driver_load_error.as_mut() {
                    cb(&mut ctx, &name, code);
                }
            },
            SystemEvent::Connected(connection) => {
                if let Some(cb) = self.connection.as_mut() {
                    cb(&mut ctx, connection);
                }
            },
            SystemEvent::ConnectionError { connection, target, code } => {
                if let Some(cb) = self.connection_error.as_mut() {
                    cb(&mut ctx, connection, &target, code);
                }
            },
            SystemEvent::Disconnected(connection) => {
                if let Some(cb) = self.disconnection.as_mut() {
                    cb(&mut ctx, connection);
                }
            },
            SystemEvent::DisconnectionError { connection, code } => {
                if let Some(cb) = self.disconnection_error.as_mut() {
                    cb(&mut ctx, connection, code);
                }
            },
            SystemEvent::LoopError { driver, connection, code } => {
                if let Some(cb) = self.loop_error.as_mut() {
                    cb(&mut ctx, driver, connection, code);
                }
            },
        }
    }
}

impl<E: Environment> std::fmt::Debug for Callbacks<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("driver_loaded", &self.driver_loaded.is_some())
            .field("driver_load_error", &self.driver_load_error.is_some())
            .field("connection", &self.connection.is_some())
            .field("connection_error", &self.connection_error.is_some())
            .field("disconnection", &self.disconnection.is_some())
            .field("disconnection_error", &self.disconnection_error.is_some())
            .field("loop_error", &self.loop_error.is_some())
            .finish()
    }
}
