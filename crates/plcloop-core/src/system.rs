//! The System: driver registry, connection table and central loop.
//!
//! A [`System`] owns everything: registered drivers, live connections and
//! callbacks. Callers only ever hold [`ConnectionHandle`]s and
//! [`DriverHandle`]s. All progress happens inside [`System::tick`], which
//! advances every live connection once without blocking and dispatches the
//! resulting callbacks before returning.
//!
//! ```text
//!   connect(uri) ─┐
//!                 ↓
//!   ┌────────┐  resolve   ┌──────────┐  create_connection  ┌────────────┐
//!   │ System │───────────>│ Registry │────────────────────>│ Connection │
//!   └────────┘            └──────────┘                     └────────────┘
//!        │ tick(): advance each live connection once, dispatch events
//!        ↓
//!   ┌───────────┐
//!   │ Callbacks │  (may re-enter through SystemContext)
//!   └───────────┘
//! ```

use std::mem;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    callbacks::{Callbacks, SystemEvent},
    connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState},
    driver::{Driver, Session},
    env::{Environment, SystemEnv},
    error::{DriverError, ErrorCode, SystemError},
    handle::{ConnectionHandle, DriverHandle, HandleTable, RawHandle, SystemId},
    registry::{DriverRegistry, DriverStatus},
    uri::ConnectionString,
};

/// Default upper bound on simultaneously live connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default number of ticks `shutdown` waits before aborting stragglers.
pub const DEFAULT_SHUTDOWN_TICK_LIMIT: usize = 64;

/// System configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Schemes enabled by [`System::init`]. `None` enables every registered
    /// driver.
    pub drivers: Option<Vec<String>>,
    /// Upper bound on live (not yet destroyed) connections.
    pub max_connections: usize,
    /// Ticks `shutdown` spends draining before aborting what is left.
    pub shutdown_tick_limit: usize,
    /// Settings applied to every new connection.
    pub connection: ConnectionConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            drivers: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shutdown_tick_limit: DEFAULT_SHUTDOWN_TICK_LIMIT,
            connection: ConnectionConfig::default(),
        }
    }
}

impl SystemConfig {
    fn enables(&self, scheme: &str) -> bool {
        match &self.drivers {
            None => true,
            Some(list) => list.iter().any(|s| s.eq_ignore_ascii_case(scheme)),
        }
    }
}

/// Everything the System owns except its callbacks.
///
/// Split out so callbacks can borrow it mutably (through [`SystemContext`])
/// while the callback slot itself is borrowed.
///
/// # Invariants
///
/// - `order` lists exactly the live handles of `connections`, in insertion
///   order.
pub(crate) struct Core<E: Environment> {
    id: SystemId,
    env: E,
    config: SystemConfig,
    registry: DriverRegistry,
    connections: HandleTable<Connection<E::Instant>>,
    order: Vec<RawHandle>,
    /// Reused per-tick copy of `order`.
    snapshot: Vec<RawHandle>,
    initialized: bool,
    shutting_down: bool,
}

impl<E: Environment> Core<E> {
    fn new(env: E, config: SystemConfig) -> Result<Self, SystemError> {
        let id = SystemId::next();
        let capacity = config.max_connections.min(64);
        let mut order = Vec::new();
        order.try_reserve(capacity).map_err(|_| SystemError::NoMemory("connection order"))?;

        Ok(Self {
            id,
            env,
            registry: DriverRegistry::new(id)?,
            connections: HandleTable::with_capacity(id, capacity)?,
            order,
            snapshot: Vec::new(),
            config,
            initialized: false,
            shutting_down: false,
        })
    }

    pub(crate) fn id(&self) -> SystemId {
        self.id
    }

    fn connection(&self, handle: ConnectionHandle) -> Result<&Connection<E::Instant>, SystemError> {
        self.connections.get(handle.raw()).ok_or_else(|| SystemError::StaleHandle(handle.to_string()))
    }

    fn connection_mut(
        &mut self,
        handle: ConnectionHandle,
    ) -> Result<&mut Connection<E::Instant>, SystemError> {
        self.connections
            .get_mut(handle.raw())
            .ok_or_else(|| SystemError::StaleHandle(handle.to_string()))
    }

    fn connect(&mut self, uri: &str) -> Result<ConnectionHandle, SystemError> {
        if self.shutting_down {
            return Err(SystemError::ShuttingDown);
        }

        let target = ConnectionString::parse(uri)?;
        let driver = self
            .registry
            .resolve(target.scheme())
            .ok_or_else(|| SystemError::UnknownScheme(target.scheme().to_string()))?;

        if self.connections.len() >= self.config.max_connections {
            return Err(SystemError::ConnectionLimit(self.config.max_connections));
        }
        self.order.try_reserve(1).map_err(|_| SystemError::NoMemory("connection order"))?;

        let session = match self.registry.create_session(driver, &target) {
            Ok(session) => session,
            // Reported through the connection-error callback on the next tick.
            Err(SystemError::Driver(DriverError::Transport(err))) => {
                debug!(system = %self.id, uri, error = %err, "transport setup failed");
                Session::failed(err)
            },
            Err(err) => return Err(err),
        };
        let connection =
            Connection::new(driver, target, session, self.env.now(), self.config.connection.clone());
        let raw = self.connections.insert(connection)?;
        self.order.push(raw);

        let handle = ConnectionHandle::from_raw(raw);
        debug!(system = %self.id, %handle, %driver, uri, "connection created");
        Ok(handle)
    }

    fn disconnect(&mut self, handle: ConnectionHandle) -> Result<(), SystemError> {
        let now = self.env.now();
        let connection = self.connection_mut(handle)?;
        connection.request_disconnect(now).map_err(|state| SystemError::InvalidState {
            handle,
            state,
            operation: "disconnect",
        })?;
        debug!(%handle, "disconnect requested");
        Ok(())
    }

    fn destroy_connection(&mut self, handle: ConnectionHandle) -> Result<(), SystemError> {
        let state = self.connection(handle)?.state();
        if !state.is_terminal() {
            return Err(SystemError::InvalidState { handle, state, operation: "destroy" });
        }

        let raw = handle.raw();
        if let Some(mut connection) = self.connections.remove(raw) {
            connection.abort();
        }
        self.order.retain(|live| *live != raw);
        debug!(%handle, "connection destroyed");
        Ok(())
    }

    fn driver_status(&self, handle: DriverHandle) -> Result<DriverStatus, SystemError> {
        self.registry.status(handle).ok_or_else(|| SystemError::StaleHandle(handle.to_string()))
    }

    fn connections(&self) -> Vec<ConnectionHandle> {
        self.order.iter().copied().map(ConnectionHandle::from_raw).collect()
    }

    /// Check that the live order and the table agree.
    fn validate(&self) -> Result<(), SystemError> {
        if let Some(missing) = self.order.iter().find(|raw| !self.connections.contains(**raw)) {
            let handle = ConnectionHandle::from_raw(*missing);
            return Err(SystemError::TableCorrupted(format!("{handle} listed but not in table")));
        }
        if self.order.len() != self.connections.len() {
            return Err(SystemError::TableCorrupted(format!(
                "{} listed, {} in table",
                self.order.len(),
                self.connections.len()
            )));
        }
        Ok(())
    }

    fn has_active(&self) -> bool {
        self.connections.iter().any(|(_, conn)| !conn.state().is_terminal())
    }

    /// Load `handle` if its scheme is enabled, returning the event to report.
    fn load_driver(&mut self, handle: DriverHandle) -> Option<SystemEvent> {
        let scheme = self.registry.scheme(handle)?.to_string();
        if !self.config.enables(&scheme) {
            debug!(%handle, %scheme, "driver not enabled by configuration");
            return None;
        }
        match self.registry.load(handle)? {
            Ok(()) => Some(SystemEvent::DriverLoaded(handle)),
            Err(err) => Some(SystemEvent::DriverLoadError { name: scheme, code: err.code() }),
        }
    }
}

/// View of a [`System`] handed to callbacks.
///
/// Supports the same connection operations and inspection as the System
/// itself. Connections created here join the live list but are first
/// advanced on the next tick.
pub struct SystemContext<'a, E: Environment> {
    core: &'a mut Core<E>,
}

impl<'a, E: Environment> SystemContext<'a, E> {
    pub(crate) fn new(core: &'a mut Core<E>) -> Self {
        Self { core }
    }

    /// Identity of the System.
    pub fn system_id(&self) -> SystemId {
        self.core.id
    }

    /// See [`System::connect`].
    pub fn connect(&mut self, uri: &str) -> Result<ConnectionHandle, SystemError> {
        self.core.connect(uri)
    }

    /// See [`System::disconnect`].
    pub fn disconnect(&mut self, handle: ConnectionHandle) -> Result<(), SystemError> {
        self.core.disconnect(handle)
    }

    /// See [`System::destroy_connection`].
    pub fn destroy_connection(&mut self, handle: ConnectionHandle) -> Result<(), SystemError> {
        self.core.destroy_connection(handle)
    }

    /// See [`System::connection_state`].
    pub fn connection_state(&self, handle: ConnectionHandle) -> Result<ConnectionState, SystemError> {
        Ok(self.core.connection(handle)?.state())
    }

    /// See [`System::last_error`].
    pub fn last_error(&self, handle: ConnectionHandle) -> Result<Option<ErrorCode>, SystemError> {
        Ok(self.core.connection(handle)?.last_error())
    }

    /// See [`System::connection_string`].
    pub fn connection_string(
        &self,
        handle: ConnectionHandle,
    ) -> Result<&ConnectionString, SystemError> {
        Ok(self.core.connection(handle)?.target())
    }

    /// See [`System::connection_driver`].
    pub fn connection_driver(&self, handle: ConnectionHandle) -> Result<DriverHandle, SystemError> {
        Ok(self.core.connection(handle)?.driver())
    }

    /// See [`System::connections`].
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.core.connections()
    }

    /// See [`System::connection_count`].
    pub fn connection_count(&self) -> usize {
        self.core.connections.len()
    }

    /// See [`System::driver_status`].
    pub fn driver_status(&self, handle: DriverHandle) -> Result<DriverStatus, SystemError> {
        self.core.driver_status(handle)
    }

    /// See [`System::resolve_driver`].
    pub fn resolve_driver(&self, scheme: &str) -> Option<DriverHandle> {
        self.core.registry.resolve(scheme)
    }
}

/// Driver/connection management engine.
///
/// Single-threaded and cooperative. Nothing happens between calls;
/// [`tick`](System::tick) does all the work. `System` is `Send`, so it can be
/// moved to the thread that drives it.
///
/// Dropping a System aborts its connections without callbacks. Use
/// [`destroy`](System::destroy) for a graceful teardown.
pub struct System<E: Environment = SystemEnv> {
    core: Core<E>,
    callbacks: Callbacks<E>,
}

impl System<SystemEnv> {
    /// Create a System on the OS clock with default configuration.
    pub fn new() -> Result<Self, SystemError> {
        Self::with_config(SystemConfig::default())
    }

    /// Create a System on the OS clock.
    pub fn with_config(config: SystemConfig) -> Result<Self, SystemError> {
        Self::with_env(SystemEnv::new(), config)
    }
}

impl<E: Environment> System<E> {
    /// Create a System on a custom environment.
    pub fn with_env(env: E, config: SystemConfig) -> Result<Self, SystemError> {
        let core = Core::new(env, config)?;
        debug!(system = %core.id, "system created");
        Ok(Self { core, callbacks: Callbacks::default() })
    }

    /// Identity of this System.
    pub fn id(&self) -> SystemId {
        self.core.id
    }

    /// Active configuration.
    pub fn config(&self) -> &SystemConfig {
        &self.core.config
    }

    /// The System's environment.
    pub fn env(&self) -> &E {
        &self.core.env
    }

    /// Register a driver under its scheme.
    ///
    /// After [`init`](Self::init) the driver is loaded immediately and the
    /// driver-loaded or driver-load-error callback fires before this returns.
    ///
    /// # Errors
    ///
    /// - `SystemError::DuplicateScheme` if the scheme is already registered.
    pub fn register_driver(
        &mut self,
        driver: impl Driver + 'static,
    ) -> Result<DriverHandle, SystemError> {
        let handle = self.core.registry.register(Box::new(driver))?;
        if self.core.initialized
            && let Some(event) = self.core.load_driver(handle)
        {
            self.callbacks.dispatch(&mut self.core, event);
        }
        Ok(handle)
    }

    /// Load every enabled driver.
    ///
    /// Fires driver-loaded or driver-load-error once per enabled driver, in
    /// registration order. Schemes listed in [`SystemConfig::drivers`] with
    /// no registered driver are reported as load errors. Individual load
    /// failures do not fail `init`. Calling it again is a no-op.
    pub fn init(&mut self) -> Result<(), SystemError> {
        if self.core.initialized {
            return Ok(());
        }
        self.core.initialized = true;

        let mut events = Vec::new();
        for handle in self.core.registry.handles() {
            events.extend(self.core.load_driver(handle));
        }
        if let Some(enabled) = self.core.config.drivers.clone() {
            for scheme in enabled {
                if self.core.registry.lookup(&scheme).is_none() {
                    warn!(%scheme, "enabled scheme has no registered driver");
                    events.push(SystemEvent::DriverLoadError {
                        name: scheme.to_ascii_lowercase(),
                        code: ErrorCode::UnknownError,
                    });
                }
            }
        }

        info!(system = %self.core.id, drivers = self.core.registry.len(), "system initialized");
        for event in events {
            self.callbacks.dispatch(&mut self.core, event);
        }
        Ok(())
    }

    /// Request a connection. Returns as soon as the connection exists; the
    /// dial progresses during later ticks.
    ///
    /// # Errors
    ///
    /// - `SystemError::InvalidConnectionString` if `uri` does not parse
    /// - `SystemError::UnknownScheme` if no loaded driver serves the scheme
    /// - `SystemError::ConnectionLimit` if `max_connections` is reached
    /// - `SystemError::Driver` if the driver rejects the target
    /// - `SystemError::ShuttingDown` during [`shutdown`](Self::shutdown)
    pub fn connect(&mut self, uri: &str) -> Result<ConnectionHandle, SystemError> {
        self.core.connect(uri)
    }

    /// Request a graceful disconnect. Completion is reported by a later tick.
    ///
    /// # Errors
    ///
    /// - `SystemError::StaleHandle` if the handle does not resolve
    /// - `SystemError::InvalidState` if already disconnecting or closed
    pub fn disconnect(&mut self, handle: ConnectionHandle) -> Result<(), SystemError> {
        self.core.disconnect(handle)
    }

    /// Remove a closed or failed connection. Its handle never resolves again.
    ///
    /// # Errors
    ///
    /// - `SystemError::StaleHandle` if the handle does not resolve
    /// - `SystemError::InvalidState` if the connection is not terminal
    pub fn destroy_connection(&mut self, handle: ConnectionHandle) -> Result<(), SystemError> {
        self.core.destroy_connection(handle)
    }

    /// Current state of a connection.
    pub fn connection_state(&self, handle: ConnectionHandle) -> Result<ConnectionState, SystemError> {
        Ok(self.core.connection(handle)?.state())
    }

    /// Failure code of a connection in `Error`, if any.
    pub fn last_error(&self, handle: ConnectionHandle) -> Result<Option<ErrorCode>, SystemError> {
        Ok(self.core.connection(handle)?.last_error())
    }

    /// Parsed connection string of a connection.
    pub fn connection_string(
        &self,
        handle: ConnectionHandle,
    ) -> Result<&ConnectionString, SystemError> {
        Ok(self.core.connection(handle)?.target())
    }

    /// Driver serving a connection.
    pub fn connection_driver(&self, handle: ConnectionHandle) -> Result<DriverHandle, SystemError> {
        Ok(self.core.connection(handle)?.driver())
    }

    /// Live connections in creation order.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.core.connections()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.core.connections.len()
    }

    /// Load status of a registered driver.
    pub fn driver_status(&self, handle: DriverHandle) -> Result<DriverStatus, SystemError> {
        self.core.driver_status(handle)
    }

    /// Loaded driver serving `scheme`.
    pub fn resolve_driver(&self, scheme: &str) -> Option<DriverHandle> {
        self.core.registry.resolve(scheme)
    }

    /// Advance every live connection once and dispatch the resulting
    /// callbacks.
    ///
    /// Per-connection failures are reported through callbacks only.
    /// Connections created by callbacks during this tick are first advanced
    /// on the next one; connections destroyed by callbacks are skipped.
    ///
    /// # Errors
    ///
    /// - `SystemError::TableCorrupted` if the live list and the handle table
    ///   disagree
    pub fn tick(&mut self) -> Result<(), SystemError> {
        self.core.validate()?;
        if self.core.order.is_empty() {
            return Ok(());
        }

        let now = self.core.env.now();
        let mut snapshot = mem::take(&mut self.core.snapshot);
        snapshot.clear();
        snapshot.extend_from_slice(&self.core.order);

        for &raw in &snapshot {
            let Some(connection) = self.core.connections.get_mut(raw) else {
                continue;
            };
            let Some(event) = connection.advance(now) else {
                continue;
            };

            let handle = ConnectionHandle::from_raw(raw);
            let event = match event {
                ConnectionEvent::Connected => SystemEvent::Connected(handle),
                ConnectionEvent::ConnectFailed(code) => SystemEvent::ConnectionError {
                    connection: handle,
                    target: connection.target().to_string(),
                    code,
                },
                ConnectionEvent::Fault(code) => {
                    SystemEvent::LoopError { driver: connection.driver(), connection: handle, code }
                },
                ConnectionEvent::Disconnected => SystemEvent::Disconnected(handle),
                ConnectionEvent::DisconnectFailed(code) => {
                    SystemEvent::DisconnectionError { connection: handle, code }
                },
            };
            self.callbacks.dispatch(&mut self.core, event);
        }

        self.core.snapshot = snapshot;
        Ok(())
    }

    /// Gracefully disconnect every connection that is dialing or connected.
    ///
    /// Ticks until nothing is dialing, connected or draining, for at most
    /// [`SystemConfig::shutdown_tick_limit`] ticks. Connections still active
    /// after that are aborted and reported through the
    /// disconnection-error callback with `UnknownError`. Connections stay
    /// resolvable in a terminal state. New connections are refused while
    /// this runs.
    pub fn shutdown(&mut self) -> Result<(), SystemError> {
        self.core.shutting_down = true;
        let result = self.drain();
        self.core.shutting_down = false;
        result
    }

    fn drain(&mut self) -> Result<(), SystemError> {
        self.core.validate()?;

        let now = self.core.env.now();
        let mut requested = 0usize;
        for raw in self.core.order.clone() {
            if let Some(connection) = self.core.connections.get_mut(raw)
                && matches!(connection.state(), ConnectionState::Connecting | ConnectionState::Connected)
                && connection.request_disconnect(now).is_ok()
            {
                requested += 1;
            }
        }
        info!(system = %self.core.id, requested, "shutting down");

        let limit = self.core.config.shutdown_tick_limit;
        let mut ticks = 0;
        while self.core.has_active() && ticks < limit {
            self.tick()?;
            ticks += 1;
        }

        let stragglers: Vec<RawHandle> = self
            .core
            .connections
            .iter()
            .filter(|(_, conn)| !conn.state().is_terminal())
            .map(|(raw, _)| raw)
            .collect();
        for raw in stragglers {
            let handle = ConnectionHandle::from_raw(raw);
            let aborted =
                self.core.connections.get_mut(raw).is_some_and(|connection| connection.abort());
            if aborted {
                warn!(%handle, ticks, "connection did not close in time, aborted");
                self.callbacks.dispatch(
                    &mut self.core,
                    SystemEvent::DisconnectionError {
                        connection: handle,
                        code: ErrorCode::UnknownError,
                    },
                );
            }
        }
        Ok(())
    }

    /// Shut down gracefully, then release every connection and driver.
    ///
    /// Callbacks fire for the graceful part exactly as in
    /// [`shutdown`](Self::shutdown).
    pub fn destroy(mut self) -> Result<(), SystemError> {
        let result = self.shutdown();
        self.release();
        debug!(system = %self.core.id, "system destroyed");
        result
    }

    fn release(&mut self) {
        for mut connection in self.core.connections.drain() {
            connection.abort();
        }
        self.core.order.clear();
    }

    /// Set the driver-loaded callback, replacing any previous one.
    pub fn set_on_driver_loaded<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SystemContext<'_, E>, DriverHandle) + Send + 'static,
    {
        self.callbacks.driver_loaded = Some(Box::new(callback));
    }

    /// Set the driver-load-error callback, replacing any previous one.
    pub fn set_on_driver_load_error<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SystemContext<'_, E>, &str, ErrorCode) + Send + 'static,
    {
        self.callbacks.driver_load_error = Some(Box::new(callback));
    }

    /// Set the on-connection callback, replacing any previous one.
    pub fn set_on_connection<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SystemContext<'_, E>, ConnectionHandle) + Send + 'static,
    {
        self.callbacks.connection = Some(Box::new(callback));
    }

    /// Set the connection-error callback, replacing any previous one.
    pub fn set_on_connection_error<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SystemContext<'_, E>, ConnectionHandle, &str, ErrorCode) + Send + 'static,
    {
        self.callbacks.connection_error = Some(Box::new(callback));
    }

    /// Set the on-disconnection callback, replacing any previous one.
    pub fn set_on_disconnection<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SystemContext<'_, E>, ConnectionHandle) + Send + 'static,
    {
        self.callbacks.disconnection = Some(Box::new(callback));
    }

    /// Set the disconnection-error callback, replacing any previous one.
    pub fn set_on_disconnection_error<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SystemContext<'_, E>, ConnectionHandle, ErrorCode) + Send + 'static,
    {
        self.callbacks.disconnection_error = Some(Box::new(callback));
    }

    /// Set the loop-error callback, replacing any previous one.
    pub fn set_on_loop_error<F>(&mut self, callback: F)
    where
        F: FnMut(&mut SystemContext<'_, E>, DriverHandle, ConnectionHandle, ErrorCode)
            + Send
            + 'static,
    {
        self.callbacks.loop_error = Some(Box::new(callback));
    }

    /// Remove every callback.
    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    #[cfg(test)]
    pub(crate) fn corrupt_order_for_test(&mut self, raw: RawHandle) {
        self.core.order.push(raw);
    }
}

impl<E: Environment> Drop for System<E> {
    fn drop(&mut self) {
        if !self.core.connections.is_empty() {
            debug!(
                system = %self.core.id,
                connections = self.core.connections.len(),
                "system dropped with live connections, aborting"
            );
        }
        self.release();
    }
}

impl<E: Environment> std::fmt::Debug for System<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("id", &self.core.id)
            .field("registry", &self.core.registry)
            .field("connections", &self.core.connections.len())
            .field("initialized", &self.core.initialized)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
