//! Driver registry.
//!
//! Maps URI schemes to registered drivers. Lookups used by `connect` only see
//! drivers that loaded successfully. The registry holds no connection state.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::{
    driver::{Driver, Session},
    error::{DriverError, ErrorCode, SystemError},
    handle::{DriverHandle, HandleTable, RawHandle, SystemId},
    uri::ConnectionString,
};

/// Load status of a registered driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// Registered but not loaded yet.
    Registered,
    /// Loaded; serves `connect` requests.
    Loaded,
    /// `load()` failed with this code. Never serves `connect`.
    Failed(ErrorCode),
}

struct RegisteredDriver {
    scheme: String,
    status: DriverStatus,
    driver: Box<dyn Driver>,
}

/// Scheme → driver table.
///
/// # Invariants
///
/// - Every scheme appears at most once.
/// - `by_scheme` and `order` reference exactly the entries of `drivers`.
pub(crate) struct DriverRegistry {
    drivers: HandleTable<RegisteredDriver>,
    by_scheme: HashMap<String, RawHandle>,
    order: Vec<RawHandle>,
}

impl DriverRegistry {
    pub(crate) fn new(system: SystemId) -> Result<Self, SystemError> {
        Ok(Self {
            drivers: HandleTable::with_capacity(system, 4)?,
            by_scheme: HashMap::new(),
            order: Vec::new(),
        })
    }

    /// Register a driver under its scheme.
    ///
    /// # Errors
    ///
    /// - `SystemError::DuplicateScheme` if the scheme is taken. The existing
    ///   registration is left untouched.
    pub(crate) fn register(&mut self, driver: Box<dyn Driver>) -> Result<DriverHandle, SystemError> {
        let scheme = driver.scheme().to_ascii_lowercase();
        if self.by_scheme.contains_key(&scheme) {
            warn!(%scheme, "driver already registered for scheme");
            return Err(SystemError::DuplicateScheme(scheme));
        }

        self.by_scheme.try_reserve(1).map_err(|_| SystemError::NoMemory("driver index"))?;
        self.order.try_reserve(1).map_err(|_| SystemError::NoMemory("driver order"))?;

        let raw = self.drivers.insert(RegisteredDriver {
            scheme: scheme.clone(),
            status: DriverStatus::Registered,
            driver,
        })?;
        self.by_scheme.insert(scheme.clone(), raw);
        self.order.push(raw);

        let handle = DriverHandle::from_raw(raw);
        debug!(%handle, %scheme, "driver registered");
        Ok(handle)
    }

    /// Loaded driver for `scheme`. `None` if unknown, not loaded or failed.
    pub(crate) fn resolve(&self, scheme: &str) -> Option<DriverHandle> {
        let raw = *self.by_scheme.get(&scheme.to_ascii_lowercase())?;
        let entry = self.drivers.get(raw)?;
        (entry.status == DriverStatus::Loaded).then_some(DriverHandle::from_raw(raw))
    }

    /// Handle registered for `scheme`, whatever its status.
    pub(crate) fn lookup(&self, scheme: &str) -> Option<DriverHandle> {
        self.by_scheme.get(&scheme.to_ascii_lowercase()).copied().map(DriverHandle::from_raw)
    }

    /// Run the driver's `load()` hook if it has not run yet.
    ///
    /// Returns `None` if the driver was already loaded or failed before, so
    /// callers report each load at most once.
    pub(crate) fn load(&mut self, handle: DriverHandle) -> Option<Result<(), DriverError>> {
        let entry = self.drivers.get_mut(handle.raw())?;
        if entry.status != DriverStatus::Registered {
            return None;
        }

        match entry.driver.load() {
            Ok(()) => {
                entry.status = DriverStatus::Loaded;
                info!(%handle, scheme = %entry.scheme, "driver loaded");
                Some(Ok(()))
            },
            Err(err) => {
                entry.status = DriverStatus::Failed(err.code());
                warn!(%handle, scheme = %entry.scheme, error = %err, "driver failed to load");
                Some(Err(err))
            },
        }
    }

    pub(crate) fn status(&self, handle: DriverHandle) -> Option<DriverStatus> {
        self.drivers.get(handle.raw()).map(|entry| entry.status)
    }

    pub(crate) fn scheme(&self, handle: DriverHandle) -> Option<&str> {
        self.drivers.get(handle.raw()).map(|entry| entry.scheme.as_str())
    }

    /// All drivers in registration order.
    pub(crate) fn handles(&self) -> Vec<DriverHandle> {
        self.order.iter().copied().map(DriverHandle::from_raw).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Ask a loaded driver for a new session.
    pub(crate) fn create_session(
        &mut self,
        handle: DriverHandle,
        target: &ConnectionString,
    ) -> Result<Session, SystemError> {
        let entry = self
            .drivers
            .get_mut(handle.raw())
            .ok_or_else(|| SystemError::StaleHandle(handle.to_string()))?;
        if entry.status != DriverStatus::Loaded {
            return Err(SystemError::UnknownScheme(entry.scheme.clone()));
        }
        Ok(entry.driver.create_connection(target)?)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("schemes", &self.by_scheme.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::task::Poll;

    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::{
        driver::Protocol,
        error::{ProtocolError, TransportError},
        transport::Transport,
    };

    struct NullTransport;

    impl Transport for NullTransport {
        fn poll_dial(&mut self) -> Poll<Result<(), TransportError>> {
            Poll::Pending
        }

        fn read_available(&mut self, _buf: &mut BytesMut) -> Poll<Result<usize, TransportError>> {
            Poll::Pending
        }

        fn write_available(&mut self, _data: &[u8]) -> Poll<Result<usize, TransportError>> {
            Poll::Pending
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct NullProtocol;

    impl Protocol for NullProtocol {
        fn decode(&mut self, inbound: &mut BytesMut) -> Result<(), ProtocolError> {
            inbound.clear();
            Ok(())
        }

        fn poll_outbound(&mut self) -> Option<Bytes> {
            None
        }
    }

    struct TestDriver {
        scheme: &'static str,
        fail_load: bool,
    }

    impl Driver for TestDriver {
        fn scheme(&self) -> &str {
            self.scheme
        }

        fn load(&mut self) -> Result<(), DriverError> {
            if self.fail_load { Err(DriverError::Load("no device".into())) } else { Ok(()) }
        }

        fn create_connection(&mut self, _target: &ConnectionString) -> Result<Session, DriverError> {
            Ok(Session::new(NullTransport, NullProtocol))
        }
    }

    fn driver(scheme: &'static str) -> Box<dyn Driver> {
        Box::new(TestDriver { scheme, fail_load: false })
    }

    #[test]
    fn duplicate_scheme_rejected_and_original_kept() {
        let mut registry = DriverRegistry::new(SystemId::next()).unwrap();
        let first = registry.register(driver("s7")).unwrap();

        let err = registry.register(driver("S7")).unwrap_err();
        assert_eq!(err, SystemError::DuplicateScheme("s7".to_string()));
        assert_eq!(err.code(), ErrorCode::InternalError);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("s7"), Some(first));
    }

    #[test]
    fn resolve_sees_only_loaded_drivers() {
        let mut registry = DriverRegistry::new(SystemId::next()).unwrap();
        let handle = registry.register(driver("modbus")).unwrap();

        assert_eq!(registry.status(handle), Some(DriverStatus::Registered));
        assert_eq!(registry.resolve("modbus"), None);

        assert_eq!(registry.load(handle), Some(Ok(())));
        assert_eq!(registry.resolve("MODBUS"), Some(handle));
        assert_eq!(registry.status(handle), Some(DriverStatus::Loaded));

        // Second load is a no-op.
        assert_eq!(registry.load(handle), None);
    }

    #[test]
    fn failed_load_is_recorded() {
        let mut registry = DriverRegistry::new(SystemId::next()).unwrap();
        let handle = registry.register(Box::new(TestDriver { scheme: "ads", fail_load: true })).unwrap();

        assert!(matches!(registry.load(handle), Some(Err(DriverError::Load(_)))));
        assert_eq!(registry.status(handle), Some(DriverStatus::Failed(ErrorCode::UnknownError)));
        assert_eq!(registry.resolve("ads"), None);
    }

    #[test]
    fn create_session_requires_loaded_driver() {
        let mut registry = DriverRegistry::new(SystemId::next()).unwrap();
        let handle = registry.register(driver("s7")).unwrap();
        let target = ConnectionString::parse("s7://plc").unwrap();

        assert_eq!(
            registry.create_session(handle, &target).unwrap_err(),
            SystemError::UnknownScheme("s7".to_string())
        );

        registry.load(handle);
        assert!(registry.create_session(handle, &target).is_ok());
    }

    #[test]
    fn registration_order_preserved() {
        let mut registry = DriverRegistry::new(SystemId::next()).unwrap();
        let a = registry.register(driver("s7")).unwrap();
        let b = registry.register(driver("modbus")).unwrap();
        let c = registry.register(driver("ads")).unwrap();

        assert_eq!(registry.handles(), vec![a, b, c]);
        assert_eq!(registry.scheme(b), Some("modbus"));
    }
}
