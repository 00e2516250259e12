//! Mock driver and protocol.
//!
//! [`MockDriver`] serves a scheme (usually `"mock"`) by handing out
//! [`SimTransport`]s built from a [`TransportScript`]. The script can differ
//! per host, so one driver can serve a reachable and an unreachable device in
//! the same test. Every transport it creates is kept in a [`MockProbe`] for
//! inspection.
//!
//! [`MockProtocol`] frames messages as `len: u8` followed by `len` bytes. It
//! sends [`HANDSHAKE`] on connect and [`GOODBYE`] on disconnect; a zero length
//! prefix is a protocol error.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Bytes, BytesMut};
use plcloop_core::{
    ConnectionString, Driver, DriverError, Protocol, ProtocolError, Session, TransportError,
};
use tracing::trace;

use crate::{
    chaotic::ChaoticTransport,
    sim_transport::{SimTransport, SimTransportHandle, TransportScript},
};

/// Frame queued by [`MockProtocol`] when the link comes up.
pub const HANDSHAKE: &[u8] = b"\x05hello";

/// Frame queued by [`MockProtocol`] on graceful disconnect.
pub const GOODBYE: &[u8] = b"\x03bye";

#[derive(Debug, Default)]
struct ProtocolLog {
    decoded: Vec<Bytes>,
    queue: VecDeque<Bytes>,
}

/// Length-prefixed test protocol.
#[derive(Debug, Clone, Default)]
pub struct MockProtocol {
    log: Arc<Mutex<ProtocolLog>>,
}

impl MockProtocol {
    fn log(&self) -> MutexGuard<'_, ProtocolLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames decoded so far, without their length prefix.
    pub fn decoded(&self) -> Vec<Bytes> {
        self.log().decoded.clone()
    }

    /// Queue an application frame for sending.
    pub fn send(&self, payload: &[u8]) {
        let len = u8::try_from(payload.len()).unwrap_or(u8::MAX);
        let mut frame = Vec::with_capacity(usize::from(len) + 1);
        frame.push(len);
        frame.extend_from_slice(&payload[..usize::from(len)]);
        self.log().queue.push_back(Bytes::from(frame));
    }
}

impl Protocol for MockProtocol {
    fn on_connected(&mut self) {
        self.log().queue.push_back(Bytes::from_static(HANDSHAKE));
    }

    fn decode(&mut self, inbound: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut log = self.log();
        while let Some(&len) = inbound.first() {
            if len == 0 {
                return Err(ProtocolError::Malformed("zero length frame".into()));
            }
            let len = usize::from(len);
            if inbound.len() <= len {
                break;
            }
            let mut frame = inbound.split_to(len + 1);
            let payload = frame.split_off(1).freeze();
            trace!(len, "mock frame decoded");
            log.decoded.push(payload);
        }
        Ok(())
    }

    fn poll_outbound(&mut self) -> Option<Bytes> {
        self.log().queue.pop_front()
    }

    fn on_disconnect(&mut self) {
        self.log().queue.push_back(Bytes::from_static(GOODBYE));
    }
}

/// One connection created by a [`MockDriver`].
#[derive(Debug, Clone)]
pub struct MockConnection {
    /// Connection string the driver was asked for.
    pub target: ConnectionString,
    /// Transport observer.
    pub transport: SimTransportHandle,
    /// Protocol observer.
    pub protocol: MockProtocol,
}

#[derive(Debug, Default)]
struct ProbeState {
    created: Vec<MockConnection>,
    loads: usize,
}

/// Shared view of everything a [`MockDriver`] did.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MockProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connections created so far, in order.
    pub fn connections(&self) -> Vec<MockConnection> {
        self.lock().created.clone()
    }

    /// Most recently created connection for `host`.
    pub fn connection_for(&self, host: &str) -> Option<MockConnection> {
        self.lock().created.iter().rev().find(|c| c.target.host() == host).cloned()
    }

    /// Most recently created connection.
    pub fn last(&self) -> Option<MockConnection> {
        self.lock().created.last().cloned()
    }

    /// Number of `load()` calls.
    pub fn loads(&self) -> usize {
        self.lock().loads
    }
}

/// Scripted driver.
#[derive(Debug)]
pub struct MockDriver {
    scheme: String,
    default_script: TransportScript,
    per_host: HashMap<String, TransportScript>,
    rejected_hosts: Vec<String>,
    load_error: Option<DriverError>,
    chaos: Option<(f64, u64)>,
    next_seed: u64,
    probe: MockProbe,
}

impl MockDriver {
    /// Driver for `scheme` whose transports connect on the first poll.
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            default_script: TransportScript::default(),
            per_host: HashMap::new(),
            rejected_hosts: Vec::new(),
            load_error: None,
            chaos: None,
            next_seed: 0,
            probe: MockProbe::default(),
        }
    }

    /// Script used for hosts without an explicit one.
    #[must_use]
    pub fn with_script(mut self, script: TransportScript) -> Self {
        self.default_script = script;
        self
    }

    /// Script used for `host`.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, script: TransportScript) -> Self {
        self.per_host.insert(host.into(), script);
        self
    }

    /// `create_connection` for `host` fails with `InvalidTarget`.
    #[must_use]
    pub fn rejecting(mut self, host: impl Into<String>) -> Self {
        self.rejected_hosts.push(host.into());
        self
    }

    /// `load()` fails with this error.
    #[must_use]
    pub fn failing_load(mut self, err: DriverError) -> Self {
        self.load_error = Some(err);
        self
    }

    /// Wrap every transport in a [`ChaoticTransport`] failing at `rate`.
    /// Each transport gets its own seed derived from `seed`.
    #[must_use]
    pub fn with_chaos(mut self, rate: f64, seed: u64) -> Self {
        self.chaos = Some((rate, seed));
        self
    }

    /// Observer for this driver. Clone it before registering the driver.
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }
}

impl Driver for MockDriver {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn load(&mut self) -> Result<(), DriverError> {
        self.probe.lock().loads += 1;
        match &self.load_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn create_connection(&mut self, target: &ConnectionString) -> Result<Session, DriverError> {
        if self.rejected_hosts.iter().any(|h| h == target.host()) {
            return Err(DriverError::InvalidTarget(format!("host {} rejected", target.host())));
        }
        if target.option("fail") == Some("denied") {
            return Err(TransportError::PermissionDenied(target.host().to_string()).into());
        }

        let script =
            self.per_host.get(target.host()).cloned().unwrap_or_else(|| self.default_script.clone());
        let (transport, handle) = SimTransport::new(script);
        let protocol = MockProtocol::default();

        self.probe.lock().created.push(MockConnection {
            target: target.clone(),
            transport: handle,
            protocol: protocol.clone(),
        });

        let session = match self.chaos {
            Some((rate, seed)) => {
                self.next_seed = self.next_seed.wrapping_add(1);
                let chaotic =
                    ChaoticTransport::with_seed(transport, rate, seed.wrapping_add(self.next_seed));
                Session::new(chaotic, protocol)
            },
            None => Session::new(transport, protocol),
        };
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_decodes_and_keeps_partial_frames() {
        let mut protocol = MockProtocol::default();
        let mut inbound = BytesMut::from(&b"\x02hi\x03ab"[..]);

        protocol.decode(&mut inbound).unwrap();

        assert_eq!(protocol.decoded(), vec![Bytes::from_static(b"hi")]);
        assert_eq!(&inbound[..], b"\x03ab");
    }

    #[test]
    fn protocol_rejects_zero_length() {
        let mut protocol = MockProtocol::default();
        let mut inbound = BytesMut::from(&b"\x00"[..]);
        assert!(matches!(protocol.decode(&mut inbound), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn driver_uses_per_host_script_and_records_connections() {
        let mut driver = MockDriver::new("mock")
            .with_host("down", TransportScript::unreachable())
            .rejecting("bad");
        let probe = driver.probe();

        let up = ConnectionString::parse("mock://up").unwrap();
        let down = ConnectionString::parse("mock://down").unwrap();
        let bad = ConnectionString::parse("mock://bad").unwrap();

        assert!(driver.create_connection(&up).is_ok());
        assert!(driver.create_connection(&down).is_ok());
        assert!(matches!(driver.create_connection(&bad), Err(DriverError::InvalidTarget(_))));

        assert_eq!(probe.connections().len(), 2);
        assert_eq!(probe.connection_for("down").unwrap().target.host(), "down");
    }
}
