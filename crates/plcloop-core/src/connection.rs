//! Per-device connection state machine.
//!
//! A [`Connection`] owns one [`Session`] and moves it through its lifecycle.
//! Time is passed in and events are handed back. The state machine never
//! sleeps and never calls into user code; [`System`](crate::system::System)
//! maps the returned [`ConnectionEvent`]s onto callbacks.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐  dial ok   ┌───────────┐ disconnect ┌───────────────┐ flushed+closed ┌────────┐
//! │ Connecting │───────────>│ Connected │───────────>│ Disconnecting │───────────────>│ Closed │
//! └────────────┘            └───────────┘            └───────────────┘                └────────┘
//!       │ dial error/timeout      │ EOF/fault               │ close/write error
//!       ↓                         ↓                         ↓
//!   ┌───────┐                 ┌───────┐                 ┌───────┐
//!   │ Error │                 │ Error │                 │ Error │
//!   └───────┘                 └───────┘                 └───────┘
//! ```
//!
//! `disconnect` is also accepted from `Connecting` and `Error`. A connection
//! in `Error` whose transport is already closed goes straight to `Closed` on
//! its next advance.

use std::{collections::VecDeque, fmt, ops::Sub, task::Poll, time::Duration};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    driver::{Protocol, Session},
    error::{ErrorCode, ProtocolError, TransportError},
    handle::DriverHandle,
    transport::Transport,
    uri::ConnectionString,
};

/// Time allowed for the transport to finish dialing.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed to flush queued frames after `disconnect`.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on reads per connection per tick.
pub const DEFAULT_MAX_READS_PER_ADVANCE: usize = 8;

/// Buffer space reserved before each read.
pub const DEFAULT_READ_CHUNK: usize = 4096;

/// Undecoded inbound bytes tolerated before the connection faults.
pub const DEFAULT_MAX_INBOUND: usize = 64 * 1024;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport is dialing.
    Connecting,
    /// Link is up and the protocol is exchanging frames.
    Connected,
    /// Flushing queued frames before closing.
    Disconnecting,
    /// Closed gracefully.
    Closed,
    /// Failed. `last_error` holds the reason.
    Error,
}

impl ConnectionState {
    /// `Closed` or `Error`. Terminal connections are never advanced again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Outcome of one [`Connection::advance`] step that observers care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Dial completed.
    Connected,
    /// Dial failed or timed out.
    ConnectFailed(ErrorCode),
    /// Live connection hit an EOF, transport error or protocol error.
    Fault(ErrorCode),
    /// Graceful disconnect completed.
    Disconnected,
    /// Graceful disconnect failed.
    DisconnectFailed(ErrorCode),
}

/// Per-connection tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Dial deadline. Expiry fails the connection with `NotReachable`.
    pub dial_timeout: Duration,
    /// Drain deadline after `disconnect`. Expiry drops unsent frames and
    /// closes the transport.
    pub drain_timeout: Duration,
    /// Upper bound on `read_available` calls per advance.
    pub max_reads_per_advance: usize,
    /// Bytes reserved in the inbound buffer before each read.
    pub read_chunk: usize,
    /// Undecoded bytes the protocol may leave buffered. Exceeding it is a
    /// fault.
    pub max_inbound: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_reads_per_advance: DEFAULT_MAX_READS_PER_ADVANCE,
            read_chunk: DEFAULT_READ_CHUNK,
            max_inbound: DEFAULT_MAX_INBOUND,
        }
    }
}

/// One connection to one remote device.
///
/// Generic over `Instant` so that timeouts run on virtual time in tests.
///
/// # Invariants
///
/// - Terminal states are absorbing: `advance` returns `None` and touches
///   nothing.
/// - `transport_open` is false once `close` has been called on the transport.
/// - `written < outbound[0].len()` whenever `outbound` is non-empty.
pub struct Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    driver: DriverHandle,
    target: ConnectionString,
    state: ConnectionState,
    last_error: Option<ErrorCode>,
    entered_at: I,
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    protocol: Box<dyn Protocol>,
    transport_open: bool,
    /// Dial completed at some point. Reads and writes require it.
    dialed: bool,
    inbound: BytesMut,
    outbound: VecDeque<Bytes>,
    /// Bytes of `outbound[0]` already accepted by the transport.
    written: usize,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a connection in [`ConnectionState::Connecting`].
    pub fn new(
        driver: DriverHandle,
        target: ConnectionString,
        session: Session,
        now: I,
        config: ConnectionConfig,
    ) -> Self {
        let Session { transport, protocol } = session;
        Self {
            driver,
            target,
            state: ConnectionState::Connecting,
            last_error: None,
            entered_at: now,
            config,
            transport,
            protocol,
            transport_open: true,
            dialed: false,
            inbound: BytesMut::new(),
            outbound: VecDeque::new(),
            written: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Code of the failure that moved the connection to `Error`.
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// Driver that created this connection.
    #[must_use]
    pub fn driver(&self) -> DriverHandle {
        self.driver
    }

    /// Parsed connection string.
    #[must_use]
    pub fn target(&self) -> &ConnectionString {
        &self.target
    }

    /// Frames queued but not yet fully written.
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.outbound.len()
    }

    /// Advance as far as possible without blocking.
    ///
    /// Returns the event produced by this step, if any. At most one event is
    /// produced per call.
    pub fn advance(&mut self, now: I) -> Option<ConnectionEvent> {
        match self.state {
            ConnectionState::Connecting => self.advance_connecting(now),
            ConnectionState::Connected => self.advance_connected(),
            ConnectionState::Disconnecting => self.advance_disconnecting(now),
            ConnectionState::Closed | ConnectionState::Error => None,
        }
    }

    /// Begin a graceful disconnect.
    ///
    /// Accepted from `Connecting`, `Connected` and `Error`.
    ///
    /// # Errors
    ///
    /// Returns the current state if it is `Disconnecting` or `Closed`.
    pub fn request_disconnect(&mut self, now: I) -> Result<(), ConnectionState> {
        match self.state {
            ConnectionState::Connected => {
                self.protocol.on_disconnect();
            },
            ConnectionState::Connecting | ConnectionState::Error => {},
            ConnectionState::Disconnecting | ConnectionState::Closed => return Err(self.state),
        }

        self.transition(ConnectionState::Disconnecting, now);
        Ok(())
    }

    /// Close the transport immediately, without flushing.
    ///
    /// A non-terminal connection moves to `Error` with `UnknownError`.
    /// Returns true if that happened.
    pub fn abort(&mut self) -> bool {
        self.close_silently();
        self.outbound.clear();
        self.written = 0;

        if self.state.is_terminal() {
            return false;
        }
        self.state = ConnectionState::Error;
        self.last_error = Some(ErrorCode::UnknownError);
        debug!(target_uri = %self.target, "connection aborted");
        true
    }

    fn advance_connecting(&mut self, now: I) -> Option<ConnectionEvent> {
        match self.transport.poll_dial() {
            Poll::Ready(Ok(())) => {
                self.dialed = true;
                self.transition(ConnectionState::Connected, now);
                self.protocol.on_connected();
                Some(ConnectionEvent::Connected)
            },
            Poll::Ready(Err(err)) => {
                warn!(target_uri = %self.target, error = %err, "dial failed");
                Some(ConnectionEvent::ConnectFailed(self.fail(err.code())))
            },
            Poll::Pending => {
                let elapsed = now - self.entered_at;
                if elapsed < self.config.dial_timeout {
                    return None;
                }
                warn!(target_uri = %self.target, ?elapsed, "dial timed out");
                Some(ConnectionEvent::ConnectFailed(self.fail(ErrorCode::NotReachable)))
            },
        }
    }

    fn advance_connected(&mut self) -> Option<ConnectionEvent> {
        let mut received = false;
        // Read faults are reported after bytes already read are decoded.
        let mut read_fault = None;
        for _ in 0..self.config.max_reads_per_advance.max(1) {
            if self.inbound.len() > self.config.max_inbound {
                break;
            }
            self.inbound.reserve(self.config.read_chunk);
            match self.transport.read_available(&mut self.inbound) {
                Poll::Ready(Ok(0)) => {
                    debug!(target_uri = %self.target, "peer closed connection");
                    read_fault = Some(ErrorCode::NotReachable);
                    break;
                },
                Poll::Ready(Ok(_)) => received = true,
                Poll::Ready(Err(err)) => {
                    warn!(target_uri = %self.target, error = %err, "read failed");
                    read_fault = Some(err.code());
                    break;
                },
                Poll::Pending => break,
            }
        }

        if received && let Err(err) = self.decode_inbound() {
            warn!(target_uri = %self.target, error = %err, "protocol fault");
            return Some(ConnectionEvent::Fault(self.fail(err.code())));
        }

        if let Some(code) = read_fault {
            return Some(ConnectionEvent::Fault(self.fail(code)));
        }

        if let Err(err) = self.flush() {
            warn!(target_uri = %self.target, error = %err, "write failed");
            return Some(ConnectionEvent::Fault(self.fail(err.code())));
        }

        None
    }

    fn advance_disconnecting(&mut self, now: I) -> Option<ConnectionEvent> {
        if self.transport_open {
            if self.dialed
                && let Err(err) = self.flush()
            {
                warn!(target_uri = %self.target, error = %err, "write failed while draining");
                return Some(ConnectionEvent::DisconnectFailed(self.fail(err.code())));
            }

            if !self.outbound.is_empty() {
                let elapsed = now - self.entered_at;
                if elapsed < self.config.drain_timeout {
                    return None;
                }
                warn!(
                    target_uri = %self.target,
                    dropped = self.outbound.len(),
                    ?elapsed,
                    "drain timed out, dropping unsent frames"
                );
                self.outbound.clear();
                self.written = 0;
            }

            self.transport_open = false;
            if let Err(err) = self.transport.close() {
                warn!(target_uri = %self.target, error = %err, "close failed");
                return Some(ConnectionEvent::DisconnectFailed(self.fail(err.code())));
            }
        }

        self.transition(ConnectionState::Closed, now);
        Some(ConnectionEvent::Disconnected)
    }

    fn decode_inbound(&mut self) -> Result<(), ProtocolError> {
        self.protocol.decode(&mut self.inbound)?;
        if self.inbound.len() > self.config.max_inbound {
            return Err(ProtocolError::InboundOverflow {
                buffered: self.inbound.len(),
                limit: self.config.max_inbound,
            });
        }
        Ok(())
    }

    /// Pull frames from the protocol and write as much as the transport
    /// accepts.
    fn flush(&mut self) -> Result<(), TransportError> {
        loop {
            if self.outbound.is_empty() {
                match self.protocol.poll_outbound() {
                    Some(frame) => self.outbound.push_back(frame),
                    None => return Ok(()),
                }
            }

            let Some(front) = self.outbound.front() else {
                return Ok(());
            };
            if self.written >= front.len() {
                self.outbound.pop_front();
                self.written = 0;
                continue;
            }

            match self.transport.write_available(&front[self.written..]) {
                Poll::Ready(Ok(0)) | Poll::Pending => return Ok(()),
                Poll::Ready(Ok(n)) => self.written += n,
                Poll::Ready(Err(err)) => return Err(err),
            }
        }
    }

    fn transition(&mut self, to: ConnectionState, now: I) {
        debug!(target_uri = %self.target, from = ?self.state, ?to, "connection state change");
        self.state = to;
        self.entered_at = now;
    }

    /// Enter `Error` with `code`, closing the transport. Returns `code`.
    fn fail(&mut self, code: ErrorCode) -> ErrorCode {
        self.close_silently();
        self.outbound.clear();
        self.written = 0;
        debug!(target_uri = %self.target, from = ?self.state, %code, "connection failed");
        self.state = ConnectionState::Error;
        self.last_error = Some(code);
        code
    }

    fn close_silently(&mut self) {
        if !self.transport_open {
            return;
        }
        self.transport_open = false;
        if let Err(err) = self.transport.close() {
            debug!(target_uri = %self.target, error = %err, "close during teardown failed");
        }
    }
}

impl<I> fmt::Debug for Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("driver", &self.driver)
            .field("target", &self.target.to_string())
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .field("transport_open", &self.transport_open)
            .field("pending_frames", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::handle::{HandleTable, SystemId};

    #[derive(Default)]
    struct Script {
        dial_after: usize,
        dial_error: Option<TransportError>,
        dial_polls: usize,
        inbound: VecDeque<Result<Vec<u8>, TransportError>>,
        written: Vec<u8>,
        write_capacity: Option<usize>,
        write_error: Option<TransportError>,
        close_error: Option<TransportError>,
        closes: usize,
    }

    #[derive(Clone, Default)]
    struct FakeTransport(Arc<Mutex<Script>>);

    impl Transport for FakeTransport {
        fn poll_dial(&mut self) -> Poll<Result<(), TransportError>> {
            let mut s = self.0.lock().unwrap();
            s.dial_polls += 1;
            if let Some(err) = s.dial_error.clone() {
                return Poll::Ready(Err(err));
            }
            if s.dial_polls > s.dial_after { Poll::Ready(Ok(())) } else { Poll::Pending }
        }

        fn read_available(&mut self, buf: &mut BytesMut) -> Poll<Result<usize, TransportError>> {
            let mut s = self.0.lock().unwrap();
            match s.inbound.pop_front() {
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    Poll::Ready(Ok(bytes.len()))
                },
                Some(Err(err)) => Poll::Ready(Err(err)),
                None => Poll::Pending,
            }
        }

        fn write_available(&mut self, data: &[u8]) -> Poll<Result<usize, TransportError>> {
            let mut s = self.0.lock().unwrap();
            if let Some(err) = s.write_error.clone() {
                return Poll::Ready(Err(err));
            }
            let n = s.write_capacity.map_or(data.len(), |cap| cap.min(data.len()));
            if n == 0 {
                return Poll::Pending;
            }
            if let Some(cap) = s.write_capacity.as_mut() {
                *cap -= n;
            }
            s.written.extend_from_slice(&data[..n]);
            Poll::Ready(Ok(n))
        }

        fn close(&mut self) -> Result<(), TransportError> {
            let mut s = self.0.lock().unwrap();
            s.closes += 1;
            match s.close_error.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    /// Frames are `len:u8` followed by `len` bytes. A zero length is invalid.
    #[derive(Default)]
    struct LenProtocol {
        queue: VecDeque<Bytes>,
        decoded: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Protocol for LenProtocol {
        fn on_connected(&mut self) {
            self.queue.push_back(Bytes::from_static(b"\x05hello"));
        }

        fn decode(&mut self, inbound: &mut BytesMut) -> Result<(), ProtocolError> {
            while let Some(&len) = inbound.first() {
                if len == 0 {
                    return Err(ProtocolError::Malformed("zero length".into()));
                }
                let len = usize::from(len);
                if inbound.len() < len + 1 {
                    break;
                }
                let frame = inbound.split_to(len + 1);
                self.decoded.lock().unwrap().push(frame[1..].to_vec());
            }
            Ok(())
        }

        fn poll_outbound(&mut self) -> Option<Bytes> {
            self.queue.pop_front()
        }

        fn on_disconnect(&mut self) {
            self.queue.push_back(Bytes::from_static(b"\x03bye"));
        }
    }

    struct Fixture {
        conn: Connection<Duration>,
        script: Arc<Mutex<Script>>,
        decoded: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    fn fixture(script: Script, config: ConnectionConfig) -> Fixture {
        let mut drivers = HandleTable::with_capacity(SystemId::next(), 1).unwrap();
        let driver = DriverHandle::from_raw(drivers.insert(()).unwrap());

        let transport = FakeTransport(Arc::new(Mutex::new(script)));
        let script = Arc::clone(&transport.0);
        let protocol = LenProtocol::default();
        let decoded = Arc::clone(&protocol.decoded);
        let target = ConnectionString::parse("test://device").unwrap();

        let conn =
            Connection::new(driver, target, Session::new(transport, protocol), Duration::ZERO, config);
        Fixture { conn, script, decoded }
    }

    fn connected(script: Script) -> Fixture {
        let mut f = fixture(script, ConnectionConfig::default());
        assert_eq!(f.conn.advance(Duration::ZERO), Some(ConnectionEvent::Connected));
        f
    }

    #[test]
    fn dial_completes_after_pending_polls() {
        let mut f = fixture(Script { dial_after: 2, ..Script::default() }, ConnectionConfig::default());

        assert_eq!(f.conn.advance(Duration::from_millis(1)), None);
        assert_eq!(f.conn.advance(Duration::from_millis(2)), None);
        assert_eq!(f.conn.state(), ConnectionState::Connecting);

        assert_eq!(f.conn.advance(Duration::from_millis(3)), Some(ConnectionEvent::Connected));
        assert_eq!(f.conn.state(), ConnectionState::Connected);

        // Handshake frame queued by on_connected goes out on the next advance.
        assert_eq!(f.conn.advance(Duration::from_millis(4)), None);
        assert_eq!(f.script.lock().unwrap().written, b"\x05hello");
    }

    #[test]
    fn dial_error_keeps_transport_code() {
        let script = Script {
            dial_error: Some(TransportError::PermissionDenied("/dev/ttyUSB0".into())),
            ..Script::default()
        };
        let mut f = fixture(script, ConnectionConfig::default());

        assert_eq!(
            f.conn.advance(Duration::ZERO),
            Some(ConnectionEvent::ConnectFailed(ErrorCode::PermissionDenied))
        );
        assert_eq!(f.conn.state(), ConnectionState::Error);
        assert_eq!(f.conn.last_error(), Some(ErrorCode::PermissionDenied));
        assert_eq!(f.script.lock().unwrap().closes, 1);
    }

    #[test]
    fn dial_timeout_is_not_reachable() {
        let config = ConnectionConfig { dial_timeout: Duration::from_secs(1), ..Default::default() };
        let mut f = fixture(Script { dial_after: usize::MAX, ..Script::default() }, config);

        assert_eq!(f.conn.advance(Duration::from_millis(999)), None);
        assert_eq!(
            f.conn.advance(Duration::from_secs(1)),
            Some(ConnectionEvent::ConnectFailed(ErrorCode::NotReachable))
        );
    }

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut f = connected(Script::default());
        {
            let mut s = f.script.lock().unwrap();
            s.inbound.push_back(Ok(b"\x03ab".to_vec()));
        }
        assert_eq!(f.conn.advance(Duration::ZERO), None);
        assert!(f.decoded.lock().unwrap().is_empty());

        f.script.lock().unwrap().inbound.push_back(Ok(b"c\x01z".to_vec()));
        assert_eq!(f.conn.advance(Duration::ZERO), None);
        assert_eq!(*f.decoded.lock().unwrap(), vec![b"abc".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn peer_eof_is_fault_not_reachable() {
        let mut f = connected(Script::default());
        f.script.lock().unwrap().inbound.push_back(Ok(Vec::new()));

        assert_eq!(
            f.conn.advance(Duration::ZERO),
            Some(ConnectionEvent::Fault(ErrorCode::NotReachable))
        );
        assert_eq!(f.conn.state(), ConnectionState::Error);

        // Terminal: nothing further happens.
        assert_eq!(f.conn.advance(Duration::from_secs(100)), None);
    }

    #[test]
    fn frames_read_before_eof_are_decoded() {
        let mut f = connected(Script::default());
        {
            let mut s = f.script.lock().unwrap();
            s.inbound.push_back(Ok(b"\x02hi".to_vec()));
            s.inbound.push_back(Ok(Vec::new()));
        }

        assert_eq!(
            f.conn.advance(Duration::ZERO),
            Some(ConnectionEvent::Fault(ErrorCode::NotReachable))
        );
        assert_eq!(*f.decoded.lock().unwrap(), vec![b"hi".to_vec()]);
        assert_eq!(f.conn.last_error(), Some(ErrorCode::NotReachable));
    }

    #[test]
    fn frames_read_before_read_error_are_decoded() {
        let mut f = connected(Script::default());
        {
            let mut s = f.script.lock().unwrap();
            s.inbound.push_back(Ok(b"\x01a\x01b".to_vec()));
            s.inbound.push_back(Err(TransportError::PermissionDenied("reset".into())));
        }

        assert_eq!(
            f.conn.advance(Duration::ZERO),
            Some(ConnectionEvent::Fault(ErrorCode::PermissionDenied))
        );
        assert_eq!(*f.decoded.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn malformed_bytes_before_eof_report_the_protocol_error() {
        let mut f = connected(Script::default());
        {
            let mut s = f.script.lock().unwrap();
            s.inbound.push_back(Ok(vec![0]));
            s.inbound.push_back(Ok(Vec::new()));
        }

        assert_eq!(
            f.conn.advance(Duration::ZERO),
            Some(ConnectionEvent::Fault(ErrorCode::UnknownError))
        );
    }

    #[test]
    fn undecoded_inbound_beyond_limit_faults() {
        let config = ConnectionConfig { max_inbound: 8, ..Default::default() };
        let mut f = fixture(Script::default(), config);
        f.conn.advance(Duration::ZERO);

        // Announces a 200 byte frame and never completes it.
        f.script.lock().unwrap().inbound.push_back(Ok(b"\xc8abcd".to_vec()));
        assert_eq!(f.conn.advance(Duration::ZERO), None);

        f.script.lock().unwrap().inbound.push_back(Ok(b"efgh".to_vec()));
        assert_eq!(
            f.conn.advance(Duration::ZERO),
            Some(ConnectionEvent::Fault(ErrorCode::UnknownError))
        );
        assert_eq!(f.conn.state(), ConnectionState::Error);
        assert_eq!(f.script.lock().unwrap().closes, 1);
    }

    #[test]
    fn protocol_error_is_unknown_error() {
        let mut f = connected(Script::default());
        f.script.lock().unwrap().inbound.push_back(Ok(vec![0]));

        assert_eq!(
            f.conn.advance(Duration::ZERO),
            Some(ConnectionEvent::Fault(ErrorCode::UnknownError))
        );
    }

    #[test]
    fn read_budget_bounds_work_per_advance() {
        let config = ConnectionConfig { max_reads_per_advance: 2, ..Default::default() };
        let mut f = fixture(Script::default(), config);
        f.conn.advance(Duration::ZERO);
        {
            let mut s = f.script.lock().unwrap();
            for _ in 0..5 {
                s.inbound.push_back(Ok(b"\x01x".to_vec()));
            }
        }

        f.conn.advance(Duration::ZERO);
        assert_eq!(f.decoded.lock().unwrap().len(), 2);
        assert_eq!(f.script.lock().unwrap().inbound.len(), 3);
    }

    #[test]
    fn partial_writes_resume() {
        let mut f = connected(Script { write_capacity: Some(2), ..Script::default() });

        f.conn.advance(Duration::ZERO);
        assert_eq!(f.script.lock().unwrap().written, b"\x05h");
        assert_eq!(f.conn.pending_frames(), 1);

        // Transport full: nothing moves.
        f.script.lock().unwrap().write_capacity = Some(0);
        f.conn.advance(Duration::ZERO);
        assert_eq!(f.script.lock().unwrap().written, b"\x05h");

        f.script.lock().unwrap().write_capacity = None;
        f.conn.advance(Duration::ZERO);
        assert_eq!(f.script.lock().unwrap().written, b"\x05hello");
        assert_eq!(f.conn.pending_frames(), 0);
    }

    #[test]
    fn graceful_disconnect_flushes_final_frame() {
        let mut f = connected(Script::default());
        f.conn.request_disconnect(Duration::ZERO).unwrap();
        assert_eq!(f.conn.state(), ConnectionState::Disconnecting);

        assert_eq!(f.conn.advance(Duration::ZERO), Some(ConnectionEvent::Disconnected));
        assert_eq!(f.conn.state(), ConnectionState::Closed);

        let s = f.script.lock().unwrap();
        assert_eq!(s.written, b"\x05hello\x03bye");
        assert_eq!(s.closes, 1);
    }

    #[test]
    fn disconnect_twice_is_rejected() {
        let mut f = connected(Script::default());
        f.conn.request_disconnect(Duration::ZERO).unwrap();
        assert_eq!(
            f.conn.request_disconnect(Duration::ZERO),
            Err(ConnectionState::Disconnecting)
        );

        f.conn.advance(Duration::ZERO);
        assert_eq!(f.conn.request_disconnect(Duration::ZERO), Err(ConnectionState::Closed));
    }

    #[test]
    fn close_failure_is_disconnect_failed() {
        let mut f = connected(Script {
            close_error: Some(TransportError::Io("EBADF".into())),
            ..Script::default()
        });
        f.conn.request_disconnect(Duration::ZERO).unwrap();

        assert_eq!(
            f.conn.advance(Duration::ZERO),
            Some(ConnectionEvent::DisconnectFailed(ErrorCode::UnknownError))
        );
        assert_eq!(f.conn.state(), ConnectionState::Error);
        assert_eq!(f.script.lock().unwrap().closes, 1);
    }

    #[test]
    fn drain_timeout_drops_stuck_frames() {
        let config = ConnectionConfig { drain_timeout: Duration::from_secs(1), ..Default::default() };
        let mut f = fixture(Script { write_capacity: Some(0), ..Script::default() }, config);
        f.conn.advance(Duration::ZERO);
        f.conn.request_disconnect(Duration::ZERO).unwrap();

        assert_eq!(f.conn.advance(Duration::from_millis(500)), None);
        assert_eq!(
            f.conn.advance(Duration::from_secs(1)),
            Some(ConnectionEvent::Disconnected)
        );
        assert_eq!(f.conn.pending_frames(), 0);
        assert!(f.script.lock().unwrap().written.is_empty());
    }

    #[test]
    fn disconnect_while_dialing_skips_writes() {
        let mut f = fixture(Script { dial_after: usize::MAX, ..Script::default() }, Default::default());
        assert_eq!(f.conn.advance(Duration::ZERO), None);

        f.conn.request_disconnect(Duration::ZERO).unwrap();
        assert_eq!(f.conn.advance(Duration::ZERO), Some(ConnectionEvent::Disconnected));

        let s = f.script.lock().unwrap();
        assert!(s.written.is_empty());
        assert_eq!(s.closes, 1);
    }

    #[test]
    fn disconnect_from_error_closes_without_second_close() {
        let mut f = connected(Script::default());
        f.script.lock().unwrap().inbound.push_back(Ok(Vec::new()));
        f.conn.advance(Duration::ZERO);
        assert_eq!(f.conn.state(), ConnectionState::Error);

        f.conn.request_disconnect(Duration::ZERO).unwrap();
        assert_eq!(f.conn.advance(Duration::ZERO), Some(ConnectionEvent::Disconnected));
        assert_eq!(f.conn.state(), ConnectionState::Closed);
        assert_eq!(f.script.lock().unwrap().closes, 1);
    }

    #[test]
    fn abort_is_silent_and_idempotent() {
        let mut f = connected(Script::default());

        assert!(f.conn.abort());
        assert_eq!(f.conn.state(), ConnectionState::Error);
        assert_eq!(f.conn.last_error(), Some(ErrorCode::UnknownError));

        assert!(!f.conn.abort());
        assert_eq!(f.script.lock().unwrap().closes, 1);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let mut encoded = Vec::new();
        ciborium::into_writer(&ciborium::Value::Map(Vec::new()), &mut encoded).unwrap();
        let config: ConnectionConfig = ciborium::from_reader(encoded.as_slice()).unwrap();
        assert_eq!(config, ConnectionConfig::default());
    }
}
