//! Scripted transport for deterministic tests.
//!
//! A [`SimTransport`] follows a [`TransportScript`]: when the dial completes,
//! what the peer sends, how much it accepts, whether close fails. The test
//! keeps a [`SimTransportHandle`] to feed more input and inspect what the
//! engine did. Misuse of the transport contract (I/O before the dial
//! completed, anything after close) is recorded rather than panicking, so
//! invariant checks can report it.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::Poll,
};

use bytes::{Bytes, BytesMut};
use plcloop_core::{Transport, TransportError};

/// How the dial resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialPlan {
    /// Ready on the n-th poll (1-based). `After(1)` connects on the first
    /// tick.
    After(usize),
    /// Fails on the first poll.
    Fail(TransportError),
    /// Never completes.
    Never,
}

/// One scripted read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Peer sent these bytes.
    Data(Bytes),
    /// Peer closed the link.
    Eof,
    /// Read fails with this error.
    Error(TransportError),
}

/// Behaviour of one scripted transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportScript {
    /// Dial outcome.
    pub dial: DialPlan,
    /// Reads, in order. Once exhausted, reads are `Pending`.
    pub inbound: Vec<Inbound>,
    /// Total bytes accepted before writes go `Pending`. `None` is unlimited.
    pub write_budget: Option<usize>,
    /// Every write fails with this error.
    pub write_error: Option<TransportError>,
    /// Close fails with this error.
    pub close_error: Option<TransportError>,
}

impl Default for TransportScript {
    fn default() -> Self {
        Self::connects_after(1)
    }
}

impl TransportScript {
    /// Dial completes on the `polls`-th poll.
    pub fn connects_after(polls: usize) -> Self {
        Self {
            dial: DialPlan::After(polls.max(1)),
            inbound: Vec::new(),
            write_budget: None,
            write_error: None,
            close_error: None,
        }
    }

    /// Dial fails with `NotReachable`.
    pub fn unreachable() -> Self {
        Self {
            dial: DialPlan::Fail(TransportError::Unreachable("connection refused".into())),
            ..Self::default()
        }
    }

    /// Dial never completes.
    pub fn never_connects() -> Self {
        Self { dial: DialPlan::Never, ..Self::default() }
    }

    /// Queue a read result.
    #[must_use]
    pub fn with_inbound(mut self, inbound: Inbound) -> Self {
        self.inbound.push(inbound);
        self
    }

    /// Limit total accepted bytes.
    #[must_use]
    pub fn with_write_budget(mut self, budget: usize) -> Self {
        self.write_budget = Some(budget);
        self
    }

    /// Make every write fail.
    #[must_use]
    pub fn with_write_error(mut self, err: TransportError) -> Self {
        self.write_error = Some(err);
        self
    }

    /// Make close fail.
    #[must_use]
    pub fn with_close_error(mut self, err: TransportError) -> Self {
        self.close_error = Some(err);
        self
    }
}

#[derive(Debug)]
struct TransportState {
    dial_polls: usize,
    dialed: bool,
    closed: bool,
    closes: usize,
    inbound: VecDeque<Inbound>,
    written: Vec<u8>,
    write_budget: Option<usize>,
    write_error: Option<TransportError>,
    close_error: Option<TransportError>,
    misuse: Vec<String>,
}

/// Transport driven by a [`TransportScript`].
#[derive(Debug)]
pub struct SimTransport {
    dial: DialPlan,
    state: Arc<Mutex<TransportState>>,
}

/// Test-side view of a [`SimTransport`].
#[derive(Debug, Clone)]
pub struct SimTransportHandle {
    state: Arc<Mutex<TransportState>>,
}

fn lock(state: &Mutex<TransportState>) -> MutexGuard<'_, TransportState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimTransport {
    /// Build a transport and the handle observing it.
    pub fn new(script: TransportScript) -> (Self, SimTransportHandle) {
        let state = Arc::new(Mutex::new(TransportState {
            dial_polls: 0,
            dialed: false,
            closed: false,
            closes: 0,
            inbound: script.inbound.into(),
            written: Vec::new(),
            write_budget: script.write_budget,
            write_error: script.write_error,
            close_error: script.close_error,
            misuse: Vec::new(),
        }));
        let handle = SimTransportHandle { state: Arc::clone(&state) };
        (Self { dial: script.dial, state }, handle)
    }
}

impl Transport for SimTransport {
    fn poll_dial(&mut self) -> Poll<Result<(), TransportError>> {
        let mut state = lock(&self.state);
        if state.closed {
            state.misuse.push("poll_dial after close".into());
            return Poll::Ready(Err(TransportError::Closed));
        }
        if state.dialed {
            state.misuse.push("poll_dial after dial completed".into());
        }
        state.dial_polls += 1;

        match &self.dial {
            DialPlan::After(polls) if state.dial_polls >= *polls => {
                state.dialed = true;
                Poll::Ready(Ok(()))
            },
            DialPlan::After(_) | DialPlan::Never => Poll::Pending,
            DialPlan::Fail(err) => Poll::Ready(Err(err.clone())),
        }
    }

    fn read_available(&mut self, buf: &mut BytesMut) -> Poll<Result<usize, TransportError>> {
        let mut state = lock(&self.state);
        if state.closed || !state.dialed {
            state.misuse.push("read before dial or after close".into());
            return Poll::Ready(Err(TransportError::Closed));
        }

        match state.inbound.pop_front() {
            Some(Inbound::Data(bytes)) if !bytes.is_empty() => {
                buf.extend_from_slice(&bytes);
                Poll::Ready(Ok(bytes.len()))
            },
            Some(Inbound::Data(_)) | None => Poll::Pending,
            Some(Inbound::Eof) => Poll::Ready(Ok(0)),
            Some(Inbound::Error(err)) => Poll::Ready(Err(err)),
        }
    }

    fn write_available(&mut self, data: &[u8]) -> Poll<Result<usize, TransportError>> {
        let mut state = lock(&self.state);
        if state.closed || !state.dialed {
            state.misuse.push("write before dial or after close".into());
            return Poll::Ready(Err(TransportError::Closed));
        }
        if let Some(err) = state.write_error.clone() {
            return Poll::Ready(Err(err));
        }

        let n = state.write_budget.map_or(data.len(), |budget| budget.min(data.len()));
        if n == 0 {
            return Poll::Pending;
        }
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= n;
        }
        state.written.extend_from_slice(&data[..n]);
        Poll::Ready(Ok(n))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.closes += 1;
        if state.closed {
            state.misuse.push("close called twice".into());
            return Err(TransportError::Closed);
        }
        state.closed = true;
        match state.close_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl SimTransportHandle {
    /// Queue more peer data.
    pub fn push_data(&self, bytes: impl Into<Bytes>) {
        lock(&self.state).inbound.push_back(Inbound::Data(bytes.into()));
    }

    /// Queue a peer close.
    pub fn push_eof(&self) {
        lock(&self.state).inbound.push_back(Inbound::Eof);
    }

    /// Queue a read error.
    pub fn push_error(&self, err: TransportError) {
        lock(&self.state).inbound.push_back(Inbound::Error(err));
    }

    /// Replace the write budget. `None` is unlimited.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        lock(&self.state).write_budget = budget;
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Number of `poll_dial` calls.
    pub fn dial_polls(&self) -> usize {
        lock(&self.state).dial_polls
    }

    /// Number of `close` calls.
    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Contract violations observed so far.
    pub fn misuse(&self) -> Vec<String> {
        lock(&self.state).misuse.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_follows_plan() {
        let (mut transport, handle) = SimTransport::new(TransportScript::connects_after(2));

        assert_eq!(transport.poll_dial(), Poll::Pending);
        assert_eq!(transport.poll_dial(), Poll::Ready(Ok(())));
        assert_eq!(handle.dial_polls(), 2);
    }

    #[test]
    fn write_budget_limits_acceptance() {
        let script = TransportScript::connects_after(1).with_write_budget(3);
        let (mut transport, handle) = SimTransport::new(script);
        assert_eq!(transport.poll_dial(), Poll::Ready(Ok(())));

        assert_eq!(transport.write_available(b"abcdef"), Poll::Ready(Ok(3)));
        assert_eq!(transport.write_available(b"def"), Poll::Pending);

        handle.set_write_budget(None);
        assert_eq!(transport.write_available(b"def"), Poll::Ready(Ok(3)));
        assert_eq!(handle.written(), b"abcdef");
    }

    #[test]
    fn misuse_is_recorded() {
        let (mut transport, handle) = SimTransport::new(TransportScript::never_connects());
        let mut buf = BytesMut::new();

        assert!(matches!(transport.read_available(&mut buf), Poll::Ready(Err(_))));
        assert_eq!(transport.close(), Ok(()));
        assert_eq!(transport.close(), Err(TransportError::Closed));

        assert_eq!(handle.misuse().len(), 2);
        assert_eq!(handle.closes(), 2);
    }

    #[test]
    fn scripted_reads_in_order() {
        let script = TransportScript::connects_after(1)
            .with_inbound(Inbound::Data(Bytes::from_static(b"ab")))
            .with_inbound(Inbound::Eof);
        let (mut transport, _handle) = SimTransport::new(script);
        let _ = transport.poll_dial();
        let mut buf = BytesMut::new();

        assert_eq!(transport.read_available(&mut buf), Poll::Ready(Ok(2)));
        assert_eq!(transport.read_available(&mut buf), Poll::Ready(Ok(0)));
        assert_eq!(transport.read_available(&mut buf), Poll::Pending);
        assert_eq!(&buf[..], b"ab");
    }
}
