//! Simulated world: one [`System`] on virtual time with a scripted mock
//! driver, plus the bookkeeping invariant checks need.
//!
//! The world keeps its own model of which handles are live. Connections only
//! leave the table through `destroy_connection`, so after every operation
//! the model must equal [`System::connections`].

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use plcloop_core::{
    ConnectionHandle, ConnectionState, System, SystemConfig, SystemError, TransportError,
};
use tracing::debug;

use super::operation::{Operation, Slot};
use crate::{
    invariants::{InvariantRegistry, SystemSnapshot, Violation},
    mock_driver::{MockDriver, MockProbe, MockProtocol},
    recorder::CallbackRecorder,
    sim_env::SimEnv,
    sim_transport::{Inbound, TransportScript},
};

/// Virtual time added per tick by [`World::settle`].
pub const SETTLE_STEP: Duration = Duration::from_millis(100);

/// Mock driver serving every host a [`Target`](super::Target) names.
pub fn scripted_driver() -> MockDriver {
    MockDriver::new("mock")
        .with_host("plc-slow", TransportScript::connects_after(3))
        .with_host("plc-down", TransportScript::unreachable())
        .with_host("plc-silent", TransportScript::never_connects())
        .with_host(
            "plc-flaky",
            TransportScript::connects_after(1)
                .with_inbound(Inbound::Data(Bytes::from_static(b"\x02hi")))
                .with_inbound(Inbound::Eof),
        )
        .with_host(
            "plc-garbage",
            TransportScript::connects_after(1)
                .with_inbound(Inbound::Data(Bytes::from_static(b"\x00"))),
        )
        .with_host("plc-stall", TransportScript::connects_after(1).with_write_budget(2))
        .with_host(
            "plc-badclose",
            TransportScript::connects_after(1)
                .with_close_error(TransportError::Io("close failed".into())),
        )
}

/// A System under test.
#[derive(Debug)]
pub struct World {
    system: System<SimEnv>,
    env: SimEnv,
    recorder: CallbackRecorder,
    probe: MockProbe,
    live: Vec<ConnectionHandle>,
    protocols: HashMap<ConnectionHandle, MockProtocol>,
    destroyed: Vec<ConnectionHandle>,
}

impl World {
    /// World with default configuration and no fault injection.
    ///
    /// # Errors
    ///
    /// Propagates System construction failures.
    pub fn new() -> Result<Self, SystemError> {
        Self::build(SystemConfig::default(), scripted_driver())
    }

    /// World whose transports fail at `rate`, seeded by `seed`.
    ///
    /// # Errors
    ///
    /// Propagates System construction failures.
    pub fn with_chaos(rate: f64, seed: u64) -> Result<Self, SystemError> {
        Self::build(SystemConfig::default(), scripted_driver().with_chaos(rate, seed))
    }

    /// World with an explicit configuration and driver.
    ///
    /// # Errors
    ///
    /// Propagates System construction and driver registration failures.
    pub fn build(config: SystemConfig, driver: MockDriver) -> Result<Self, SystemError> {
        let env = SimEnv::new();
        let mut system = System::with_env(env.clone(), config)?;
        let recorder = CallbackRecorder::new();
        recorder.install(&mut system);

        let probe = driver.probe();
        system.register_driver(driver)?;
        system.init()?;

        Ok(Self {
            system,
            env,
            recorder,
            probe,
            live: Vec::new(),
            protocols: HashMap::new(),
            destroyed: Vec::new(),
        })
    }

    /// Apply one operation.
    ///
    /// Slot-addressed operations on an empty world do nothing.
    ///
    /// # Errors
    ///
    /// Whatever the System returned for the operation.
    pub fn apply(&mut self, op: &Operation) -> Result<(), SystemError> {
        debug!(?op, "apply");
        match *op {
            Operation::Connect { target } => {
                let handle = self.system.connect(target.uri())?;
                self.live.push(handle);
                if let Some(created) = self.probe.last() {
                    self.protocols.insert(handle, created.protocol);
                }
                Ok(())
            },
            Operation::Disconnect { slot } => match self.pick(slot) {
                Some(handle) => self.system.disconnect(handle),
                None => Ok(()),
            },
            Operation::Destroy { slot } => match self.pick(slot) {
                Some(handle) => self.destroy(handle),
                None => Ok(()),
            },
            Operation::Send { slot, len } => {
                if let Some(protocol) = self.pick(slot).and_then(|h| self.protocols.get(&h)) {
                    protocol.send(&vec![0xAB; usize::from(len.max(1))]);
                }
                Ok(())
            },
            Operation::Tick => self.system.tick(),
            Operation::AdvanceTime { millis } => {
                self.env.advance(Duration::from_millis(u64::from(millis)));
                Ok(())
            },
            Operation::Shutdown => self.system.shutdown(),
        }
    }

    /// Destroy `handle` and record it so invariants can probe it later.
    ///
    /// # Errors
    ///
    /// Whatever `destroy_connection` returned.
    pub fn destroy(&mut self, handle: ConnectionHandle) -> Result<(), SystemError> {
        self.system.destroy_connection(handle)?;
        self.live.retain(|&h| h != handle);
        self.protocols.remove(&handle);
        self.destroyed.push(handle);
        Ok(())
    }

    fn pick(&self, slot: Slot) -> Option<ConnectionHandle> {
        if self.live.is_empty() {
            return None;
        }
        self.live.get(usize::from(slot) % self.live.len()).copied()
    }

    /// Tick `n` times without moving the clock.
    ///
    /// # Errors
    ///
    /// First tick error.
    pub fn tick_n(&mut self, n: usize) -> Result<(), SystemError> {
        for _ in 0..n {
            self.system.tick()?;
        }
        Ok(())
    }

    /// Tick, advancing the clock by [`SETTLE_STEP`] each time, until nothing
    /// is dialing or draining or `max_ticks` ran. Returns the ticks used.
    ///
    /// # Errors
    ///
    /// First tick error.
    pub fn settle(&mut self, max_ticks: usize) -> Result<usize, SystemError> {
        for ticks in 0..max_ticks {
            if !self.in_transition() {
                return Ok(ticks);
            }
            self.system.tick()?;
            self.env.advance(SETTLE_STEP);
        }
        Ok(max_ticks)
    }

    fn in_transition(&self) -> bool {
        self.live.iter().any(|&h| {
            matches!(
                self.system.connection_state(h),
                Ok(ConnectionState::Connecting | ConnectionState::Disconnecting)
            )
        })
    }

    /// Snapshot for invariant checks.
    pub fn snapshot(&self) -> SystemSnapshot {
        let misuse = self
            .probe
            .connections()
            .iter()
            .flat_map(|c| c.transport.misuse().into_iter().map(move |m| format!("{}: {m}", c.target)))
            .collect();
        SystemSnapshot::capture(&self.system, &self.recorder, &self.destroyed, misuse)
    }

    /// Run the standard invariants.
    ///
    /// # Errors
    ///
    /// Every violation found.
    pub fn check_invariants(&self) -> Result<(), Vec<Violation>> {
        InvariantRegistry::standard().check_all(&self.snapshot())
    }

    /// Whether the model of live handles matches the System.
    pub fn model_matches(&self) -> bool {
        self.system.connections() == self.live
    }

    /// System under test.
    pub fn system(&self) -> &System<SimEnv> {
        &self.system
    }

    /// Mutable System under test.
    pub fn system_mut(&mut self) -> &mut System<SimEnv> {
        &mut self.system
    }

    /// Virtual clock.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Callback log.
    pub fn recorder(&self) -> &CallbackRecorder {
        &self.recorder
    }

    /// Driver observer.
    pub fn probe(&self) -> &MockProbe {
        &self.probe
    }

    /// Live handles in creation order.
    pub fn live(&self) -> &[ConnectionHandle] {
        &self.live
    }

    /// Destroyed handles.
    pub fn destroyed(&self) -> &[ConnectionHandle] {
        &self.destroyed
    }
}
