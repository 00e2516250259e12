//! Virtual clock environment.
//!
//! `SimEnv` implements [`Environment`] with time that only moves when a test
//! calls [`SimEnv::advance`]. Clones share the same clock, so a test can keep
//! one clone while the [`System`](plcloop_core::System) owns another.

use std::{
    ops::Sub,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use plcloop_core::Environment;

/// Instant on the virtual clock: time elapsed since the clock was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Time since the start of the simulation.
    pub fn elapsed_since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Manually advanced clock.
#[derive(Debug, Clone, Default)]
pub struct SimEnv {
    now: Arc<Mutex<Duration>>,
}

impl SimEnv {
    /// Clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.saturating_add(by);
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(*self.now.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
