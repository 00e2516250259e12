//! Time source abstraction.
//!
//! The engine never reads the clock directly. [`System`](crate::system::System)
//! asks its environment for `now()` once per tick and passes that instant down
//! to every connection, so timeouts can be driven by a virtual clock in tests
//! and by [`std::time::Instant`] in production.

use std::{ops::Sub, time::Duration};

/// Abstract environment providing monotonic time.
///
/// # Invariants
///
/// - `now()` never goes backwards within one environment.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type of this environment.
    ///
    /// Production uses `std::time::Instant`; simulations use a virtual
    /// instant that only moves when the test advances it.
    type Instant: Copy + Ord + Send + Sync + Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;
}

/// Production environment backed by the OS monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn system_env_time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = env.now();

        assert!(t2 > t1, "Time should advance");
        assert!(t2 - t1 >= Duration::from_millis(5));
    }
}
