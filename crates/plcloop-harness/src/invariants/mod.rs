//! Invariant checking for deterministic simulation testing.
//!
//! Invariants are lifecycle properties that must hold after any sequence of
//! operations, not outcomes of one scenario. The harness captures a
//! [`SystemSnapshot`] (callback log plus live connection states) and runs
//! every registered [`Invariant`] against it.
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let snapshot = sim.snapshot();
//! registry.assert_all(&snapshot, "after shutdown");
//! ```

mod checks;
mod snapshot;

pub use checks::{
    DestroyedHandlesStale, DisconnectExactlyOnce, ErrorStateHasCode, OrderedLifecycle,
    SilentAfterClose, SingleDialOutcome, TransportContract,
};
pub use snapshot::{ConnectionSnapshot, SystemSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against a [`SystemSnapshot`].
pub trait Invariant: Send + Sync {
    /// Name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// Set of invariants run together.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every lifecycle invariant:
    /// - [`DisconnectExactlyOnce`]
    /// - [`SilentAfterClose`]
    /// - [`SingleDialOutcome`]
    /// - [`OrderedLifecycle`]
    /// - [`ErrorStateHasCode`]
    /// - [`DestroyedHandlesStale`]
    /// - [`TransportContract`]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(DisconnectExactlyOnce);
        registry.add(SilentAfterClose);
        registry.add(SingleDialOutcome);
        registry.add(OrderedLifecycle);
        registry.add(ErrorStateHasCode);
        registry.add(DestroyedHandlesStale);
        registry.add(TransportContract);
        registry
    }

    /// Add an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every invariant, collecting all violations.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Run every invariant, panicking with all violations if any fail.
    ///
    /// # Panics
    ///
    /// Panics if an invariant is violated.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Whether no invariants are registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
