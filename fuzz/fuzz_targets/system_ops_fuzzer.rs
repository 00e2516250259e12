//! Fuzz target for System operation sequences
//!
//! Applies arbitrary connect/disconnect/destroy/tick/time/shutdown sequences
//! to a simulated System, optionally with transport fault injection.
//!
//! # Invariants
//!
//! - The System NEVER panics; misuse returns a SystemError
//! - The live handle set matches the model after every operation
//! - Every lifecycle invariant holds after every operation
//! - Shutdown leaves every connection in a terminal state

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use plcloop_harness::{InvariantRegistry, Operation, World};

#[derive(Debug, Arbitrary)]
struct Scenario {
    /// Failure rate 0-9 maps to 0%-90%; 10 and above disables chaos
    failure_rate_tenth: u8,
    /// Seed for the chaotic transports
    chaos_seed: u64,
    operations: Vec<Operation>,
}

fuzz_target!(|scenario: Scenario| {
    let world = if scenario.failure_rate_tenth < 10 {
        World::with_chaos(f64::from(scenario.failure_rate_tenth) / 10.0, scenario.chaos_seed)
    } else {
        World::new()
    };
    let Ok(mut world) = world else {
        return;
    };
    let invariants = InvariantRegistry::standard();

    for (i, op) in scenario.operations.iter().take(256).enumerate() {
        let _ = world.apply(op);
        invariants.assert_all(&world.snapshot(), &format!("after op {i} {op:?}"));
        assert!(world.model_matches(), "live set diverged after op {i} {op:?}");
    }

    if world.apply(&Operation::Shutdown).is_ok() {
        invariants.assert_all(&world.snapshot(), "after shutdown");
        for &conn in world.live() {
            let state = world.system().connection_state(conn);
            assert!(state.as_ref().is_ok_and(|s| s.is_terminal()), "{conn} not terminal: {state:?}");
        }
    }
});
