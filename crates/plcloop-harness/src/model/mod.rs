//! Model-based testing.
//!
//! Generated [`Operation`] sequences drive a [`World`], which tracks the set
//! of live handles it expects the System to hold and checks lifecycle
//! invariants after every step.

mod operation;
mod world;

pub use operation::{Operation, Slot, Target};
pub use world::{SETTLE_STEP, World, scripted_driver};
