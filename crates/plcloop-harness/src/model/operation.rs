//! Operations for model-based testing.
//!
//! proptest (in tests) and `libFuzzer` (through `arbitrary`) generate sequences
//! of these and apply them to a [`World`](super::World).

use arbitrary::Arbitrary;

/// Index into the world's live connection list, taken modulo its length.
pub type Slot = u8;

/// Kind of device a `Connect` dials. Each maps to a host the world's mock
/// driver has a script for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub enum Target {
    /// Connects on the first tick.
    Reachable,
    /// Connects on the third tick.
    Slow,
    /// Refuses the dial.
    Unreachable,
    /// Dial never completes; only the dial timeout ends it.
    Silent,
    /// Connects, sends one frame, then closes.
    Flaky,
    /// Connects, then sends a malformed frame.
    Garbage,
    /// Connects but accepts only two bytes ever.
    Stalled,
    /// Connects but close fails.
    BadClose,
    /// Connection string that does not parse.
    Malformed,
    /// Scheme no driver serves.
    UnknownScheme,
}

impl Target {
    /// Connection string for this target.
    pub fn uri(self) -> &'static str {
        match self {
            Self::Reachable => "mock://plc-ok:102",
            Self::Slow => "mock://plc-slow:102",
            Self::Unreachable => "mock://plc-down:102",
            Self::Silent => "mock://plc-silent:102",
            Self::Flaky => "mock://plc-flaky:102",
            Self::Garbage => "mock://plc-garbage:102",
            Self::Stalled => "mock://plc-stall:102",
            Self::BadClose => "mock://plc-badclose:102",
            Self::Malformed => "mock:/missing-slash",
            Self::UnknownScheme => "ads://plc-ok",
        }
    }

    /// Every target, for strategies.
    pub const ALL: [Self; 10] = [
        Self::Reachable,
        Self::Slow,
        Self::Unreachable,
        Self::Silent,
        Self::Flaky,
        Self::Garbage,
        Self::Stalled,
        Self::BadClose,
        Self::Malformed,
        Self::UnknownScheme,
    ];
}

/// One step of a generated scenario.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum Operation {
    /// Request a connection.
    Connect {
        /// Device to dial.
        target: Target,
    },

    /// Request a graceful disconnect.
    Disconnect {
        /// Connection to close.
        slot: Slot,
    },

    /// Destroy a connection.
    Destroy {
        /// Connection to destroy.
        slot: Slot,
    },

    /// Queue an application frame on a connection.
    Send {
        /// Connection to send on.
        slot: Slot,
        /// Payload length.
        len: u8,
    },

    /// Run one tick.
    Tick,

    /// Advance virtual time.
    AdvanceTime {
        /// Milliseconds to advance.
        millis: u16,
    },

    /// Gracefully shut down every connection.
    Shutdown,
}
