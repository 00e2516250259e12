//! Chaotic transport wrapper for fault injection.
//!
//! Delegates to an inner [`Transport`] but randomly fails operations at a
//! configured rate. The RNG is seeded, so a failing chaos run replays exactly
//! with the same seed.

use std::task::Poll;

use bytes::BytesMut;
use plcloop_core::{Transport, TransportError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

const DEFAULT_SEED: u64 = 0x5EED_0FC4_A050_0000;

/// Transport wrapper that injects failures.
#[derive(Debug)]
pub struct ChaoticTransport<T: Transport> {
    inner: T,
    /// Probability in `[0.0, 1.0]` that an operation is disturbed.
    failure_rate: f64,
    rng: ChaCha8Rng,
    injected: usize,
}

impl<T: Transport> ChaoticTransport<T> {
    /// Wrap `inner` with the default seed. `failure_rate` is clamped to
    /// `[0.0, 1.0]`.
    pub fn new(inner: T, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Wrap `inner` with an explicit seed.
    pub fn with_seed(inner: T, failure_rate: f64, seed: u64) -> Self {
        let failure_rate = if failure_rate.is_nan() { 0.0 } else { failure_rate.clamp(0.0, 1.0) };
        Self { inner, failure_rate, rng: ChaCha8Rng::seed_from_u64(seed), injected: 0 }
    }

    /// Wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> usize {
        self.injected
    }

    fn should_fail(&mut self) -> bool {
        let fail = self.rng.gen_bool(self.failure_rate);
        if fail {
            self.injected += 1;
        }
        fail
    }
}

impl<T: Transport> Transport for ChaoticTransport<T> {
    fn poll_dial(&mut self) -> Poll<Result<(), TransportError>> {
        // Fault replaces the inner poll, so the inner transport never sees a
        // dial it did not complete.
        if self.should_fail() {
            trace!("chaos: dial refused");
            return Poll::Ready(Err(TransportError::Unreachable("chaos: dial refused".into())));
        }
        self.inner.poll_dial()
    }

    fn read_available(&mut self, buf: &mut BytesMut) -> Poll<Result<usize, TransportError>> {
        if self.should_fail() {
            if self.rng.gen_bool(0.5) {
                trace!("chaos: peer closed");
                return Poll::Ready(Ok(0));
            }
            trace!("chaos: read failed");
            return Poll::Ready(Err(TransportError::Io("chaos: read failed".into())));
        }
        self.inner.read_available(buf)
    }

    fn write_available(&mut self, data: &[u8]) -> Poll<Result<usize, TransportError>> {
        if self.should_fail() {
            if self.rng.gen_bool(0.5) {
                trace!("chaos: write stalled");
                return Poll::Pending;
            }
            trace!("chaos: write failed");
            return Poll::Ready(Err(TransportError::Unreachable("chaos: connection reset".into())));
        }
        self.inner.write_available(data)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // The inner close always runs so its resources are released.
        let result = self.inner.close();
        if self.should_fail() {
            trace!("chaos: close failed");
            return Err(TransportError::Io("chaos: close failed".into()));
        }
        result
    }
}
