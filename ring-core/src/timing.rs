//! Host clock sources
//!
//! Every timestamp the engine stamps on a sample, a touch or a calibration
//! round comes from a [`HostClock`]. Production code uses
//! [`MonotonicClock`]; tests drive a [`ManualClock`] so gesture windows and
//! calibration latencies are deterministic.
//!
//! ```rust
//! use ring_core::timing::{HostClock, ManualClock};
//!
//! let clock = ManualClock::new(10.0);
//! clock.advance(0.25);
//! assert_eq!(clock.now(), 10.25);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic host time in seconds
pub trait HostClock: Send + Sync {
    /// Seconds since an arbitrary, fixed origin
    fn now(&self) -> f64;

    /// Clock name (for logging)
    fn name(&self) -> &'static str;
}

/// Wall-independent clock backed by `std::time::Instant`
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn name(&self) -> &'static str {
        "monotonic"
    }
}

/// Manually stepped clock for tests
///
/// Stores the current time as `f64` bits so it can be shared between the
/// test body and the component under test without a lock.
#[derive(Debug)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start` seconds
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }

    /// Move the clock forward
    pub fn advance(&self, seconds: f64) {
        let now = self.now();
        self.set(now + seconds);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}
