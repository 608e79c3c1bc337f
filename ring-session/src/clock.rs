//! Host clock driven by the tokio timer

use ring_core::HostClock;
use tokio::time::Instant;

/// Seconds since construction, on tokio's clock
///
/// Follows paused and advanced time in tests, so gesture windows and
/// calibration rounds line up with `tokio::time::sleep`.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for TokioClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn name(&self) -> &'static str {
        "tokio"
    }
}
