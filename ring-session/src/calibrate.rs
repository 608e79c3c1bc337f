//! Clock calibration rounds driven from the session task
//!
//! A run settles, sends one request per round interval, settles again so the
//! last acks can arrive, then fits the clock model:
//!
//! ```text
//! Settling ──► Rounds (× rounds) ──► Draining ──► finish
//! ```

use std::sync::Arc;
use std::time::Duration;

use ring_core::calibration::{CalibrationConfig, CalibrationOutcome, CalibrationRun};
use ring_core::{Command, HostClock, ProtocolKind};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionResult;
use crate::transport::{LinkHandle, RingTransport};

/// Reply channel of a `calibrate_clock` call
pub(crate) type CalibrationReply = oneshot::Sender<SessionResult<CalibrationOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Settling,
    Rounds,
    Draining,
}

/// One calibration run in progress
pub(crate) struct ActiveCalibration {
    run: CalibrationRun,
    characteristic: &'static str,
    payload: Vec<u8>,
    phase: Phase,
    deadline: Instant,
    reply: CalibrationReply,
}

impl ActiveCalibration {
    /// Gives `reply` back if `request` is not a write
    pub(crate) fn start(
        kind: ProtocolKind,
        config: CalibrationConfig,
        request: Command,
        reply: CalibrationReply,
    ) -> Result<Self, CalibrationReply> {
        let (Some(endpoint), Some(payload)) = (request.endpoint(), request.payload()) else {
            return Err(reply);
        };
        info!(rounds = config.rounds, interval_ms = config.round_interval_ms, "clock calibration started");
        let settle = Duration::from_millis(config.settle_ms);
        Ok(Self {
            characteristic: kind.gatt().write_target(endpoint),
            payload: payload.to_vec(),
            run: CalibrationRun::new(config),
            phase: Phase::Settling,
            deadline: Instant::now() + settle,
            reply,
        })
    }

    /// When [`step`](Self::step) should run next
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Advance the run; returns true once it is ready to finish
    pub(crate) async fn step(
        &mut self,
        transport: &Arc<dyn RingTransport>,
        handle: &LinkHandle,
        clock: &Arc<dyn HostClock>,
    ) -> bool {
        if self.phase == Phase::Draining {
            return true;
        }

        let host_send = clock.now();
        match transport.write(handle, self.characteristic, &self.payload).await {
            Ok(()) => self.run.record_round(host_send, clock.now()),
            Err(e) => {
                warn!(error = %e, round = self.run.rounds_sent(), "calibration request failed");
                self.run.record_failed_round();
            }
        }

        let config = self.run.config();
        if self.run.is_complete() {
            debug!(rounds = self.run.rounds_sent(), "calibration rounds sent, draining acks");
            self.phase = Phase::Draining;
            self.deadline = Instant::now() + Duration::from_millis(config.settle_ms);
        } else {
            self.phase = Phase::Rounds;
            self.deadline = Instant::now() + Duration::from_millis(config.round_interval_ms);
        }
        false
    }

    /// Device clock reading from an ack, seconds
    pub(crate) fn on_ack(&mut self, device_time: f64) {
        if self.phase == Phase::Settling {
            debug!("calibration ack before the first round");
        }
        self.run.record_ack(device_time);
    }

    /// Fit the model and hand back the caller's reply channel
    pub(crate) fn finish(self) -> (CalibrationOutcome, CalibrationReply) {
        let outcome = self.run.finish();
        info!(
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected,
            fitted = outcome.model.is_some(),
            "clock calibration finished"
        );
        (outcome, self.reply)
    }
}
