//! Session state and events published to consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ring_core::calibration::CalibrationReport;
use ring_core::protocol::{BatteryReport, DeviceInfo, UnknownFrame};
use ring_core::{DecodeStats, ImuSample, TouchEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected { streaming: bool },
    Disconnecting,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, SessionState::Connected { streaming: true })
    }
}

/// Everything a session publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RingEvent {
    StateChanged {
        device_index: usize,
        state: SessionState,
    },
    Imu {
        device_index: usize,
        samples: Vec<ImuSample>,
    },
    Touch {
        device_index: usize,
        touch: TouchEvent,
    },
    /// Opcode-V2 touch summary code
    TouchSummary {
        device_index: usize,
        code: u8,
        timestamp: f64,
    },
    Battery {
        device_index: usize,
        report: BatteryReport,
        timestamp: f64,
    },
    DeviceInfo {
        device_index: usize,
        info: DeviceInfo,
    },
    /// Device clock reading, device seconds
    CalibAck {
        device_index: usize,
        device_time: f64,
        timestamp: f64,
    },
    Calibrated {
        device_index: usize,
        report: CalibrationReport,
    },
    Unknown {
        device_index: usize,
        frame: UnknownFrame,
    },
}

impl RingEvent {
    pub fn device_index(&self) -> usize {
        match self {
            RingEvent::StateChanged { device_index, .. }
            | RingEvent::Imu { device_index, .. }
            | RingEvent::Touch { device_index, .. }
            | RingEvent::TouchSummary { device_index, .. }
            | RingEvent::Battery { device_index, .. }
            | RingEvent::DeviceInfo { device_index, .. }
            | RingEvent::CalibAck { device_index, .. }
            | RingEvent::Calibrated { device_index, .. }
            | RingEvent::Unknown { device_index, .. } => *device_index,
        }
    }
}

/// Counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_decoded: u64,
    pub crc_failures: u64,
    pub framing_errors: u64,
    pub unknown_messages: u64,
    pub bytes_discarded: u64,
    pub resyncs: u64,
    pub commands_sent: u64,
    pub write_failures: u64,
    /// Events skipped by subscribers that fell behind
    pub events_lagged: u64,
}

impl SessionStats {
    /// Decoder counters accumulated so far
    pub fn decode_counters(&self) -> DecodeStats {
        DecodeStats {
            frames_decoded: self.frames_decoded,
            crc_failures: self.crc_failures,
            framing_errors: self.framing_errors,
            unknown_messages: self.unknown_messages,
            bytes_discarded: self.bytes_discarded,
            resyncs: self.resyncs,
        }
    }

    /// Set the decoder counters to `baseline` plus those of the current link
    pub fn absorb(&mut self, baseline: &DecodeStats, decode: &DecodeStats) {
        self.frames_decoded = baseline.frames_decoded + decode.frames_decoded;
        self.crc_failures = baseline.crc_failures + decode.crc_failures;
        self.framing_errors = baseline.framing_errors + decode.framing_errors;
        self.unknown_messages = baseline.unknown_messages + decode.unknown_messages;
        self.bytes_discarded = baseline.bytes_discarded + decode.bytes_discarded;
        self.resyncs = baseline.resyncs + decode.resyncs;
    }
}

/// Receiver side of a session's event stream
///
/// When the subscriber falls more than the channel capacity behind, the
/// oldest events are skipped and counted; the session never waits for it.
pub struct EventSubscription {
    rx: broadcast::Receiver<RingEvent>,
    lagged: Arc<AtomicU64>,
}

impl EventSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<RingEvent>, lagged: Arc<AtomicU64>) -> Self {
        Self { rx, lagged }
    }

    /// Next event, or `None` once the session is gone
    pub async fn recv(&mut self) -> Option<RingEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<RingEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&self, skipped: u64) {
        debug!(skipped, "subscriber lagged, oldest events dropped");
        self.lagged.fetch_add(skipped, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring_core::TouchKind;

    #[test]
    fn test_absorb_adds_to_earlier_links() {
        let mut stats = SessionStats {
            commands_sent: 4,
            ..SessionStats::default()
        };
        let first_link = DecodeStats {
            frames_decoded: 10,
            crc_failures: 1,
            ..DecodeStats::default()
        };
        stats.absorb(&DecodeStats::default(), &first_link);
        assert_eq!(stats.decode_counters(), first_link);

        let baseline = stats.decode_counters();
        let second_link = DecodeStats {
            frames_decoded: 3,
            bytes_discarded: 7,
            ..DecodeStats::default()
        };
        stats.absorb(&baseline, &second_link);
        assert_eq!(stats.frames_decoded, 13);
        assert_eq!(stats.crc_failures, 1);
        assert_eq!(stats.bytes_discarded, 7);
        assert_eq!(stats.commands_sent, 4);
    }

    fn touch(timestamp: f64) -> RingEvent {
        RingEvent::Touch {
            device_index: 1,
            touch: TouchEvent {
                kind: TouchKind::Tap,
                timestamp,
            },
        }
    }

    #[test]
    fn test_state_helpers() {
        assert!(SessionState::Connected { streaming: false }.is_connected());
        assert!(!SessionState::Connected { streaming: false }.is_streaming());
        assert!(SessionState::Connected { streaming: true }.is_streaming());
        assert!(!SessionState::Connecting.is_connected());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(touch(2.5)).unwrap();
        assert_eq!(json["event"], "touch");
        assert_eq!(json["device_index"], 1);
        assert_eq!(json["touch"]["kind"], "tap");

        let state = RingEvent::StateChanged {
            device_index: 0,
            state: SessionState::Connected { streaming: true },
        };
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["state"]["state"], "connected");
        assert_eq!(json["state"]["streaming"], true);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let (tx, rx) = broadcast::channel(2);
        let lagged = Arc::new(AtomicU64::new(0));
        let mut subscription = EventSubscription::new(rx, lagged.clone());

        for i in 0..5 {
            tx.send(touch(f64::from(i))).unwrap();
        }

        let first = subscription.recv().await.unwrap();
        assert_eq!(first, touch(3.0));
        assert_eq!(subscription.try_recv(), Some(touch(4.0)));
        assert_eq!(subscription.try_recv(), None);
        assert_eq!(lagged.load(Ordering::Relaxed), 3);

        drop(tx);
        assert_eq!(subscription.recv().await, None);
    }
}
