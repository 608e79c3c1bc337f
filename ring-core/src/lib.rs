//! # Ring Core - wearable ring protocol engine
//!
//! Decodes the notification streams of three generations of smart-ring
//! firmware and turns them into calibrated motion and touch data:
//!
//! - **Framing**: marker resynchronization, Opcode-V2 message splitting and
//!   CRC-16/MODBUS integrity checks over arbitrarily chunked notifications
//! - **Decoding**: typed messages for IMU batches, battery, touch, device
//!   info and calibration acknowledgements
//! - **IMU normalization**: scaling, axis remapping and per-sample device
//!   timestamps in SI units
//! - **Gestures**: the touch state machine producing tap, double-tap,
//!   long-touch and release events
//! - **Clock calibration**: a linear device-to-host clock model fitted from
//!   request/acknowledgement round trips
//!
//! Everything here is synchronous and transport-agnostic. Connection
//! handling lives in `ring-session`.
//!
//! ## Example
//!
//! ```rust
//! use ring_core::{crc, Decoder, DecodedMessage, OpcodeV2Layout, ProtocolKind, StreamChannel};
//!
//! let mut decoder = Decoder::new(ProtocolKind::Legacy, OpcodeV2Layout::default());
//!
//! // Battery report on the control channel: type, CRC, payload
//! let mut frame = vec![0u8; 21];
//! frame[15] = 87;
//! crc::seal(&mut frame, 1, 2, 3);
//!
//! let messages = decoder.feed(StreamChannel::Control, &frame);
//! match &messages[0] {
//!     DecodedMessage::BatteryLevel(report) => assert_eq!(report.level, 87),
//!     other => panic!("unexpected {other:?}"),
//! }
//! assert_eq!(decoder.stats().crc_failures, 0);
//! ```

pub mod calibration;
pub mod config;
pub mod crc;
pub mod error;
pub mod gesture;
pub mod imu;
pub mod protocol;
pub mod relay;
pub mod timing;

// Re-export main types
pub use calibration::{
    CalibrationConfig, CalibrationOutcome, CalibrationReport, CalibrationRun,
    CalibrationSample, CalibrationWarning, ClockModel,
};
pub use config::RingConfig;
pub use error::{ErrorCategory, Result, RingError};
pub use gesture::{GestureConfig, GestureMachine, GestureState, TapClass, TouchEvent, TouchKind};
pub use imu::{AxisRemap, ImuConfig, ImuNormalizer, ImuSample, TimeBase};
pub use protocol::{
    Command, DecodeStats, DecodedMessage, Decoder, Endpoint, OpcodeV2Layout, ProtocolKind,
    RawImuBatch, StreamChannel,
};
pub use relay::{RelayDemux, RelayFraming, RelayItem, RelaySignal};
pub use timing::{HostClock, ManualClock, MonotonicClock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_control_pipeline() {
        let mut decoder = Decoder::new(ProtocolKind::Legacy, OpcodeV2Layout::default());
        let mut gestures = GestureMachine::new(GestureConfig::default());

        // Touch action frame carrying a device-classified double tap
        let mut frame = vec![0x24, 0, 0, 2, 12];
        crc::seal(&mut frame, 1, 2, 3);

        let events: Vec<TouchEvent> = decoder
            .feed(StreamChannel::Control, &frame)
            .into_iter()
            .flat_map(|message| match message {
                DecodedMessage::GestureCode(code) => gestures.on_gesture_code(code, 1.0),
                _ => Vec::new(),
            })
            .collect();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TouchKind::DoubleTap);
    }
}
