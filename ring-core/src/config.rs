//! Configuration for the ring protocol engine

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationConfig;
use crate::error::{Result, RingError};
use crate::gesture::GestureConfig;
use crate::imu::ImuConfig;
use crate::protocol::{OpcodeV2Layout, ProtocolKind};

/// Per-device engine configuration
///
/// Missing sections take their defaults. Calibration defaults follow the
/// configured protocol, including a `max_latency` left out of a partial
/// calibration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RingConfigFile")]
pub struct RingConfig {
    /// Firmware family of the device
    pub protocol: ProtocolKind,

    /// Opcode-V2 message sizes
    pub opcode_v2: OpcodeV2Layout,

    /// IMU normalization
    pub imu: ImuConfig,

    /// Touch gesture timing
    pub gesture: GestureConfig,

    /// Clock calibration runs
    pub calibration: CalibrationConfig,
}

fn default_protocol() -> ProtocolKind { ProtocolKind::OpcodeV2 }

/// On-disk shape of [`RingConfig`]
#[derive(Deserialize)]
struct RingConfigFile {
    #[serde(default = "default_protocol")]
    protocol: ProtocolKind,
    #[serde(default)]
    opcode_v2: OpcodeV2Layout,
    #[serde(default)]
    imu: ImuConfig,
    #[serde(default)]
    gesture: GestureConfig,
    #[serde(default)]
    calibration: Option<CalibrationSection>,
}

#[derive(Deserialize)]
struct CalibrationSection {
    #[serde(default)]
    max_latency: Option<f64>,
    #[serde(flatten)]
    rest: CalibrationConfig,
}

impl From<RingConfigFile> for RingConfig {
    fn from(file: RingConfigFile) -> Self {
        let tuned = CalibrationConfig::for_protocol(file.protocol);
        let calibration = match file.calibration {
            Some(section) => CalibrationConfig {
                max_latency: section.max_latency.unwrap_or(tuned.max_latency),
                ..section.rest
            },
            None => tuned,
        };
        Self {
            protocol: file.protocol,
            opcode_v2: file.opcode_v2,
            imu: file.imu,
            gesture: file.gesture,
            calibration,
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::for_protocol(default_protocol())
    }
}

impl RingConfig {
    /// Defaults tuned for one firmware family
    pub fn for_protocol(protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            opcode_v2: OpcodeV2Layout::default(),
            imu: ImuConfig::default(),
            gesture: GestureConfig::default(),
            calibration: CalibrationConfig::for_protocol(protocol),
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.opcode_v2.imu_frame_len < 4 {
            return Err(RingError::config("opcode_v2.imu_frame_len must cover the 4-byte header"));
        }
        if self.opcode_v2.max_pending < self.opcode_v2.imu_frame_len {
            return Err(RingError::config(
                "opcode_v2.max_pending must hold at least one IMU message",
            ));
        }

        let gesture = &self.gesture;
        for (name, value) in [
            ("gesture.tap_interval", gesture.tap_interval),
            ("gesture.tick_interval", gesture.tick_interval),
            ("gesture.long_touch", gesture.long_touch),
            ("gesture.stale_timeout", gesture.stale_timeout),
            ("gesture.double_tap_window", gesture.double_tap_window),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(RingError::config(format!("{name} must be a positive number of seconds")));
            }
        }
        if gesture.tick_interval > gesture.tap_interval {
            return Err(RingError::config("gesture.tick_interval must not exceed tap_interval"));
        }

        if self.imu.gyro_bias.iter().any(|b| !b.is_finite()) {
            return Err(RingError::config("imu.gyro_bias must be finite"));
        }
        if self.imu.imu_freq == 0 {
            return Err(RingError::config("imu.imu_freq must be positive"));
        }

        self.calibration.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_defaults_are_valid() {
        for kind in ProtocolKind::ALL {
            let config = RingConfig::for_protocol(kind);
            assert_eq!(config.protocol, kind);
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = RingConfig::from_json_str(
            r#"{ "protocol": "zhw", "gesture": { "hold_confirm_frames": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.protocol, ProtocolKind::Zhw);
        assert_eq!(config.gesture.hold_confirm_frames, 3);
        assert_eq!(config.gesture.tap_interval, 0.5);
        assert_eq!(config.opcode_v2.imu_frame_len, 133);
        assert_eq!(config.imu.gz_smoothing_batch_sizes, vec![8, 10]);
    }

    #[test]
    fn test_calibration_defaults_follow_protocol() {
        let config = RingConfig::from_json_str(r#"{ "protocol": "zhw" }"#).unwrap();
        assert_eq!(config.calibration, CalibrationConfig::for_protocol(ProtocolKind::Zhw));
        assert_eq!(config.calibration.max_latency, 0.014);

        let config = RingConfig::from_json_str(
            r#"{ "protocol": "legacy", "calibration": { "rounds": 50 } }"#,
        )
        .unwrap();
        assert_eq!(config.calibration.rounds, 50);
        assert_eq!(config.calibration.max_latency, 0.014);

        let config = RingConfig::from_json_str(
            r#"{ "protocol": "zhw", "calibration": { "max_latency": 0.02 } }"#,
        )
        .unwrap();
        assert_eq!(config.calibration.max_latency, 0.02);
        assert_eq!(config.calibration.rounds, 300);

        let config = RingConfig::from_json_str("{}").unwrap();
        assert_eq!(config.calibration, CalibrationConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RingConfig::from_json_str(r#"{ "gesture": { "tap_interval": 0 } }"#).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Config);

        let err = RingConfig::from_json_str(r#"{ "opcode_v2": { "imu_frame_len": 200, "max_pending": 100 } }"#)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_malformed_json() {
        let err = RingConfig::from_json_str("{ protocol: ").unwrap_err();
        assert_eq!(err.error_code(), "JSON_ERROR");
    }

    #[test]
    fn test_load_missing_file() {
        let err = RingConfig::load("/nonexistent/ring.json").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Io);
    }
}
