//! Outbound commands
//!
//! A [`Command`] is what the session's command queue holds: either bytes to
//! write to one of the ring's two write endpoints, or the disconnect sentinel
//! that ends the session. Variant-specific builders live next to their
//! decoders; the functions here pick the right one for a [`ProtocolKind`].

use serde::{Deserialize, Serialize};

use super::{legacy, opcode_v2, zhw, ProtocolKind};

/// Write endpoint on the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// Binary control characteristic
    Control,
    /// Stream characteristic (SPP text on Legacy; same as control elsewhere)
    Stream,
}

/// Queued outbound action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Write {
        label: String,
        endpoint: Endpoint,
        payload: Vec<u8>,
    },
    /// Close the link and stop the session
    Disconnect,
}

impl Command {
    pub fn write(label: impl Into<String>, endpoint: Endpoint, payload: Vec<u8>) -> Self {
        Command::Write {
            label: label.into(),
            endpoint,
            payload,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Command::Write { label, .. } => Some(label),
            Command::Disconnect => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Command::Write { payload, .. } => Some(payload),
            Command::Disconnect => None,
        }
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        match self {
            Command::Write { endpoint, .. } => Some(*endpoint),
            Command::Disconnect => None,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Command::Disconnect)
    }
}

/// Commands that start IMU and touch reporting
pub fn stream_enable_sequence(kind: ProtocolKind, imu_freq: u32) -> Vec<Command> {
    match kind {
        ProtocolKind::Legacy => legacy::stream_enable_sequence(imu_freq),
        ProtocolKind::OpcodeV2 => opcode_v2::stream_enable_sequence(),
        ProtocolKind::Zhw => zhw::stream_enable_sequence(),
    }
}

/// Battery level query
///
/// EDPT variants carry host time in the same request.
pub fn battery_query(kind: ProtocolKind, unix_secs: u32) -> Command {
    match kind {
        ProtocolKind::Legacy | ProtocolKind::Zhw => legacy::query_power_sync_ts(unix_secs),
        ProtocolKind::OpcodeV2 => opcode_v2::get_battery_level(),
    }
}

/// Device clock request, where the firmware supports one
pub fn calibration_request(kind: ProtocolKind) -> Option<Command> {
    match kind {
        ProtocolKind::OpcodeV2 => Some(opcode_v2::calibration_request()),
        ProtocolKind::Legacy | ProtocolKind::Zhw => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_sentinel() {
        let command = Command::Disconnect;
        assert!(command.is_disconnect());
        assert_eq!(command.payload(), None);
        assert_eq!(command.label(), None);
    }

    #[test]
    fn test_sequences_per_variant() {
        assert_eq!(stream_enable_sequence(ProtocolKind::Legacy, 100).len(), 6);
        assert_eq!(stream_enable_sequence(ProtocolKind::OpcodeV2, 100).len(), 2);
        assert_eq!(stream_enable_sequence(ProtocolKind::Zhw, 100), vec![zhw::open_imu()]);
    }

    #[test]
    fn test_battery_query_per_variant() {
        assert_eq!(battery_query(ProtocolKind::OpcodeV2, 0).payload().unwrap().len(), 4);
        assert_eq!(battery_query(ProtocolKind::Legacy, 0).payload().unwrap().len(), 21);
    }

    #[test]
    fn test_calibration_support() {
        assert!(calibration_request(ProtocolKind::OpcodeV2).is_some());
        assert!(calibration_request(ProtocolKind::Legacy).is_none());
    }

    #[test]
    fn test_command_serializes() {
        let json = serde_json::to_string(&opcode_v2::get_touch()).unwrap();
        assert!(json.contains("\"get_touch\""));
        assert!(json.contains("\"control\""));
    }
}
