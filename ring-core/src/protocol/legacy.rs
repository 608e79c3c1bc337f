//! Legacy firmware: EDPT control frames and the marker-synced float stream
//!
//! Control frames (notify characteristic) and outbound EDPT commands share
//! one layout, `[type, crc_lo, crc_hi, payload…]` with the CRC over
//! `bytes[3..]`. Streaming and configuration use `\r\n`-terminated text
//! commands on the SPP characteristic.

use tracing::debug;

use super::commands::{Command, Endpoint};
use super::framing::{CrcLayout, LEGACY_FRAME_LEN};
use super::{
    BatteryReport, DecodeStats, DecodedMessage, DeviceInfo, DropReason, GestureCode,
    GestureSource, LegacyImuRecord, RawFrame, RawImuBatch, UnknownFrame,
};

/// EDPT opcodes
pub mod op {
    pub const QUERY_POWER_SYNC_TS: u8 = 0x00;
    pub const SYS_CONF: u8 = 0x03;
    pub const ACTION_CLASS: u8 = 0x04;
    pub const GSENSOR_STATE: u8 = 0x0A;
    pub const HR_BO_STATE: u8 = 0x0E;
    pub const SYS_DEBUG_BIT: u8 = 0x12;
    pub const TOUCH_ACTION: u8 = 0x24;
}

/// Touch-action codes reported with `op_type == 2`
pub mod action {
    pub const TAP: u8 = 11;
    pub const DOUBLE_TAP: u8 = 12;
    pub const TRIPLE_TAP: u8 = 13;
    pub const LONG_TOUCH: u8 = 14;
    pub const RELEASE: u8 = 15;
}

const POWER_FRAME_LEN: usize = 21;
const BATTERY_INDEX: usize = 15;

/// Interpret one CRC-valid 36-byte stream frame
pub fn decode_imu_frame(frame: &[u8]) -> Option<DecodedMessage> {
    if frame.len() < LEGACY_FRAME_LEN {
        return None;
    }
    let value = |i: usize| {
        let offset = 4 + i * 4;
        f32::from_le_bytes([frame[offset], frame[offset + 1], frame[offset + 2], frame[offset + 3]])
    };
    let mut trailer = [0u8; 8];
    trailer.copy_from_slice(&frame[28..36]);

    Some(DecodedMessage::ImuBatch(RawImuBatch::Legacy(LegacyImuRecord {
        accel: [value(0), value(1), value(2)],
        gyro: [value(3), value(4), value(5)],
        trailer,
    })))
}

/// Interpret one CRC-valid control frame
///
/// Returns `None` only when a known frame type is too short for its layout.
pub fn decode_control(frame: &RawFrame, stats: &mut DecodeStats) -> Option<DecodedMessage> {
    let bytes = &frame.bytes;
    let Some(&frame_type) = bytes.first() else {
        stats.record_drop(DropReason::Truncated);
        return None;
    };

    match frame_type {
        op::QUERY_POWER_SYNC_TS => {
            if bytes.len() < POWER_FRAME_LEN {
                debug!(len = bytes.len(), "legacy power frame too short");
                stats.record_drop(DropReason::Truncated);
                return None;
            }
            let device_time = u32::from_be_bytes([bytes[17], bytes[18], bytes[19], bytes[20]]);
            Some(DecodedMessage::BatteryLevel(BatteryReport {
                level: bytes[BATTERY_INDEX],
                device_time: Some(device_time),
            }))
        }
        op::GSENSOR_STATE => {
            if bytes.len() < 7 {
                stats.record_drop(DropReason::Truncated);
                return None;
            }
            let packed = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
            Some(DecodedMessage::DeviceInfo(DeviceInfo::SensorState {
                chip_ok: packed & 0x1 != 0,
                working: (packed >> 1) & 0x1 != 0,
                step_count: (packed >> 8) & 0x00FF_FFFF,
            }))
        }
        op::TOUCH_ACTION => {
            if bytes.len() < 5 {
                stats.record_drop(DropReason::Truncated);
                return None;
            }
            let op_type = bytes[3] & 0x03;
            let path = (bytes[3] >> 2) & 0x03;
            let action = bytes[4];
            if op_type == 2 {
                Some(DecodedMessage::GestureCode(GestureCode {
                    source: GestureSource::LegacyAction,
                    code: action,
                }))
            } else {
                Some(DecodedMessage::DeviceInfo(DeviceInfo::TouchConfig {
                    op_type,
                    path,
                    action,
                }))
            }
        }
        _ => Some(DecodedMessage::Unknown(UnknownFrame {
            kind: frame.kind,
            bytes: bytes.clone(),
        })),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbound EDPT commands
// ═══════════════════════════════════════════════════════════════════════════

/// Zero-filled frame of `len` bytes with `frame_type` set and the CRC sealed
pub(crate) fn seal_edpt(frame_type: u8, mut frame: Vec<u8>) -> Vec<u8> {
    if let Some(first) = frame.first_mut() {
        *first = frame_type;
    }
    CrcLayout::SEALED.seal(&mut frame);
    frame
}

/// Battery level query that also pushes host time to the ring
pub fn query_power_sync_ts(unix_secs: u32) -> Command {
    let mut frame = vec![0u8; POWER_FRAME_LEN];
    frame[17..21].copy_from_slice(&unix_secs.to_le_bytes());
    Command::write(
        "query_power_sync_ts",
        Endpoint::Control,
        seal_edpt(op::QUERY_POWER_SYNC_TS, frame),
    )
}

pub fn query_system_conf() -> Command {
    Command::write(
        "query_system_conf",
        Endpoint::Control,
        seal_edpt(op::SYS_CONF, vec![0u8; 4]),
    )
}

pub fn query_hrbo_state() -> Command {
    let mut frame = vec![0u8; 11];
    frame[9] = 10;
    Command::write(
        "query_hrbo_state",
        Endpoint::Control,
        seal_edpt(op::HR_BO_STATE, frame),
    )
}

/// Query action classification for a selector bitmask (24 bits after shifting)
pub fn query_action_by_sel_bit(sel_bit: u32) -> Command {
    let shifted = sel_bit << 1;
    let mut frame = vec![0u8; 6];
    frame[3..6].copy_from_slice(&shifted.to_le_bytes()[..3]);
    Command::write(
        "query_action_by_sel_bit",
        Endpoint::Control,
        seal_edpt(op::ACTION_CLASS, frame),
    )
}

pub fn set_debug_hrbo(enable: bool) -> Command {
    let mut frame = vec![0u8; 4];
    frame[3] = if enable { 0x03 } else { 0x01 };
    Command::write(
        "set_debug_hrbo",
        Endpoint::Control,
        seal_edpt(op::SYS_DEBUG_BIT, frame),
    )
}

/// Read or configure touch action reporting
///
/// `get_or_set` and `path` are two-bit fields; higher bits are masked off.
pub fn touch_action(get_or_set: u8, path: u8, action: u8) -> Command {
    let mut frame = vec![0u8; 5];
    frame[3] = ((path & 0x03) << 2) | (get_or_set & 0x03);
    frame[4] = action;
    Command::write(
        "touch_action",
        Endpoint::Control,
        seal_edpt(op::TOUCH_ACTION, frame),
    )
}

/// SPP text command, `\r\n` appended
pub fn text(line: &str) -> Command {
    let mut payload = Vec::with_capacity(line.len() + 2);
    payload.extend_from_slice(line.as_bytes());
    payload.extend_from_slice(b"\r\n");
    Command::write(line.to_string(), Endpoint::Stream, payload)
}

/// Commands that switch the ring into float IMU streaming
pub fn stream_enable_sequence(imu_freq: u32) -> Vec<Command> {
    vec![
        touch_action(1, 1, 0),
        text("ENSPP"),
        text("ENFAST"),
        text("TPOPS=1,1,1"),
        text(&format!("IMUARG=0,0,0,{imu_freq}")),
        text("ENDB6AX"),
    ]
}
