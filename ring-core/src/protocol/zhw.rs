//! ZHW firmware: CRC-sealed frames of eight IMU records
//!
//! Type `0x19` frames carry IMU data; every other type uses the Legacy EDPT
//! control layout and is decoded by [`legacy::decode_control`].

use super::commands::{Command, Endpoint};
use super::legacy::{self, seal_edpt};
use super::{
    DecodeStats, DecodedMessage, DropReason, RawFrame, RawImuBatch, ZhwImuBatch, ZhwImuRecord,
};

/// Frame type of a batched IMU frame
pub const IMU_FRAME_TYPE: u8 = 0x19;

/// Frame type of the IMU control command
pub const IMU_CONTROL_TYPE: u8 = 0x1B;

pub const RECORDS_PER_FRAME: usize = 8;
pub const RECORD_LEN: usize = 28;
pub const FRAME_LEN: usize = 3 + RECORDS_PER_FRAME * RECORD_LEN;

/// Device ticks for a record timestamp
pub fn micros_to_ticks(timestamp_us: u32) -> f64 {
    f64::from(timestamp_us) / 1e6 * super::DEVICE_TICK_HZ
}

/// Interpret one CRC-valid frame
pub fn decode_frame(frame: &RawFrame, stats: &mut DecodeStats) -> Option<DecodedMessage> {
    match frame.bytes.first() {
        Some(&IMU_FRAME_TYPE) => decode_imu(&frame.bytes, stats),
        Some(_) => legacy::decode_control(frame, stats),
        None => None,
    }
}

fn decode_imu(bytes: &[u8], stats: &mut DecodeStats) -> Option<DecodedMessage> {
    if bytes.len() < FRAME_LEN {
        stats.record_drop(DropReason::Truncated);
        return None;
    }

    let records = bytes[3..FRAME_LEN]
        .chunks_exact(RECORD_LEN)
        .map(|record| {
            let field = |i: usize| {
                let offset = i * 4;
                [record[offset], record[offset + 1], record[offset + 2], record[offset + 3]]
            };
            ZhwImuRecord {
                accel: [0, 1, 2].map(|i| i32::from_le_bytes(field(i))),
                gyro: [3, 4, 5].map(|i| i32::from_le_bytes(field(i))),
                timestamp_us: u32::from_le_bytes(field(6)),
            }
        })
        .collect();

    Some(DecodedMessage::ImuBatch(RawImuBatch::Zhw(ZhwImuBatch { records })))
}

/// Start batched IMU reporting
pub fn open_imu() -> Command {
    let mut frame = vec![0u8; 8];
    frame[3] = 0x01;
    frame[4] = 0x01;
    Command::write("open_imu", Endpoint::Control, seal_edpt(IMU_CONTROL_TYPE, frame))
}

pub fn stream_enable_sequence() -> Vec<Command> {
    vec![open_imu()]
}
