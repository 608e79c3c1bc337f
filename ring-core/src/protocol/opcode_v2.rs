//! Opcode-V2 firmware: `[b0, b1, group, sub, body…]` messages
//!
//! Several messages may share one notification and a long IMU message may be
//! split across two. The declared length of each message is a function of its
//! opcode; [`message_length`] is what the splitter walks the buffer with.

use serde::{Deserialize, Serialize};

use super::commands::{Command, Endpoint};
use super::{
    BatteryReport, CalibAck, ContactBits, DecodedMessage, DeviceInfo, FsrBits,
    GestureCode, GestureSource, OpcodeV2ImuBatch, RawFrame, RawImuBatch, TouchRecord,
    UnknownFrame,
};

/// `(group, sub)` opcode pairs
pub mod opcode {
    pub const IMU: (u8, u8) = (0x40, 0x06);
    pub const IMU_CLOSE: (u8, u8) = (0x40, 0x00);
    pub const TOUCH_SUMMARY: (u8, u8) = (0x61, 0x00);
    pub const TOUCH_CONTACT: (u8, u8) = (0x61, 0x01);
    pub const TOUCH_GESTURE: (u8, u8) = (0x61, 0x02);
    pub const BATTERY_LEVEL: (u8, u8) = (0x12, 0x00);
    pub const BATTERY_STATUS: (u8, u8) = (0x12, 0x01);
    pub const CALIBRATION: (u8, u8) = (0x99, 0x00);
    pub const SOFTWARE_VERSION: (u8, u8) = (0x11, 0x00);
    pub const HARDWARE_VERSION: (u8, u8) = (0x11, 0x01);
    pub const AUDIO: (u8, u8) = (0x71, 0x00);
    pub const NFC: (u8, u8) = (0x82, 0x00);
}

const HEADER_LEN: usize = 4;
const RECORD_LEN: usize = 12;
const TRAILER_LEN: usize = 8;
const CONTACT_BYTE: usize = 6;

const SHORT_MESSAGE_LEN: usize = 5;
const CONTACT_MESSAGE_LEN: usize = 23;
const CALIBRATION_MESSAGE_LEN: usize = 8;

/// Firmware-generation dependent sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcodeV2Layout {
    /// Declared length of one IMU message
    #[serde(default = "default_imu_frame_len")]
    pub imu_frame_len: usize,

    /// Upper bound on bytes held while waiting for a continuation
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_imu_frame_len() -> usize {
    133
}

fn default_max_pending() -> usize {
    4 * default_imu_frame_len()
}

impl Default for OpcodeV2Layout {
    fn default() -> Self {
        Self {
            imu_frame_len: default_imu_frame_len(),
            max_pending: default_max_pending(),
        }
    }
}

impl OpcodeV2Layout {
    /// Layout for a given IMU message length, with the pending bound scaled to it
    ///
    /// Lengths shorter than the opcode header are raised to the header length.
    pub fn with_imu_frame_len(imu_frame_len: usize) -> Self {
        let imu_frame_len = imu_frame_len.max(HEADER_LEN);
        Self {
            imu_frame_len,
            max_pending: 4 * imu_frame_len,
        }
    }
}

/// Declared length of the message starting at `bytes[0]`
///
/// `None` while fewer than four header bytes are available. Opcodes without a
/// fixed shape claim everything that remains. Never shorter than the header, so
/// a walk over the buffer always advances.
pub fn message_length(bytes: &[u8], layout: &OpcodeV2Layout) -> Option<usize> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let length = match (bytes[2], bytes[3]) {
        opcode::IMU => layout.imu_frame_len.max(HEADER_LEN),
        opcode::TOUCH_SUMMARY | opcode::TOUCH_GESTURE | opcode::BATTERY_LEVEL => {
            SHORT_MESSAGE_LEN
        }
        opcode::TOUCH_CONTACT => CONTACT_MESSAGE_LEN,
        opcode::CALIBRATION => CALIBRATION_MESSAGE_LEN,
        _ => bytes.len(),
    };
    Some(length)
}

/// Interpret one complete message
pub fn decode_message(frame: &RawFrame) -> Option<DecodedMessage> {
    let bytes = &frame.bytes;
    if bytes.len() < HEADER_LEN {
        return None;
    }

    let message = match (bytes[2], bytes[3]) {
        opcode::IMU => DecodedMessage::ImuBatch(RawImuBatch::OpcodeV2(decode_imu(bytes))),
        opcode::TOUCH_SUMMARY => DecodedMessage::TouchRaw(TouchRecord::Summary {
            code: byte_or_zero(bytes, 4),
        }),
        opcode::TOUCH_CONTACT => DecodedMessage::TouchRaw(TouchRecord::Contact(
            ContactBits::from_byte(byte_or_zero(bytes, CONTACT_BYTE)),
        )),
        opcode::TOUCH_GESTURE => DecodedMessage::GestureCode(GestureCode {
            source: GestureSource::DeviceClassified,
            code: byte_or_zero(bytes, 4),
        }),
        opcode::BATTERY_LEVEL => DecodedMessage::BatteryLevel(BatteryReport {
            level: byte_or_zero(bytes, 4),
            device_time: None,
        }),
        opcode::CALIBRATION => DecodedMessage::CalibAck(CalibAck {
            ticks: read_i32(bytes, 4)?,
        }),
        opcode::SOFTWARE_VERSION => {
            DecodedMessage::DeviceInfo(DeviceInfo::SoftwareVersion(version_string(bytes)))
        }
        opcode::HARDWARE_VERSION => {
            DecodedMessage::DeviceInfo(DeviceInfo::HardwareVersion(version_string(bytes)))
        }
        _ => DecodedMessage::Unknown(UnknownFrame {
            kind: frame.kind,
            bytes: bytes.clone(),
        }),
    };
    Some(message)
}

/// Unpack an IMU message into raw records
///
/// The header is one byte longer on odd-length messages; that byte selects
/// the full-scale range. A body that is not a whole number of records ends in
/// the batch's start and end device ticks.
pub fn decode_imu(bytes: &[u8]) -> OpcodeV2ImuBatch {
    let header_len = HEADER_LEN + bytes.len() % 2;
    let fsr = (header_len > HEADER_LEN).then(|| FsrBits::from_byte(bytes[HEADER_LEN]));
    let body = bytes.get(header_len..).unwrap_or(&[]);

    let (records_region, span_ticks) =
        if body.len() % RECORD_LEN != 0 && body.len() >= TRAILER_LEN {
            let split = body.len() - TRAILER_LEN;
            let start = read_i32(body, split);
            let end = read_i32(body, split + 4);
            (&body[..split], start.zip(end))
        } else {
            (body, None)
        };

    let records = records_region
        .chunks_exact(RECORD_LEN)
        .map(|record| {
            let mut values = [0i16; 6];
            for (value, pair) in values.iter_mut().zip(record.chunks_exact(2)) {
                *value = i16::from_le_bytes([pair[0], pair[1]]);
            }
            values
        })
        .collect();

    OpcodeV2ImuBatch {
        fsr,
        records,
        span_ticks,
    }
}

fn byte_or_zero(bytes: &[u8], index: usize) -> u8 {
    bytes.get(index).copied().unwrap_or(0)
}

fn read_i32(bytes: &[u8], offset: usize) -> Option<i32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn version_string(bytes: &[u8]) -> String {
    let text = bytes.get(HEADER_LEN..).unwrap_or(&[]);
    String::from_utf8_lossy(text)
        .trim_end_matches('\0')
        .to_string()
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbound commands
// ═══════════════════════════════════════════════════════════════════════════

fn request(label: &str, (group, sub): (u8, u8), arg: Option<u8>) -> Command {
    let mut payload = vec![0x00, 0x00, group, sub];
    payload.extend(arg);
    Command::write(label, Endpoint::Control, payload)
}

pub fn get_software_version() -> Command {
    request("get_software_version", opcode::SOFTWARE_VERSION, None)
}

pub fn get_hardware_version() -> Command {
    request("get_hardware_version", opcode::HARDWARE_VERSION, None)
}

pub fn get_battery_level() -> Command {
    request("get_battery_level", opcode::BATTERY_LEVEL, None)
}

pub fn get_battery_status() -> Command {
    request("get_battery_status", opcode::BATTERY_STATUS, None)
}

pub fn open_6axis_imu() -> Command {
    request("open_6axis_imu", opcode::IMU, None)
}

pub fn close_6axis_imu() -> Command {
    request("close_6axis_imu", opcode::IMU_CLOSE, None)
}

pub fn get_touch() -> Command {
    request("get_touch", opcode::TOUCH_SUMMARY, None)
}

pub fn set_audio(open: bool) -> Command {
    let label = if open { "open_audio" } else { "close_audio" };
    request(label, opcode::AUDIO, Some(u8::from(open)))
}

pub fn get_nfc() -> Command {
    request("get_nfc", opcode::NFC, None)
}

/// Ask the ring for its tick counter
pub fn calibration_request() -> Command {
    request("calibration_request", opcode::CALIBRATION, None)
}

pub fn stream_enable_sequence() -> Vec<Command> {
    vec![open_6axis_imu(), get_battery_level()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolKind;

    fn frame(bytes: Vec<u8>) -> RawFrame {
        RawFrame::new(ProtocolKind::OpcodeV2, bytes)
    }

    fn decode(bytes: Vec<u8>) -> Option<DecodedMessage> {
        decode_message(&frame(bytes))
    }

    fn imu_message(fsr: Option<u8>, records: &[[i16; 6]], span: Option<(i32, i32)>) -> Vec<u8> {
        let mut bytes = vec![0x00, 0x00, 0x40, 0x06];
        bytes.extend(fsr);
        for record in records {
            for value in record {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        if let Some((start, end)) = span {
            bytes.extend_from_slice(&start.to_le_bytes());
            bytes.extend_from_slice(&end.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_message_lengths() {
        let layout = OpcodeV2Layout::default();
        assert_eq!(message_length(&[0, 0, 0x40], &layout), None);
        assert_eq!(message_length(&[0, 0, 0x40, 0x06], &layout), Some(133));
        assert_eq!(message_length(&[0, 0, 0x61, 0x01, 0], &layout), Some(23));
        assert_eq!(message_length(&[0, 0, 0x99, 0x00], &layout), Some(8));
        assert_eq!(message_length(&[0, 0, 0x12, 0x00, 1, 2, 3], &layout), Some(5));
        assert_eq!(message_length(&[0, 0, 0x11, 0x00, b'v', b'1'], &layout), Some(6));
        assert_eq!(message_length(&[0, 0, 0x55, 0x55, 9, 9, 9], &layout), Some(7));
    }

    #[test]
    fn test_imu_length_never_below_header() {
        let layout = OpcodeV2Layout {
            imu_frame_len: 0,
            max_pending: 0,
        };
        assert_eq!(message_length(&[0, 0, 0x40, 0x06, 1, 2], &layout), Some(HEADER_LEN));

        let layout = OpcodeV2Layout::with_imu_frame_len(1);
        assert_eq!(layout.imu_frame_len, HEADER_LEN);
        assert_eq!(layout.max_pending, 4 * HEADER_LEN);
    }

    #[test]
    fn test_full_size_imu_message() {
        let records: Vec<[i16; 6]> = (0..10).map(|i| [i, -i, 1000, 0, 0, i * 2]).collect();
        let bytes = imu_message(Some(0b0101), &records, Some((1000, 1900)));
        assert_eq!(bytes.len(), 133);

        let batch = decode_imu(&bytes);
        assert_eq!(batch.fsr, Some(FsrBits { accel: 1, gyro: 1 }));
        assert_eq!(batch.records, records);
        assert_eq!(batch.span_ticks, Some((1000, 1900)));
    }

    #[test]
    fn test_even_message_has_no_fsr_byte() {
        let records = [[100i16, 200, 300, -100, -200, -300]; 8];
        let batch = decode_imu(&imu_message(None, &records, None));
        assert_eq!(batch.fsr, None);
        assert_eq!(batch.span_ticks, None);
        assert_eq!(batch.records.len(), 8);
    }

    #[test]
    fn test_touch_messages() {
        assert_eq!(
            decode(vec![0, 0, 0x61, 0x00, 7]),
            Some(DecodedMessage::TouchRaw(TouchRecord::Summary { code: 7 }))
        );

        let mut contact = vec![0u8; 23];
        contact[2] = 0x61;
        contact[3] = 0x01;
        contact[6] = 0x08;
        assert_eq!(
            decode(contact),
            Some(DecodedMessage::TouchRaw(TouchRecord::Contact(ContactBits {
                x: false,
                y: true,
                z: false,
            })))
        );

        assert_eq!(
            decode(vec![0, 0, 0x61, 0x02, 3]),
            Some(DecodedMessage::GestureCode(GestureCode {
                source: GestureSource::DeviceClassified,
                code: 3,
            }))
        );
    }

    #[test]
    fn test_calibration_ack() {
        let mut bytes = vec![0, 0, 0x99, 0x00];
        bytes.extend_from_slice(&(16384_i32 * 5).to_le_bytes());
        let Some(DecodedMessage::CalibAck(ack)) = decode(bytes) else {
            panic!("expected a calibration ack");
        };
        assert_eq!(ack.seconds(), 5.0);
    }

    #[test]
    fn test_version_strings() {
        let mut bytes = vec![0, 0, 0x11, 0x01];
        bytes.extend_from_slice(b"HW-2.1\0\0");
        assert_eq!(
            decode(bytes),
            Some(DecodedMessage::DeviceInfo(DeviceInfo::HardwareVersion("HW-2.1".into())))
        );
    }

    #[test]
    fn test_unknown_opcode() {
        let message = decode(vec![0, 0, 0x62, 0x01, 1]);
        assert!(matches!(message, Some(DecodedMessage::Unknown(_))));
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(open_6axis_imu().payload(), Some(&[0, 0, 0x40, 0x06][..]));
        assert_eq!(close_6axis_imu().payload(), Some(&[0, 0, 0x40, 0x00][..]));
        assert_eq!(set_audio(true).payload(), Some(&[0, 0, 0x71, 0x00, 0x01][..]));
        assert_eq!(set_audio(false).payload(), Some(&[0, 0, 0x71, 0x00, 0x00][..]));
        assert_eq!(calibration_request().payload(), Some(&[0, 0, 0x99, 0x00][..]));
        assert_eq!(get_nfc().payload(), Some(&[0, 0, 0x82, 0x00][..]));
        let sequence = stream_enable_sequence();
        assert_eq!(sequence[0], open_6axis_imu());
        assert_eq!(sequence[1], get_battery_level());
    }
}
