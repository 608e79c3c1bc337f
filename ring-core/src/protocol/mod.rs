//! Wire protocol decoding for the three ring firmware families
//!
//! Notifications arrive as arbitrary byte chunks on one of two logical
//! channels. A [`Decoder`] owns all per-connection framing state and turns
//! chunks into typed [`DecodedMessage`]s:
//!
//! ```text
//! chunk ──► framing (resync / split / CRC) ──► RawFrame ──► variant decoder ──► DecodedMessage
//! ```
//!
//! Malformed input never produces an error. Corrupt frames are dropped and
//! counted in [`DecodeStats`].

pub mod commands;
pub mod framing;
pub mod legacy;
pub mod opcode_v2;
pub mod zhw;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::RingError;

pub use commands::{Command, Endpoint};
pub use framing::{CrcLayout, MarkerSync, OpcodeSplitter};
pub use opcode_v2::OpcodeV2Layout;

/// Device timestamp ticks per second
pub const DEVICE_TICK_HZ: f64 = 16384.0;

/// Firmware family spoken by a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// CRC-sealed frames with a marker-synced float IMU stream and SPP text commands
    Legacy,
    /// Opcode-prefixed messages with a 5-byte header and packed i16 IMU batches
    OpcodeV2,
    /// CRC-sealed 227-byte IMU frames with per-record microsecond timestamps
    Zhw,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 3] = [ProtocolKind::Legacy, ProtocolKind::OpcodeV2, ProtocolKind::Zhw];

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Legacy => "legacy",
            ProtocolKind::OpcodeV2 => "opcode-v2",
            ProtocolKind::Zhw => "zhw",
        }
    }

    /// Parse the name used in configuration files and on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// GATT characteristics this family uses
    pub fn gatt(&self) -> GattProfile {
        match self {
            ProtocolKind::Legacy => GattProfile {
                notify: &[
                    (gatt::LEGACY_NOTIFY, StreamChannel::Control),
                    (gatt::LEGACY_SPP_READ, StreamChannel::ImuStream),
                ],
                control_write: gatt::LEGACY_NOTIFY,
                stream_write: gatt::LEGACY_SPP_WRITE,
            },
            ProtocolKind::OpcodeV2 => GattProfile {
                notify: &[(gatt::OPCODE_V2_READ, StreamChannel::Control)],
                control_write: gatt::OPCODE_V2_WRITE,
                stream_write: gatt::OPCODE_V2_WRITE,
            },
            ProtocolKind::Zhw => GattProfile {
                notify: &[(gatt::ZHW_CHARACTERISTIC, StreamChannel::Control)],
                control_write: gatt::ZHW_CHARACTERISTIC,
                stream_write: gatt::ZHW_CHARACTERISTIC,
            },
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// GATT characteristic UUIDs
pub mod gatt {
    pub const LEGACY_NOTIFY: &str = "0000FF11-0000-1000-8000-00805F9B34FB";
    pub const LEGACY_SPP_READ: &str = "A6ED0202-D344-460A-8075-B9E8EC90D71B";
    pub const LEGACY_SPP_WRITE: &str = "A6ED0203-D344-460A-8075-B9E8EC90D71B";
    pub const OPCODE_V2_READ: &str = "BAE80011-4F05-4503-8E65-3AF1F7329D1F";
    pub const OPCODE_V2_WRITE: &str = "BAE80010-4F05-4503-8E65-3AF1F7329D1F";
    pub const ZHW_CHARACTERISTIC: &str = "C1D02505-2D20-400A-95D2-6A2F7BCA0C25";
}

/// Characteristic layout of one firmware family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    /// Characteristics to subscribe to, and the channel each one feeds
    pub notify: &'static [(&'static str, StreamChannel)],
    /// Destination of binary control commands
    pub control_write: &'static str,
    /// Destination of stream commands (SPP text on Legacy)
    pub stream_write: &'static str,
}

impl GattProfile {
    /// Channel fed by a notify characteristic, matched case-insensitively
    pub fn channel_for(&self, characteristic: &str) -> Option<StreamChannel> {
        self.notify
            .iter()
            .find(|(uuid, _)| uuid.eq_ignore_ascii_case(characteristic))
            .map(|(_, channel)| *channel)
    }

    /// Characteristic a command endpoint writes to
    pub fn write_target(&self, endpoint: Endpoint) -> &'static str {
        match endpoint {
            Endpoint::Control => self.control_write,
            Endpoint::Stream => self.stream_write,
        }
    }
}

/// Logical source of a notification chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    /// Legacy marker-synced IMU stream
    ImuStream,
    /// Everything else
    Control,
}

/// A frame whose boundaries (and CRC, where present) have been validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: ProtocolKind,
    pub bytes: Vec<u8>,
}

impl RawFrame {
    pub fn new(kind: ProtocolKind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Decoded messages
// ═══════════════════════════════════════════════════════════════════════════

/// Typed result of decoding one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodedMessage {
    ImuBatch(RawImuBatch),
    BatteryLevel(BatteryReport),
    TouchRaw(TouchRecord),
    GestureCode(GestureCode),
    CalibAck(CalibAck),
    DeviceInfo(DeviceInfo),
    Unknown(UnknownFrame),
}

impl DecodedMessage {
    /// Short label (for logging)
    pub fn label(&self) -> &'static str {
        match self {
            DecodedMessage::ImuBatch(_) => "imu_batch",
            DecodedMessage::BatteryLevel(_) => "battery_level",
            DecodedMessage::TouchRaw(_) => "touch_raw",
            DecodedMessage::GestureCode(_) => "gesture_code",
            DecodedMessage::CalibAck(_) => "calib_ack",
            DecodedMessage::DeviceInfo(_) => "device_info",
            DecodedMessage::Unknown(_) => "unknown",
        }
    }
}

/// IMU payload exactly as the firmware sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawImuBatch {
    Legacy(LegacyImuRecord),
    OpcodeV2(OpcodeV2ImuBatch),
    Zhw(ZhwImuBatch),
}

impl RawImuBatch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        match self {
            RawImuBatch::Legacy(_) => 1,
            RawImuBatch::OpcodeV2(batch) => batch.records.len(),
            RawImuBatch::Zhw(batch) => batch.records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One Legacy stream sample: SI floats plus the trailing device time bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyImuRecord {
    pub accel: [f32; 3],
    pub gyro: [f32; 3],
    pub trailer: [u8; 8],
}

/// Full-scale-range selector bits carried in the optional fifth header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsrBits {
    pub accel: u8,
    pub gyro: u8,
}

impl FsrBits {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            accel: (byte >> 2) & 0x03,
            gyro: byte & 0x03,
        }
    }
}

/// Packed Opcode-V2 IMU batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpcodeV2ImuBatch {
    /// Scale selector; absent means milli-g / milli-deg/s units
    pub fsr: Option<FsrBits>,
    /// `[ax, ay, az, gx, gy, gz]` raw counts per sample
    pub records: Vec<[i16; 6]>,
    /// Device tick timestamps of the first and last sample
    pub span_ticks: Option<(i32, i32)>,
}

/// One ZHW record: thousandths of SI units and a microsecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZhwImuRecord {
    pub accel: [i32; 3],
    pub gyro: [i32; 3],
    pub timestamp_us: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZhwImuBatch {
    pub records: Vec<ZhwImuRecord>,
}

/// Battery percentage, optionally with the device clock it was read at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryReport {
    pub level: u8,
    /// Device seconds counter (Legacy power/timestamp frames)
    pub device_time: Option<u32>,
}

/// Capacitive touch contact bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactBits {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl ContactBits {
    /// Extract from the Opcode-V2 contact byte (x = 0x02, y = 0x08, z = 0x20)
    pub fn from_byte(byte: u8) -> Self {
        Self {
            x: byte & 0x02 != 0,
            y: byte & 0x08 != 0,
            z: byte & 0x20 != 0,
        }
    }

    pub fn any(&self) -> bool {
        self.x || self.y || self.z
    }
}

/// Raw touch report from the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchRecord {
    /// Summary code from the touch query response
    Summary { code: u8 },
    /// Live contact state for the on-host gesture machine
    Contact(ContactBits),
}

/// Where a gesture code came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureSource {
    /// Opcode-V2 firmware-classified gesture
    DeviceClassified,
    /// Legacy touch-action report
    LegacyAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestureCode {
    pub source: GestureSource,
    pub code: u8,
}

/// Device clock reading in response to a calibration request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibAck {
    pub ticks: i32,
}

impl CalibAck {
    /// Device time in seconds
    pub fn seconds(&self) -> f64 {
        f64::from(self.ticks) / DEVICE_TICK_HZ
    }
}

/// Informational responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceInfo {
    SoftwareVersion(String),
    HardwareVersion(String),
    SensorState {
        chip_ok: bool,
        working: bool,
        step_count: u32,
    },
    TouchConfig {
        op_type: u8,
        path: u8,
        action: u8,
    },
}

/// A well-formed frame the decoder has no interpretation for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownFrame {
    pub kind: ProtocolKind,
    pub bytes: Vec<u8>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════

/// Reason a chunk of bytes did not become a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    CrcMismatch,
    Truncated,
    Overflow,
}

impl From<&RingError> for DropReason {
    /// Checksum failures count as CRC drops; every other error as framing
    fn from(error: &RingError) -> Self {
        match error {
            RingError::CrcMismatch { .. } => DropReason::CrcMismatch,
            _ => DropReason::Truncated,
        }
    }
}

/// Decoder counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeStats {
    pub frames_decoded: u64,
    pub crc_failures: u64,
    pub framing_errors: u64,
    pub unknown_messages: u64,
    pub bytes_discarded: u64,
    pub resyncs: u64,
}

impl DecodeStats {
    pub fn record_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::CrcMismatch => self.crc_failures += 1,
            DropReason::Truncated | DropReason::Overflow => self.framing_errors += 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Decoder
// ═══════════════════════════════════════════════════════════════════════════

/// Per-connection decoder
///
/// Holds the framing state for one variant. Not shared: the session driver
/// owns exactly one instance.
#[derive(Debug)]
pub struct Decoder {
    kind: ProtocolKind,
    legacy_stream: MarkerSync,
    splitter: OpcodeSplitter,
    stats: DecodeStats,
}

impl Decoder {
    pub fn new(kind: ProtocolKind, layout: OpcodeV2Layout) -> Self {
        Self {
            kind,
            legacy_stream: MarkerSync::new(),
            splitter: OpcodeSplitter::new(layout),
            stats: DecodeStats::default(),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    /// Bytes held across chunks (Legacy stream and Opcode-V2 continuation)
    pub fn buffered(&self) -> usize {
        self.legacy_stream.buffered() + self.splitter.buffered()
    }

    /// Drop all partial frames (after a reconnect)
    pub fn reset(&mut self) {
        self.legacy_stream.reset();
        self.splitter.reset();
    }

    /// Decode one notification chunk
    pub fn feed(&mut self, channel: StreamChannel, bytes: &[u8]) -> Vec<DecodedMessage> {
        if bytes.is_empty() {
            return Vec::new();
        }

        let messages: Vec<DecodedMessage> = match (self.kind, channel) {
            (ProtocolKind::Legacy, StreamChannel::ImuStream) => self
                .legacy_stream
                .push(bytes, &mut self.stats)
                .iter()
                .filter_map(|frame| legacy::decode_imu_frame(&frame.bytes))
                .collect(),
            (ProtocolKind::Legacy, StreamChannel::Control) => {
                framing::accept_sealed(ProtocolKind::Legacy, bytes, &mut self.stats)
                    .map(|frame| legacy::decode_control(&frame, &mut self.stats))
                    .into_iter()
                    .flatten()
                    .collect()
            }
            (ProtocolKind::OpcodeV2, _) => {
                let frames = self.splitter.push(bytes, &mut self.stats);
                frames
                    .into_iter()
                    .filter_map(|frame| opcode_v2::decode_message(&frame))
                    .collect()
            }
            (ProtocolKind::Zhw, _) => {
                framing::accept_sealed(ProtocolKind::Zhw, bytes, &mut self.stats)
                    .and_then(|frame| zhw::decode_frame(&frame, &mut self.stats))
                    .into_iter()
                    .collect()
            }
        };

        for message in &messages {
            if let DecodedMessage::Unknown(_) = message {
                self.stats.unknown_messages += 1;
            }
            trace!(kind = self.kind.name(), message = message.label(), "decoded");
        }
        self.stats.frames_decoded += messages.len() as u64;
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names_round_trip() {
        for kind in ProtocolKind::ALL {
            assert_eq!(ProtocolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ProtocolKind::from_name("bluetooth"), None);
    }

    #[test]
    fn test_protocol_serde_names() {
        let json = serde_json::to_string(&ProtocolKind::OpcodeV2).unwrap();
        assert_eq!(json, "\"opcode-v2\"");
    }

    #[test]
    fn test_gatt_channel_lookup() {
        let profile = ProtocolKind::Legacy.gatt();
        assert_eq!(
            profile.channel_for("a6ed0202-d344-460a-8075-b9e8ec90d71b"),
            Some(StreamChannel::ImuStream)
        );
        assert_eq!(profile.channel_for(gatt::LEGACY_NOTIFY), Some(StreamChannel::Control));
        assert_eq!(profile.channel_for(gatt::ZHW_CHARACTERISTIC), None);
        assert_eq!(profile.write_target(Endpoint::Stream), gatt::LEGACY_SPP_WRITE);
    }

    #[test]
    fn test_contact_bits() {
        let bits = ContactBits::from_byte(0x2A);
        assert!(bits.x && bits.y && bits.z);
        assert!(!ContactBits::from_byte(0x00).any());
        assert_eq!(ContactBits::from_byte(0x08), ContactBits { x: false, y: true, z: false });
    }

    #[test]
    fn test_fsr_bits() {
        let fsr = FsrBits::from_byte(0b0000_1110);
        assert_eq!(fsr.accel, 3);
        assert_eq!(fsr.gyro, 2);
    }

    #[test]
    fn test_calib_ack_seconds() {
        assert_eq!(CalibAck { ticks: 16384 * 3 }.seconds(), 3.0);
        assert_eq!(CalibAck { ticks: -8192 }.seconds(), -0.5);
    }

    #[test]
    fn test_drop_reason_from_check_error() {
        let mismatch = CrcLayout::SEALED.check(&[0x24, 0, 0, 7]).unwrap_err();
        assert_eq!(DropReason::from(&mismatch), DropReason::CrcMismatch);

        let short = CrcLayout::SEALED.check(&[0x24]).unwrap_err();
        assert_eq!(DropReason::from(&short), DropReason::Truncated);
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut decoder = Decoder::new(ProtocolKind::Zhw, OpcodeV2Layout::default());
        assert!(decoder.feed(StreamChannel::Control, &[]).is_empty());
        assert_eq!(decoder.stats(), &DecodeStats::default());
    }

    #[test]
    fn test_v2_battery_through_decoder() {
        let mut decoder = Decoder::new(ProtocolKind::OpcodeV2, OpcodeV2Layout::default());
        let messages = decoder.feed(StreamChannel::Control, &[0x00, 0x00, 0x12, 0x00, 64]);
        assert_eq!(
            messages,
            vec![DecodedMessage::BatteryLevel(BatteryReport { level: 64, device_time: None })]
        );
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_zero_imu_length_still_advances() {
        let layout = OpcodeV2Layout {
            imu_frame_len: 0,
            max_pending: 0,
        };
        let mut decoder = Decoder::new(ProtocolKind::OpcodeV2, layout);
        let messages = decoder.feed(StreamChannel::Control, &[0, 0, 0x40, 0x06, 1, 2, 3, 4]);

        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], DecodedMessage::ImuBatch(_)));
        assert!(matches!(messages[1], DecodedMessage::Unknown(_)));
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.stats().unknown_messages, 1);
    }
}
