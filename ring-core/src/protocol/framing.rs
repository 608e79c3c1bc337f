//! Frame synchronization on raw notification bytes.
//!
//! Each protocol variant delimits frames differently:
//!
//! ```text
//! Legacy IMU stream (marker resync, fixed 36 bytes)
//! ┌──────┬──────┬────────┬────────┬──────────────────────┬──────────────┐
//! │ 0xAA │ 0x55 │ crc lo │ crc hi │ 6 × f32 LE (24 bytes)│ time (8)     │
//! └──────┴──────┴────────┴────────┴──────────────────────┴──────────────┘
//!                          CRC over bytes[4..36]
//!
//! Sealed control / ZHW frames (one notification = one frame)
//! ┌──────┬────────┬────────┬──────────────────────────────┐
//! │ type │ crc lo │ crc hi │ payload                      │
//! └──────┴────────┴────────┴──────────────────────────────┘
//!                            CRC over bytes[3..]
//!
//! Opcode-V2 (concatenated messages, no CRC)
//! ┌─────┬─────┬───────┬─────┬──────────────┐┌─────┬─────┬───────┬─────┬───
//! │ b0  │ b1  │ group │ sub │ body …       ││ b0  │ b1  │ group │ sub │ …
//! └─────┴─────┴───────┴─────┴──────────────┘└─────┴─────┴───────┴─────┴───
//! ```
//!
//! The synchronizers here only decide *where* frames are; interpreting them
//! is left to the variant decoders.

use tracing::{debug, trace};

use crate::crc;
use crate::error::Result;
use super::opcode_v2::{self, OpcodeV2Layout};
use super::{DecodeStats, DropReason, ProtocolKind, RawFrame};

/// Two-byte sync marker that opens every Legacy IMU frame
pub const LEGACY_MARKER: [u8; 2] = [0xAA, 0x55];

/// Fixed Legacy IMU frame length
pub const LEGACY_FRAME_LEN: usize = 36;

/// Position of the embedded CRC and the range it covers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrcLayout {
    /// Index of the low CRC byte
    pub low: usize,
    /// Index of the high CRC byte
    pub high: usize,
    /// First byte covered by the checksum
    pub start: usize,
}

impl CrcLayout {
    /// Legacy IMU frames: CRC at [2..4], covers [4..]
    pub const LEGACY_IMU: CrcLayout = CrcLayout { low: 2, high: 3, start: 4 };

    /// Sealed control and ZHW frames: CRC at [1..3], covers [3..]
    pub const SEALED: CrcLayout = CrcLayout { low: 1, high: 2, start: 3 };

    /// Verify a frame against this layout
    pub fn verify(&self, frame: &[u8]) -> bool {
        crc::verify(frame, self.low, self.high, self.start)
    }

    /// Verify a frame, reporting why it fails
    pub fn check(&self, frame: &[u8]) -> Result<()> {
        crc::check(frame, self.low, self.high, self.start)
    }

    /// Write the checksum into a frame
    pub fn seal(&self, frame: &mut [u8]) {
        crc::seal(frame, self.low, self.high, self.start)
    }
}

/// Marker-based resynchronizer for the Legacy IMU stream
///
/// Bytes accumulate until a marker is found and a whole frame is buffered.
/// A frame failing its CRC is not skipped wholesale: exactly one byte is
/// dropped and the marker search restarts, so a false marker inside payload
/// data cannot swallow the real frame that follows it.
#[derive(Debug, Default)]
pub struct MarkerSync {
    buffer: Vec<u8>,
}

impl MarkerSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held while waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Append received bytes and extract every CRC-valid frame
    pub fn push(&mut self, bytes: &[u8], stats: &mut DecodeStats) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            match find_marker(&self.buffer) {
                Some(0) => {}
                Some(position) => {
                    trace!(skipped = position, "legacy stream: skipping to marker");
                    stats.bytes_discarded += position as u64;
                    self.buffer.drain(..position);
                }
                None => {
                    // Keep a trailing first marker byte; its partner may be in the next chunk
                    let keep = usize::from(self.buffer.last() == Some(&LEGACY_MARKER[0]));
                    let discard = self.buffer.len() - keep;
                    if discard > 0 {
                        stats.bytes_discarded += discard as u64;
                        self.buffer.drain(..discard);
                    }
                    break;
                }
            }

            if self.buffer.len() < LEGACY_FRAME_LEN {
                break;
            }

            let candidate = &self.buffer[..LEGACY_FRAME_LEN];
            if let Err(e) = CrcLayout::LEGACY_IMU.check(candidate) {
                debug!(error = %e, "legacy stream: resyncing one byte later");
                stats.record_drop(DropReason::from(&e));
                stats.resyncs += 1;
                stats.bytes_discarded += 1;
                self.buffer.drain(..1);
            } else {
                frames.push(RawFrame::new(ProtocolKind::Legacy, candidate.to_vec()));
                self.buffer.drain(..LEGACY_FRAME_LEN);
            }
        }

        frames
    }
}

fn find_marker(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == LEGACY_MARKER)
}

/// Accept a sealed single-notification frame if its CRC holds
///
/// Frames shorter than the CRC header are counted as framing drops.
pub fn accept_sealed(
    kind: ProtocolKind,
    bytes: &[u8],
    stats: &mut DecodeStats,
) -> Option<RawFrame> {
    if let Err(e) = CrcLayout::SEALED.check(bytes) {
        debug!(kind = kind.name(), len = bytes.len(), error = %e, "sealed frame dropped");
        stats.record_drop(DropReason::from(&e));
        return None;
    }
    Some(RawFrame::new(kind, bytes.to_vec()))
}

/// Cursor-based splitter for concatenated Opcode-V2 messages
///
/// Walks the buffer one declared message length at a time. A message whose
/// declared length exceeds what has arrived stays pending until the next
/// notification continues it. The pending buffer is bounded; overflow drops
/// it and counts a framing error.
#[derive(Debug)]
pub struct OpcodeSplitter {
    layout: OpcodeV2Layout,
    pending: Vec<u8>,
}

impl OpcodeSplitter {
    pub fn new(layout: OpcodeV2Layout) -> Self {
        Self {
            layout,
            pending: Vec::new(),
        }
    }

    pub fn layout(&self) -> &OpcodeV2Layout {
        &self.layout
    }

    /// Bytes held back waiting for a continuation
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Append a notification and split off every complete message
    pub fn push(&mut self, bytes: &[u8], stats: &mut DecodeStats) -> Vec<RawFrame> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut cursor = 0;

        while cursor < self.pending.len() {
            let remaining = &self.pending[cursor..];
            let Some(length) = opcode_v2::message_length(remaining, &self.layout) else {
                break;
            };
            if remaining.len() < length {
                break;
            }
            frames.push(RawFrame::new(
                ProtocolKind::OpcodeV2,
                remaining[..length].to_vec(),
            ));
            cursor += length;
        }

        self.pending.drain(..cursor);

        if self.pending.len() > self.layout.max_pending {
            debug!(
                pending = self.pending.len(),
                limit = self.layout.max_pending,
                "opcode-v2: pending continuation overflow, dropping"
            );
            stats.record_drop(DropReason::Overflow);
            stats.bytes_discarded += self.pending.len() as u64;
            self.pending.clear();
        }

        frames
    }
}
