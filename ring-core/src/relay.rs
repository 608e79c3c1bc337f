//! Demultiplexer for the relay helper's TCP byte stream
//!
//! The relay helper owns the radio and forwards notifications over a socket.
//! In headered mode each payload is prefixed with a selector naming the
//! characteristic it came from and a one-byte length:
//!
//! ```text
//! ┌──────────────┬────────┬─────────────────────┐
//! │ 0x59 0x90    │ len    │ IMU-stream payload  │
//! ├──────────────┼────────┼─────────────────────┤
//! │ 0xB1 0xE0    │ len    │ control payload     │
//! └──────────────┴────────┴─────────────────────┘
//! ```
//!
//! Link status travels in-band as plain text (`Connected`, `Disconnected`, or
//! the device address, recognisable by its colons) and is checked before any
//! binary interpretation.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::protocol::StreamChannel;

/// Selector of IMU-stream payloads
pub const IMU_SELECTOR: [u8; 2] = [0x59, 0x90];

/// Selector of control payloads
pub const CONTROL_SELECTOR: [u8; 2] = [0xB1, 0xE0];

const HEADER_LEN: usize = 3;

/// How payloads are delimited on the relay socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayFraming {
    /// Selector + length header before every payload
    #[default]
    Headered,
    /// Each received chunk is one notification
    Raw,
}

impl RelayFraming {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "headered" => Some(RelayFraming::Headered),
            "raw" => Some(RelayFraming::Raw),
            _ => None,
        }
    }
}

/// Out-of-band link status from the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaySignal {
    Connected,
    Disconnected,
    /// Address of the device the helper attached to
    Address(String),
}

/// One unit recovered from the relay stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayItem {
    Signal(RelaySignal),
    Notification {
        channel: StreamChannel,
        bytes: Vec<u8>,
    },
}

/// Relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub signals: u64,
    pub notifications: u64,
    pub bytes_discarded: u64,
}

/// Recognise a text status chunk
///
/// Only printable ASCII is considered, so binary payloads that happen to be
/// valid UTF-8 are not mistaken for an address.
pub fn parse_signal(chunk: &[u8]) -> Option<RelaySignal> {
    if chunk.is_empty() || !chunk.iter().all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace()) {
        return None;
    }
    let text = std::str::from_utf8(chunk).ok()?.trim();
    match text {
        "Connected" => Some(RelaySignal::Connected),
        "Disconnected" => Some(RelaySignal::Disconnected),
        _ if text.contains(':') => Some(RelaySignal::Address(text.to_string())),
        _ => None,
    }
}

fn channel_for(selector: &[u8]) -> Option<StreamChannel> {
    if selector == IMU_SELECTOR {
        Some(StreamChannel::ImuStream)
    } else if selector == CONTROL_SELECTOR {
        Some(StreamChannel::Control)
    } else {
        None
    }
}

/// Splits the relay stream into status signals and notifications
#[derive(Debug)]
pub struct RelayDemux {
    framing: RelayFraming,
    raw_channel: StreamChannel,
    pending: Vec<u8>,
    stats: RelayStats,
}

impl RelayDemux {
    /// `raw_channel` is the channel assigned to every chunk in raw mode
    pub fn new(framing: RelayFraming, raw_channel: StreamChannel) -> Self {
        Self {
            framing,
            raw_channel,
            pending: Vec::new(),
            stats: RelayStats::default(),
        }
    }

    pub fn framing(&self) -> RelayFraming {
        self.framing
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Process one chunk read from the socket
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RelayItem> {
        if chunk.is_empty() {
            return Vec::new();
        }

        match self.framing {
            RelayFraming::Raw => {
                let item = match parse_signal(chunk) {
                    Some(signal) => {
                        self.stats.signals += 1;
                        RelayItem::Signal(signal)
                    }
                    None => {
                        self.stats.notifications += 1;
                        RelayItem::Notification {
                            channel: self.raw_channel,
                            bytes: chunk.to_vec(),
                        }
                    }
                };
                vec![item]
            }
            RelayFraming::Headered => self.push_headered(chunk),
        }
    }

    fn push_headered(&mut self, chunk: &[u8]) -> Vec<RelayItem> {
        // A chunk that does not continue a payload may be a status line
        if self.pending.is_empty() && channel_for(chunk.get(..2).unwrap_or(chunk)).is_none() {
            if let Some(signal) = parse_signal(chunk) {
                debug!(?signal, "relay signal");
                self.stats.signals += 1;
                return vec![RelayItem::Signal(signal)];
            }
        }

        self.pending.extend_from_slice(chunk);
        let mut items = Vec::new();

        while self.pending.len() >= 2 {
            let Some(channel) = channel_for(&self.pending[..2]) else {
                // Not a header: drop a byte and look again
                self.stats.bytes_discarded += 1;
                self.pending.drain(..1);
                continue;
            };
            if self.pending.len() < HEADER_LEN {
                break;
            }
            let length = usize::from(self.pending[2]);
            if self.pending.len() < HEADER_LEN + length {
                trace!(have = self.pending.len(), need = HEADER_LEN + length, "relay: partial payload");
                break;
            }
            let bytes = self.pending[HEADER_LEN..HEADER_LEN + length].to_vec();
            self.pending.drain(..HEADER_LEN + length);
            self.stats.notifications += 1;
            items.push(RelayItem::Notification { channel, bytes });
        }

        let selector_prefix = IMU_SELECTOR.starts_with(&self.pending)
            || CONTROL_SELECTOR.starts_with(&self.pending);
        if self.pending.len() == 1 && !selector_prefix {
            self.stats.bytes_discarded += 1;
            self.pending.clear();
        }

        items
    }
}
