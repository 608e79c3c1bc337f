//! Session configuration

use std::path::Path;
use std::time::Duration;

use ring_core::{ProtocolKind, RingConfig, RingError};
use serde::{Deserialize, Serialize};

use crate::error::SessionResult;

/// Configuration for one ring session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Device address handed to the transport
    #[serde(default)]
    pub address: String,

    /// Index of this ring among the ones a host drives
    #[serde(default)]
    pub device_index: usize,

    /// Command queue polling period (default: 200 ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Minimum spacing between two queued writes (default: 500 ms)
    #[serde(default = "default_command_delay_ms")]
    pub command_delay_ms: u64,

    /// Gesture aggregation tick (default: 10 ms)
    #[serde(default = "default_gesture_tick_ms")]
    pub gesture_tick_ms: u64,

    /// Periodic battery query, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_poll_secs: Option<u64>,

    /// Events buffered per subscriber before the oldest are skipped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Notifications buffered between transport and session
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// Protocol engine settings
    #[serde(default)]
    pub ring: RingConfig,
}

fn default_poll_interval_ms() -> u64 { 200 }
fn default_command_delay_ms() -> u64 { 500 }
fn default_gesture_tick_ms() -> u64 { 10 }
fn default_event_capacity() -> usize { 1024 }
fn default_notification_capacity() -> usize { 256 }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            device_index: 0,
            poll_interval_ms: default_poll_interval_ms(),
            command_delay_ms: default_command_delay_ms(),
            gesture_tick_ms: default_gesture_tick_ms(),
            battery_poll_secs: None,
            event_capacity: default_event_capacity(),
            notification_capacity: default_notification_capacity(),
            ring: RingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults for a ring at `address` speaking `protocol`
    pub fn new(address: impl Into<String>, protocol: ProtocolKind) -> Self {
        Self {
            address: address.into(),
            ring: RingConfig::for_protocol(protocol),
            ..Self::default()
        }
    }

    /// Set the device index
    pub fn device_index(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    /// Query the battery every `secs` seconds
    pub fn battery_poll_secs(mut self, secs: u64) -> Self {
        self.battery_poll_secs = Some(secs);
        self
    }

    /// Set the inter-command delay
    pub fn command_delay_ms(mut self, ms: u64) -> Self {
        self.command_delay_ms = ms;
        self
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.ring.protocol
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn gesture_tick(&self) -> Duration {
        Duration::from_millis(self.gesture_tick_ms)
    }

    pub fn battery_poll(&self) -> Option<Duration> {
        self.battery_poll_secs.map(Duration::from_secs)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> SessionResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> SessionResult<()> {
        let invalid = |reason: &str| RingError::InvalidConfig { reason: reason.to_string() };

        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be positive").into());
        }
        if self.gesture_tick_ms == 0 {
            return Err(invalid("gesture_tick_ms must be positive").into());
        }
        if self.battery_poll_secs == Some(0) {
            return Err(invalid("battery_poll_secs must be positive").into());
        }
        if self.event_capacity == 0 || self.notification_capacity == 0 {
            return Err(invalid("channel capacities must be positive").into());
        }
        self.ring.validate()?;
        Ok(())
    }
}
