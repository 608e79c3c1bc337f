//! Touch gesture recognition
//!
//! Rings report touch in one of two ways:
//!
//! - **Contact bits** (Mode A). Three capacitive pads are sampled per frame
//!   and the host classifies taps, slides and holds itself. A periodic tick
//!   aggregates single taps into double taps.
//! - **Gesture codes** (Mode B, Legacy actions). The firmware classifies and
//!   the host only disambiguates double taps.
//!
//! All state lives in one [`GestureMachine`] per device. Frame-driven calls
//! and [`GestureMachine::tick`] must come from the same owner.
//!
//! ```rust
//! use ring_core::gesture::{GestureConfig, GestureMachine, TouchKind};
//! use ring_core::protocol::ContactBits;
//!
//! let mut machine = GestureMachine::new(GestureConfig::default());
//! let touch = ContactBits { x: false, y: false, z: true };
//! machine.on_contact(touch, 0.00);
//! machine.on_contact(ContactBits::default(), 0.03);
//!
//! let mut events = Vec::new();
//! for tick in 1..=60 {
//!     events.extend(machine.tick(0.03 + tick as f64 * 0.01));
//! }
//! assert_eq!(events.len(), 1);
//! assert_eq!(events[0].kind, TouchKind::Tap);
//! ```

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::protocol::legacy::action;
use crate::protocol::{ContactBits, GestureCode, GestureSource};

/// Contact code per `x*4 + y*2 + z`
const CONTACT_CODES: [i8; 8] = [0, 1, 3, 2, 5, -1, 4, -2];

/// Device codes that stand for a single tap
const MODE_B_TAP_CODES: [u8; 3] = [0, 3, 4];
const MODE_B_LONG_TOUCH: u8 = 1;

/// Map contact bits to the firmware's contact code
pub fn contact_code(bits: ContactBits) -> i8 {
    let index = usize::from(bits.x) * 4 + usize::from(bits.y) * 2 + usize::from(bits.z);
    CONTACT_CODES[index]
}

/// Recognised gesture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchKind {
    Tap,
    DoubleTap,
    TripleTap,
    LongTouch,
    Release,
    SlideUp,
    SlideDown,
    /// Device code without a host-side meaning
    RawCode(u8),
}

impl TouchKind {
    /// Integer code handed to touch consumers by earlier host software
    pub fn legacy_code(&self) -> i32 {
        match self {
            TouchKind::Tap => 0,
            TouchKind::DoubleTap => 1,
            TouchKind::LongTouch => 2,
            TouchKind::SlideUp => 3,
            TouchKind::SlideDown => 4,
            TouchKind::Release => 5,
            TouchKind::TripleTap => 6,
            TouchKind::RawCode(code) => i32::from(*code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchEvent {
    pub kind: TouchKind,
    /// Host seconds
    pub timestamp: f64,
}

impl TouchEvent {
    fn new(kind: TouchKind, timestamp: f64) -> Self {
        Self { kind, timestamp }
    }
}

/// Classification of a completed contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapClass {
    Tap,
    Up,
    Down,
}

/// Gesture timing and surfacing switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureConfig {
    /// Double-tap aggregation window, seconds
    #[serde(default = "default_tap_interval")]
    pub tap_interval: f64,

    /// Aggregation tick period, seconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval: f64,

    /// Contact span that counts as a hold, seconds
    #[serde(default = "default_long_touch")]
    pub long_touch: f64,

    /// Over-threshold frames before LongTouch is emitted
    #[serde(default = "default_hold_confirm_frames")]
    pub hold_confirm_frames: u32,

    /// Silence after which contact history is discarded, seconds
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout: f64,

    /// Mode B double-tap window, seconds
    #[serde(default = "default_tap_interval")]
    pub double_tap_window: f64,

    #[serde(default = "default_true")]
    pub emit_single_tap: bool,

    /// Surface Up/Down classifications as SlideUp/SlideDown
    #[serde(default)]
    pub emit_directional: bool,
}

fn default_tap_interval() -> f64 {
    0.5
}

fn default_tick_interval() -> f64 {
    0.01
}

fn default_long_touch() -> f64 {
    1.0
}

fn default_hold_confirm_frames() -> u32 {
    1
}

fn default_stale_timeout() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            tap_interval: default_tap_interval(),
            tick_interval: default_tick_interval(),
            long_touch: default_long_touch(),
            hold_confirm_frames: default_hold_confirm_frames(),
            stale_timeout: default_stale_timeout(),
            double_tap_window: default_tap_interval(),
            emit_single_tap: true,
            emit_directional: false,
        }
    }
}

impl GestureConfig {
    /// Ticks in one aggregation window
    pub fn interval_ticks(&self) -> u32 {
        (self.tap_interval / self.tick_interval).round().max(1.0) as u32
    }
}

/// Per-device gesture state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GestureState {
    /// `(contact code, host time)` since the last release
    pub history: Vec<(i8, f64)>,
    /// LongTouch emitted and not yet released
    pub holding: bool,
    /// Frames seen beyond the long-touch threshold
    pub hold_frames: u32,
    /// Set by a completed contact, consumed by the next tick
    pub tap_pending: bool,
    pub classification: Option<TapClass>,
    /// Ticks since the first tap of a possible double tap
    pub window_ticks: Option<u32>,
    /// Mode B: time of an unpaired tap code
    pub last_tap: Option<f64>,
    pub last_frame: Option<f64>,
}

/// Touch gesture state machine for one device
#[derive(Debug, Clone, Default)]
pub struct GestureMachine {
    config: GestureConfig,
    state: GestureState,
}

impl GestureMachine {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            state: GestureState::default(),
        }
    }

    pub fn config(&self) -> &GestureConfig {
        &self.config
    }

    pub fn state(&self) -> &GestureState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = GestureState::default();
    }

    /// Mode A: one contact frame
    pub fn on_contact(&mut self, bits: ContactBits, now: f64) -> Vec<TouchEvent> {
        let mut events = self.expire_stale(now);
        let code = contact_code(bits);
        let state = &mut self.state;
        state.history.push((code, now));
        state.last_frame = Some(now);

        if code == 0 {
            if state.hold_frames == 0 && state.history.len() > 1 {
                let first = state.history[0].0;
                let previous = state.history[state.history.len() - 2].0;
                let class = if previous > first {
                    TapClass::Up
                } else if previous < first {
                    TapClass::Down
                } else {
                    TapClass::Tap
                };
                trace!(?class, "contact released");
                state.tap_pending = true;
                state.classification = Some(class);
            } else if state.holding {
                events.push(TouchEvent::new(TouchKind::Release, now));
            }
            state.holding = false;
            state.hold_frames = 0;
            state.history.clear();
        } else {
            let span = now - state.history[0].1;
            if span > self.config.long_touch {
                state.hold_frames += 1;
                if state.hold_frames == self.config.hold_confirm_frames.max(1) {
                    state.holding = true;
                    events.push(TouchEvent::new(TouchKind::LongTouch, now));
                }
            }
        }
        events
    }

    /// Periodic aggregation step, once per `tick_interval`
    pub fn tick(&mut self, now: f64) -> Vec<TouchEvent> {
        let mut events = self.expire_stale(now);
        let interval_ticks = self.config.interval_ticks();
        let state = &mut self.state;

        if state.tap_pending {
            state.tap_pending = false;
            if state.window_ticks.is_some() {
                state.window_ticks = None;
                state.classification = None;
                events.push(TouchEvent::new(TouchKind::DoubleTap, now));
            } else {
                state.window_ticks = Some(0);
            }
        } else if let Some(ticks) = state.window_ticks {
            let ticks = ticks + 1;
            if ticks >= interval_ticks {
                state.window_ticks = None;
                let kind = match state.classification.take() {
                    Some(TapClass::Tap) if self.config.emit_single_tap => Some(TouchKind::Tap),
                    Some(TapClass::Up) if self.config.emit_directional => Some(TouchKind::SlideUp),
                    Some(TapClass::Down) if self.config.emit_directional => {
                        Some(TouchKind::SlideDown)
                    }
                    _ => None,
                };
                events.extend(kind.map(|kind| TouchEvent::new(kind, now)));
            } else {
                state.window_ticks = Some(ticks);
            }
        }
        events
    }

    /// Firmware-classified gesture code, either mode B or a Legacy action
    pub fn on_gesture_code(&mut self, gesture: GestureCode, now: f64) -> Vec<TouchEvent> {
        match gesture.source {
            GestureSource::DeviceClassified => self.on_device_code(gesture.code, now),
            GestureSource::LegacyAction => vec![TouchEvent::new(legacy_action(gesture.code), now)],
        }
    }

    /// Mode B: device gesture code
    pub fn on_device_code(&mut self, code: u8, now: f64) -> Vec<TouchEvent> {
        let mut events = self.expire_stale(now);
        let state = &mut self.state;

        if MODE_B_TAP_CODES.contains(&code) {
            match state.last_tap {
                Some(last) if now - last < self.config.double_tap_window => {
                    state.last_tap = None;
                    events.push(TouchEvent::new(TouchKind::DoubleTap, now));
                }
                _ => state.last_tap = Some(now),
            }
        } else if code == MODE_B_LONG_TOUCH {
            state.holding = true;
            state.last_frame = Some(now);
            events.push(TouchEvent::new(TouchKind::LongTouch, now));
        } else {
            events.push(TouchEvent::new(TouchKind::RawCode(code), now));
        }
        events
    }

    /// Release a hold and drop history after `stale_timeout` of silence
    fn expire_stale(&mut self, now: f64) -> Vec<TouchEvent> {
        let state = &mut self.state;
        let Some(last_frame) = state.last_frame else {
            return Vec::new();
        };
        if now - last_frame <= self.config.stale_timeout {
            return Vec::new();
        }
        if state.history.is_empty() && !state.holding {
            return Vec::new();
        }

        let mut events = Vec::new();
        if state.holding {
            trace!("stale hold, releasing");
            events.push(TouchEvent::new(TouchKind::Release, now));
        }
        state.holding = false;
        state.hold_frames = 0;
        state.history.clear();
        events
    }
}

/// Gesture for a Legacy touch-action code
pub fn legacy_action(code: u8) -> TouchKind {
    match code {
        action::TAP => TouchKind::Tap,
        action::DOUBLE_TAP => TouchKind::DoubleTap,
        action::TRIPLE_TAP => TouchKind::TripleTap,
        action::LONG_TOUCH => TouchKind::LongTouch,
        action::RELEASE => TouchKind::Release,
        other => TouchKind::RawCode(other),
    }
}
