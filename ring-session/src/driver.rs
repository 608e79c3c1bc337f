//! The per-session task
//!
//! Owns the decoder, IMU normalizer, gesture machine and any calibration in
//! progress. Notifications, timers and control requests are all handled from
//! one `select!` loop; nothing else touches that state.

use std::future::pending;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use ring_core::calibration::{CalibrationOutcome, CalibrationReport, ClockModel};
use ring_core::protocol::commands::{battery_query, stream_enable_sequence};
use ring_core::protocol::TouchRecord;
use ring_core::{
    Command, DecodeStats, DecodedMessage, Decoder, GestureMachine, HostClock, ImuNormalizer, StreamChannel,
    TouchEvent,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::calibrate::{ActiveCalibration, CalibrationReply};
use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::events::{RingEvent, SessionState, SessionStats};
use crate::queue::CommandQueue;
use crate::transport::{LinkEvent, LinkHandle, RingTransport};

/// State shared between the session handle and its task
///
/// Only the task writes `stats` and `clock_model`; the handle reads snapshots.
pub(crate) struct SessionShared {
    pub device_index: usize,
    pub state: watch::Sender<SessionState>,
    pub events: broadcast::Sender<RingEvent>,
    pub stats: RwLock<SessionStats>,
    pub clock_model: RwLock<Option<ClockModel>>,
    pub lagged: Arc<AtomicU64>,
}

impl SessionShared {
    pub(crate) fn new(device_index: usize, event_capacity: usize) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            device_index,
            state,
            events,
            stats: RwLock::new(SessionStats::default()),
            clock_model: RwLock::new(None),
            lagged: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "session state");
            self.publish(RingEvent::StateChanged {
                device_index: self.device_index,
                state,
            });
        }
    }

    /// Move `from` → `to`; false if the session was in another state
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            info!(from = ?from, to = ?to, "session state");
            self.publish(RingEvent::StateChanged {
                device_index: self.device_index,
                state: to,
            });
        }
        moved
    }

    /// Newest-wins fan-out; never waits for subscribers
    pub(crate) fn publish(&self, event: RingEvent) {
        if self.events.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }
}

/// Requests from the session handle
pub(crate) enum Control {
    StartStreaming {
        reply: oneshot::Sender<SessionResult<()>>,
    },
    SetGyroBias([f64; 3]),
    Calibrate {
        request: Command,
        reply: CalibrationReply,
    },
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Driver {
    config: SessionConfig,
    transport: Arc<dyn RingTransport>,
    handle: LinkHandle,
    clock: Arc<dyn HostClock>,
    queue: Arc<CommandQueue>,
    shared: Arc<SessionShared>,
    decoder: Decoder,
    /// Decoder counters of earlier links
    decode_baseline: DecodeStats,
    normalizer: ImuNormalizer,
    gestures: GestureMachine,
    calibration: Option<ActiveCalibration>,
    next_write_at: Instant,
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

fn unix_secs() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(0)
}

impl Driver {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Arc<dyn RingTransport>,
        handle: LinkHandle,
        clock: Arc<dyn HostClock>,
        queue: Arc<CommandQueue>,
        shared: Arc<SessionShared>,
    ) -> Self {
        let ring = &config.ring;
        let decode_baseline = shared.stats.read().decode_counters();
        Self {
            decoder: Decoder::new(ring.protocol, ring.opcode_v2),
            decode_baseline,
            normalizer: ImuNormalizer::new(ring.imu.clone()),
            gestures: GestureMachine::new(ring.gesture.clone()),
            calibration: None,
            next_write_at: Instant::now(),
            config,
            transport,
            handle,
            clock,
            queue,
            shared,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut link: mpsc::Receiver<LinkEvent>,
        mut control: mpsc::Receiver<Control>,
    ) {
        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gesture_tick = interval(self.config.gesture_tick());
        gesture_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut battery = self.config.battery_poll().map(|period| {
            let mut battery = interval(period);
            battery.set_missed_tick_behavior(MissedTickBehavior::Delay);
            battery
        });

        info!(
            protocol = %self.config.protocol(),
            transport = self.transport.name(),
            "session task started"
        );

        loop {
            let calibration_deadline = self.calibration.as_ref().map(ActiveCalibration::deadline);

            let flow = tokio::select! {
                event = link.recv() => match event {
                    Some(LinkEvent::Notification { channel, bytes }) => {
                        self.on_notification(channel, &bytes);
                        Flow::Continue
                    }
                    Some(LinkEvent::Disconnected { reason }) => {
                        info!(%reason, "link lost");
                        self.queue.clear();
                        self.shared.set_state(SessionState::Disconnected);
                        Flow::Stop
                    }
                    None => {
                        self.shared.set_state(SessionState::Disconnected);
                        Flow::Stop
                    }
                },
                request = control.recv() => match request {
                    Some(request) => self.on_control(request).await,
                    None => {
                        debug!("session handle dropped");
                        self.teardown().await;
                        Flow::Stop
                    }
                },
                _ = poll.tick() => self.drain_one().await,
                _ = gesture_tick.tick() => {
                    let events = self.gestures.tick(self.clock.now());
                    self.publish_touches(events);
                    Flow::Continue
                },
                _ = tick_opt(&mut battery) => {
                    self.queue.enqueue(battery_query(self.config.protocol(), unix_secs()));
                    Flow::Continue
                },
                _ = sleep_until_opt(calibration_deadline) => {
                    self.step_calibration().await;
                    Flow::Continue
                },
            };

            if flow == Flow::Stop {
                break;
            }
        }

        let stats = self.shared.stats.read().clone();
        info!(
            frames = stats.frames_decoded,
            crc_failures = stats.crc_failures,
            commands = stats.commands_sent,
            "session task stopped"
        );
    }

    fn on_notification(&mut self, channel: StreamChannel, bytes: &[u8]) {
        let now = self.clock.now();
        let messages = self.decoder.feed(channel, bytes);
        for message in messages {
            self.dispatch(message, now);
        }
        self.shared
            .stats
            .write()
            .absorb(&self.decode_baseline, self.decoder.stats());
    }

    fn dispatch(&mut self, message: DecodedMessage, now: f64) {
        let device_index = self.shared.device_index;
        match message {
            DecodedMessage::ImuBatch(batch) => {
                let samples = self.normalizer.normalize(&batch, now);
                if !samples.is_empty() {
                    self.shared.publish(RingEvent::Imu {
                        device_index,
                        samples,
                    });
                }
            }
            DecodedMessage::TouchRaw(TouchRecord::Contact(bits)) => {
                let events = self.gestures.on_contact(bits, now);
                self.publish_touches(events);
            }
            DecodedMessage::TouchRaw(TouchRecord::Summary { code }) => {
                self.shared.publish(RingEvent::TouchSummary {
                    device_index,
                    code,
                    timestamp: now,
                });
            }
            DecodedMessage::GestureCode(code) => {
                let events = self.gestures.on_gesture_code(code, now);
                self.publish_touches(events);
            }
            DecodedMessage::BatteryLevel(report) => {
                debug!(level = report.level, "battery");
                self.shared.publish(RingEvent::Battery {
                    device_index,
                    report,
                    timestamp: now,
                });
            }
            DecodedMessage::CalibAck(ack) => {
                let device_time = ack.seconds();
                match self.calibration.as_mut() {
                    Some(calibration) => calibration.on_ack(device_time),
                    None => trace!(device_time, "calibration ack outside a run"),
                }
                self.shared.publish(RingEvent::CalibAck {
                    device_index,
                    device_time,
                    timestamp: now,
                });
            }
            DecodedMessage::DeviceInfo(info) => {
                debug!(?info, "device info");
                self.shared.publish(RingEvent::DeviceInfo { device_index, info });
            }
            DecodedMessage::Unknown(frame) => {
                debug!(len = frame.bytes.len(), "unknown message");
                self.shared.publish(RingEvent::Unknown { device_index, frame });
            }
        }
    }

    fn publish_touches(&self, events: Vec<TouchEvent>) {
        for touch in events {
            debug!(kind = ?touch.kind, "touch");
            self.shared.publish(RingEvent::Touch {
                device_index: self.shared.device_index,
                touch,
            });
        }
    }

    async fn on_control(&mut self, request: Control) -> Flow {
        match request {
            Control::StartStreaming { reply } => {
                if self.transport.supports_write() {
                    let protocol = self.config.protocol();
                    self.queue
                        .enqueue_all(stream_enable_sequence(protocol, self.config.ring.imu.imu_freq));
                } else {
                    debug!("read-only transport, streaming is driven by the relay helper");
                }
                self.shared.set_state(SessionState::Connected { streaming: true });
                let _ = reply.send(Ok(()));
                Flow::Continue
            }
            Control::SetGyroBias(bias) => {
                debug!(?bias, "gyro bias updated");
                self.normalizer.set_gyro_bias(bias);
                Flow::Continue
            }
            Control::Calibrate { request, reply } => {
                if self.calibration.is_some() {
                    let _ = reply.send(Err(ring_core::RingError::InvalidCommand {
                        command: "calibrate".into(),
                        reason: "a calibration run is already in progress".into(),
                    }
                    .into()));
                    return Flow::Continue;
                }
                let config = self.config.ring.calibration.clone();
                match ActiveCalibration::start(self.config.protocol(), config, request, reply) {
                    Ok(active) => self.calibration = Some(active),
                    Err(reply) => {
                        let _ = reply.send(Err(ring_core::RingError::InvalidCommand {
                            command: "calibrate".into(),
                            reason: "calibration request is not a write".into(),
                        }
                        .into()));
                    }
                }
                Flow::Continue
            }
            Control::Disconnect => {
                self.teardown().await;
                Flow::Stop
            }
        }
    }

    /// Write at most one queued command
    async fn drain_one(&mut self) -> Flow {
        if self.calibration.is_some() || Instant::now() < self.next_write_at {
            return Flow::Continue;
        }
        let Some(command) = self.queue.dequeue() else {
            return Flow::Continue;
        };

        match command {
            Command::Disconnect => {
                info!("disconnect command dequeued");
                self.teardown().await;
                Flow::Stop
            }
            Command::Write {
                label,
                endpoint,
                payload,
            } => {
                if !self.transport.supports_write() {
                    debug!(%label, "read-only transport, command dropped");
                    return Flow::Continue;
                }
                let characteristic = self.config.protocol().gatt().write_target(endpoint);
                match self.transport.write(&self.handle, characteristic, &payload).await {
                    Ok(()) => {
                        debug!(%label, "command written");
                        self.shared.stats.write().commands_sent += 1;
                    }
                    Err(e) => {
                        warn!(%label, error = %e, "command write failed");
                        self.shared.stats.write().write_failures += 1;
                    }
                }
                self.next_write_at = Instant::now() + self.config.command_delay();
                Flow::Continue
            }
        }
    }

    async fn step_calibration(&mut self) {
        let ready = match self.calibration.as_mut() {
            Some(active) => active.step(&self.transport, &self.handle, &self.clock).await,
            None => return,
        };
        if !ready {
            return;
        }
        if let Some(active) = self.calibration.take() {
            let (outcome, reply) = active.finish();
            self.apply_calibration(&outcome);
            let _ = reply.send(Ok(outcome));
        }
    }

    fn apply_calibration(&self, outcome: &CalibrationOutcome) {
        let Some(model) = outcome.model else {
            warn!("calibration produced no clock model, keeping the previous one");
            return;
        };
        if outcome.is_insufficient() {
            warn!(
                accepted = outcome.accepted.len(),
                "insufficient calibration run, keeping the previous clock model"
            );
            return;
        }
        *self.shared.clock_model.write() = Some(model);
        info!(intercept = model.intercept, slope = model.slope, "clock model updated");

        if let Some(report) = CalibrationReport::from_outcome(&self.handle.address, outcome, Utc::now()) {
            self.shared.publish(RingEvent::Calibrated {
                device_index: self.shared.device_index,
                report,
            });
        }
    }

    /// Close the link on request
    async fn teardown(&mut self) {
        self.shared.set_state(SessionState::Disconnecting);
        if let Err(e) = self.transport.disconnect(&self.handle).await {
            warn!(error = %e, "transport disconnect failed");
        }
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(dropped, "pending commands discarded");
        }
        self.shared.set_state(SessionState::Disconnected);
    }
}
