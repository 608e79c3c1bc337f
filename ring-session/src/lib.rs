//! # Ring Session - connection lifecycle for ring devices
//!
//! Drives one physical ring per [`RingSession`]: connect through a
//! [`RingTransport`], subscribe to the firmware's notify characteristics,
//! decode everything that arrives and publish [`RingEvent`]s to any number of
//! subscribers.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──► Connected{streaming: false}
//!      ▲                                        │ start_streaming
//!      │                                        ▼
//!      └──── Disconnecting ◄──disconnect── Connected{streaming: true}
//! ```
//!
//! Link loss moves any connected state straight to `Disconnected`. Sessions
//! never reconnect on their own.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ring_core::ProtocolKind;
//! use ring_session::{MockTransport, RingSession, SessionConfig};
//!
//! # async fn run() -> ring_session::SessionResult<()> {
//! let config = SessionConfig::new("E4:5F:01:AA:BB:CC", ProtocolKind::OpcodeV2);
//! let session = RingSession::new(config, Arc::new(MockTransport::new()));
//!
//! let mut events = session.subscribe();
//! session.connect().await?;
//! session.start_streaming().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! # Ok(())
//! # }
//! ```

mod calibrate;
pub mod clock;
pub mod config;
mod driver;
pub mod error;
pub mod events;
pub mod mock;
pub mod queue;
pub mod relay_transport;
pub mod transport;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use ring_core::protocol::commands::calibration_request;
use ring_core::{CalibrationOutcome, ClockModel, Command, HostClock, RingError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::driver::{Control, Driver, SessionShared};

// Re-export main types
pub use clock::TokioClock;
pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use events::{EventSubscription, RingEvent, SessionState, SessionStats};
pub use mock::MockTransport;
pub use queue::{CommandQueue, QueueStats};
pub use relay_transport::RelayTransport;
pub use transport::{LinkEvent, LinkEvents, LinkHandle, NotificationSink, RingTransport};

const CONTROL_CAPACITY: usize = 16;

struct LinkTask {
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

/// One ring, one link at a time
pub struct RingSession {
    id: Uuid,
    config: SessionConfig,
    transport: Arc<dyn RingTransport>,
    clock: Arc<dyn HostClock>,
    queue: Arc<CommandQueue>,
    shared: Arc<SessionShared>,
    link: Mutex<Option<LinkTask>>,
}

impl RingSession {
    pub fn new(config: SessionConfig, transport: Arc<dyn RingTransport>) -> Self {
        Self::with_clock(config, transport, Arc::new(TokioClock::new()))
    }

    /// Use `clock` for notification capture times and calibration rounds
    pub fn with_clock(
        config: SessionConfig,
        transport: Arc<dyn RingTransport>,
        clock: Arc<dyn HostClock>,
    ) -> Self {
        let shared = Arc::new(SessionShared::new(config.device_index, config.event_capacity));
        Self {
            id: Uuid::new_v4(),
            config,
            transport,
            clock,
            queue: Arc::new(CommandQueue::new()),
            shared,
            link: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Connect and subscribe to every notify characteristic of the protocol
    pub async fn connect(&self) -> SessionResult<()> {
        self.config.validate()?;
        let address = self.config.address.clone();
        if !self
            .shared
            .transition(SessionState::Disconnected, SessionState::Connecting)
        {
            return Err(SessionError::AlreadyConnected(address));
        }

        let (link_tx, link_rx) = mpsc::channel(self.config.notification_capacity);
        let events = LinkEvents::new(link_tx);

        let handle = match self.transport.connect(&address, events.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%address, error = %e, "connect failed");
                self.shared.set_state(SessionState::Disconnected);
                return Err(match e {
                    SessionError::ConnectFailed { .. } => e,
                    other => SessionError::ConnectFailed {
                        address,
                        reason: other.to_string(),
                    },
                });
            }
        };

        for (characteristic, channel) in self.config.protocol().gatt().notify {
            let sink = events.notifications(*channel);
            if let Err(e) = self.transport.subscribe(&handle, characteristic, sink).await {
                warn!(%address, characteristic, error = %e, "subscribe failed");
                if let Err(e) = self.transport.disconnect(&handle).await {
                    warn!(error = %e, "disconnect after failed subscribe");
                }
                self.shared.set_state(SessionState::Disconnected);
                return Err(e);
            }
        }

        self.shared
            .set_state(SessionState::Connected { streaming: false });

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let driver = Driver::new(
            self.config.clone(),
            self.transport.clone(),
            handle,
            self.clock.clone(),
            self.queue.clone(),
            self.shared.clone(),
        );
        let span = info_span!(
            "ring_session",
            device = %address,
            session = %self.id,
            index = self.config.device_index
        );
        let task = tokio::spawn(driver.run(link_rx, control_rx).instrument(span));

        if let Some(previous) = self.link.lock().replace(LinkTask {
            control: control_tx,
            task,
        }) {
            previous.task.abort();
        }
        info!(%address, session = %self.id, "session connected");
        Ok(())
    }

    fn control(&self) -> SessionResult<mpsc::Sender<Control>> {
        if !self.shared.state().is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.link
            .lock()
            .as_ref()
            .map(|link| link.control.clone())
            .ok_or(SessionError::NotConnected)
    }

    async fn send(&self, request: Control) -> SessionResult<()> {
        self.control()?
            .send(request)
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Queue the protocol's stream-enable commands and mark the session streaming
    pub async fn start_streaming(&self) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::StartStreaming { reply }).await?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Append a command; written on a later poll tick
    pub fn enqueue(&self, command: Command) {
        self.queue.enqueue(command);
    }

    /// Close the link and wait for the session task to finish
    pub async fn disconnect(&self) -> SessionResult<()> {
        let Some(link) = self.link.lock().take() else {
            return Err(SessionError::NotConnected);
        };
        if link.control.send(Control::Disconnect).await.is_err() {
            // Task already stopped after link loss or a queued disconnect
            self.queue.clear();
        }
        if let Err(e) = link.task.await {
            warn!(error = %e, "session task ended abnormally");
            self.shared.set_state(SessionState::Disconnected);
        }
        Ok(())
    }

    /// Receive everything published from now on
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription::new(self.shared.events.subscribe(), self.shared.lagged.clone())
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state changes without subscribing to the event stream
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Device-to-host clock model of the last successful calibration
    pub fn clock_model(&self) -> Option<ClockModel> {
        *self.shared.clock_model.read()
    }

    /// Subtract `bias` from gyro readings from now on
    pub async fn set_gyro_bias(&self, bias: [f64; 3]) -> SessionResult<()> {
        self.send(Control::SetGyroBias(bias)).await
    }

    /// Run the calibration rounds and wait for the fitted model
    ///
    /// Queued commands wait until the run is over. An insufficient run is
    /// returned with its warnings and any fitted model, but the session keeps
    /// the previous model and publishes no `Calibrated` event.
    pub async fn calibrate_clock(&self) -> SessionResult<CalibrationOutcome> {
        let protocol = self.config.protocol();
        let request = calibration_request(protocol).ok_or_else(|| RingError::InvalidCommand {
            command: "calibrate".into(),
            reason: format!("{protocol} firmware has no clock request"),
        })?;
        let (reply, rx) = oneshot::channel();
        self.send(Control::Calibrate { request, reply }).await?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Counters since the session was created, summed over every link
    pub fn stats(&self) -> SessionStats {
        let mut stats = self.shared.stats.read().clone();
        stats.events_lagged = self.shared.lagged.load(Ordering::Relaxed);
        stats
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Resolves once the session is disconnected
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state == SessionState::Disconnected)
            .await;
    }
}

impl Drop for RingSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.task.abort();
        }
    }
}
