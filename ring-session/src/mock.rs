//! In-process transport for tests and demos
//!
//! Records every write and lets the caller inject notifications, link loss
//! and failures. An optional responder answers writes the way firmware would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{SessionError, SessionResult};
use crate::transport::{LinkEvents, LinkHandle, NotificationSink, RingTransport};

/// A write the mock received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub characteristic: String,
    pub bytes: Vec<u8>,
    pub at: Instant,
}

/// Reply produced by a responder: `(characteristic, bytes)`
pub type Reply = (String, Vec<u8>);

type Responder = Box<dyn Fn(&str, &[u8]) -> Option<Reply> + Send + Sync>;

#[derive(Default)]
struct MockState {
    link: Option<LinkHandle>,
    events: Option<LinkEvents>,
    /// Keyed by upper-case characteristic UUID
    sinks: HashMap<String, NotificationSink>,
    writes: Vec<RecordedWrite>,
    connect_failure: Option<String>,
    fail_writes: bool,
    responder: Option<Responder>,
}

/// Recording transport
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `connect` fail with `reason`
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.state.lock().connect_failure = Some(reason.into());
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Answer writes with a notification
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &[u8]) -> Option<Reply> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    /// Subscribed characteristics, upper-case
    pub fn subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().sinks.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().link.is_some()
    }

    /// Deliver a notification as if the ring sent it
    ///
    /// Returns false if nobody subscribed to `characteristic`.
    pub async fn notify(&self, characteristic: &str, bytes: &[u8]) -> bool {
        let sink = self
            .state
            .lock()
            .sinks
            .get(&characteristic.to_ascii_uppercase())
            .cloned();
        match sink {
            Some(sink) => sink.deliver(bytes.to_vec()).await,
            None => false,
        }
    }

    /// Drop the link as if the ring went out of range
    pub async fn drop_link(&self, reason: &str) -> bool {
        let events = {
            let mut state = self.state.lock();
            state.link = None;
            state.sinks.clear();
            state.events.take()
        };
        match events {
            Some(events) => events.disconnected(reason).await,
            None => false,
        }
    }
}

#[async_trait]
impl RingTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, address: &str, events: LinkEvents) -> SessionResult<LinkHandle> {
        let mut state = self.state.lock();
        if let Some(reason) = state.connect_failure.take() {
            return Err(SessionError::Transport(reason));
        }
        let handle = LinkHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            address: address.to_string(),
        };
        state.link = Some(handle.clone());
        state.events = Some(events);
        Ok(handle)
    }

    async fn subscribe(
        &self,
        handle: &LinkHandle,
        characteristic: &str,
        sink: NotificationSink,
    ) -> SessionResult<()> {
        let mut state = self.state.lock();
        if state.link.as_ref() != Some(handle) {
            return Err(SessionError::NotConnected);
        }
        state.sinks.insert(characteristic.to_ascii_uppercase(), sink);
        Ok(())
    }

    async fn write(&self, handle: &LinkHandle, characteristic: &str, bytes: &[u8]) -> SessionResult<()> {
        let reply = {
            let mut state = self.state.lock();
            if state.link.as_ref() != Some(handle) {
                return Err(SessionError::NotConnected);
            }
            if state.fail_writes {
                return Err(SessionError::Transport("write rejected".into()));
            }
            state.writes.push(RecordedWrite {
                characteristic: characteristic.to_string(),
                bytes: bytes.to_vec(),
                at: Instant::now(),
            });
            state
                .responder
                .as_ref()
                .and_then(|respond| respond(characteristic, bytes))
        };

        if let Some((characteristic, bytes)) = reply {
            self.notify(&characteristic, &bytes).await;
        }
        Ok(())
    }

    async fn disconnect(&self, handle: &LinkHandle) -> SessionResult<()> {
        let mut state = self.state.lock();
        if state.link.as_ref() == Some(handle) {
            state.link = None;
            state.events = None;
            state.sinks.clear();
        }
        Ok(())
    }
}
