//! Transport backends for ring links
//!
//! A transport owns the radio (or a helper process that owns it) and moves
//! bytes: connect, subscribe to notifications, write, disconnect. Incoming
//! data and link loss are pushed into the session through [`LinkEvents`].

use async_trait::async_trait;
use ring_core::StreamChannel;
use tokio::sync::mpsc;

use crate::error::SessionResult;

/// Established link to one device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    /// Transport-assigned link id
    pub id: u64,
    pub address: String,
}

/// What a transport reports about a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { channel: StreamChannel, bytes: Vec<u8> },
    Disconnected { reason: String },
}

/// Session-side inbox a transport reports into
///
/// The channel is bounded: a transport that produces faster than the session
/// decodes waits in [`NotificationSink::deliver`].
#[derive(Debug, Clone)]
pub struct LinkEvents {
    tx: mpsc::Sender<LinkEvent>,
}

impl LinkEvents {
    pub fn new(tx: mpsc::Sender<LinkEvent>) -> Self {
        Self { tx }
    }

    /// Sink for one subscribed characteristic
    pub fn notifications(&self, channel: StreamChannel) -> NotificationSink {
        NotificationSink {
            channel,
            tx: self.tx.clone(),
        }
    }

    /// Report link loss; false once the session is gone
    pub async fn disconnected(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(LinkEvent::Disconnected {
                reason: reason.into(),
            })
            .await
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Delivers one characteristic's notifications, tagged with its channel
#[derive(Debug, Clone)]
pub struct NotificationSink {
    channel: StreamChannel,
    tx: mpsc::Sender<LinkEvent>,
}

impl NotificationSink {
    pub fn channel(&self) -> StreamChannel {
        self.channel
    }

    /// Hand a chunk to the session; false once the session is gone
    pub async fn deliver(&self, bytes: Vec<u8>) -> bool {
        self.tx
            .send(LinkEvent::Notification {
                channel: self.channel,
                bytes,
            })
            .await
            .is_ok()
    }

    /// Hand a chunk over without waiting; false if the session's queue is full
    /// or the session is gone
    pub fn try_deliver(&self, bytes: Vec<u8>) -> bool {
        self.tx
            .try_send(LinkEvent::Notification {
                channel: self.channel,
                bytes,
            })
            .is_ok()
    }
}

/// Transport backend interface
#[async_trait]
pub trait RingTransport: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Whether `write` can succeed at all
    fn supports_write(&self) -> bool {
        true
    }

    /// Open a link; `events` receives link loss for its whole lifetime
    async fn connect(&self, address: &str, events: LinkEvents) -> SessionResult<LinkHandle>;

    /// Start delivering a characteristic's notifications into `sink`
    async fn subscribe(
        &self,
        handle: &LinkHandle,
        characteristic: &str,
        sink: NotificationSink,
    ) -> SessionResult<()>;

    /// Write to a characteristic; returns once the write is acknowledged
    async fn write(&self, handle: &LinkHandle, characteristic: &str, bytes: &[u8]) -> SessionResult<()>;

    /// Close the link
    async fn disconnect(&self, handle: &LinkHandle) -> SessionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sinks_tag_their_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let events = LinkEvents::new(tx);
        let imu = events.notifications(StreamChannel::ImuStream);

        assert!(imu.deliver(vec![1, 2]).await);
        assert!(events.disconnected("gone").await);

        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Notification {
                channel: StreamChannel::ImuStream,
                bytes: vec![1, 2],
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Disconnected {
                reason: "gone".into()
            })
        );

        drop(rx);
        assert!(events.is_closed());
        assert!(!imu.deliver(vec![3]).await);
    }
}
