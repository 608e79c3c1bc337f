//! Transport fed by a relay helper over TCP
//!
//! The helper process owns the radio, connects to us and forwards
//! notifications framed as described in [`ring_core::relay`]. The link is
//! receive-only: commands cannot be sent back through the helper.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ring_core::{RelayDemux, RelayFraming, RelayItem, RelaySignal, StreamChannel};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{SessionError, SessionResult};
use crate::transport::{LinkEvents, LinkHandle, NotificationSink, RingTransport};

const READ_BUFFER: usize = 4096;

/// Notifications kept per channel until it is subscribed
const EARLY_CAPACITY: usize = 64;

/// Where relayed payloads go
///
/// The helper may forward payloads as soon as it is accepted, before the
/// session has subscribed. Those are held per channel, oldest dropped first,
/// and handed over on subscription.
#[derive(Default)]
struct Routes {
    sinks: HashMap<StreamChannel, NotificationSink>,
    early: HashMap<StreamChannel, VecDeque<Vec<u8>>>,
    early_dropped: u64,
}

impl Routes {
    /// Sink for `channel`, or hold `bytes` back until one is subscribed
    fn route(&mut self, channel: StreamChannel, bytes: Vec<u8>) -> Option<(NotificationSink, Vec<u8>)> {
        if let Some(sink) = self.sinks.get(&channel) {
            return Some((sink.clone(), bytes));
        }
        let held = self.early.entry(channel).or_default();
        if held.len() == EARLY_CAPACITY {
            held.pop_front();
            self.early_dropped += 1;
            debug!(?channel, dropped = self.early_dropped, "relay payload before subscription dropped");
        }
        held.push_back(bytes);
        trace!(?channel, held = held.len(), "relay payload held until subscription");
        None
    }

    fn clear(&mut self) {
        self.sinks.clear();
        self.early.clear();
    }
}

type Sinks = Arc<Mutex<Routes>>;

/// Accepts one helper connection per `connect`
pub struct RelayTransport {
    listener: TcpListener,
    framing: RelayFraming,
    raw_channel: StreamChannel,
    sinks: Sinks,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl RelayTransport {
    /// Listen on `addr` for the helper
    pub async fn bind(addr: &str, framing: RelayFraming) -> SessionResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, ?framing, "relay transport listening");
        Ok(Self {
            listener,
            framing,
            raw_channel: StreamChannel::Control,
            sinks: Arc::new(Mutex::new(Routes::default())),
            reader: Mutex::new(None),
            next_id: AtomicU64::new(0),
        })
    }

    /// Channel assigned to chunks in raw framing (default: control)
    pub fn with_raw_channel(mut self, channel: StreamChannel) -> Self {
        self.raw_channel = channel;
        self
    }

    pub fn local_addr(&self) -> SessionResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

async fn read_relay(mut stream: TcpStream, mut demux: RelayDemux, sinks: Sinks, events: LinkEvents) {
    let mut buffer = vec![0u8; READ_BUFFER];
    let reason = loop {
        let read = match stream.read(&mut buffer).await {
            Ok(0) => break "relay helper closed the connection".to_string(),
            Ok(n) => n,
            Err(e) => break format!("relay read failed: {e}"),
        };

        for item in demux.push(&buffer[..read]) {
            match item {
                RelayItem::Signal(RelaySignal::Disconnected) => {
                    info!("relay helper reports ring disconnected");
                    events.disconnected("ring disconnected at relay helper").await;
                    return;
                }
                RelayItem::Signal(RelaySignal::Connected) => info!("relay helper reports ring connected"),
                RelayItem::Signal(RelaySignal::Address(address)) => {
                    info!(%address, "relay helper attached to ring")
                }
                RelayItem::Notification { channel, bytes } => {
                    let routed = sinks.lock().route(channel, bytes);
                    if let Some((sink, bytes)) = routed {
                        if !sink.deliver(bytes).await {
                            return;
                        }
                    }
                }
            }
        }
    };

    let stats = demux.stats();
    debug!(
        notifications = stats.notifications,
        discarded = stats.bytes_discarded,
        early_dropped = sinks.lock().early_dropped,
        "relay reader stopped"
    );
    events.disconnected(reason).await;
}

#[async_trait]
impl RingTransport for RelayTransport {
    fn name(&self) -> &str {
        "relay"
    }

    fn supports_write(&self) -> bool {
        false
    }

    async fn connect(&self, address: &str, events: LinkEvents) -> SessionResult<LinkHandle> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| SessionError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        info!(%peer, ring = address, "relay helper connected");

        self.sinks.lock().clear();
        let demux = RelayDemux::new(self.framing, self.raw_channel);
        let task = tokio::spawn(read_relay(stream, demux, self.sinks.clone(), events));
        if let Some(previous) = self.reader.lock().replace(task) {
            previous.abort();
        }

        Ok(LinkHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            address: address.to_string(),
        })
    }

    async fn subscribe(
        &self,
        _handle: &LinkHandle,
        characteristic: &str,
        sink: NotificationSink,
    ) -> SessionResult<()> {
        let channel = sink.channel();
        debug!(characteristic, ?channel, "relay subscription");

        let mut routes = self.sinks.lock();
        if let Some(held) = routes.early.remove(&channel) {
            debug!(?channel, count = held.len(), "delivering relay payloads held before subscription");
            for bytes in held {
                if !sink.try_deliver(bytes) {
                    routes.early_dropped += 1;
                    debug!(?channel, "held relay payload not accepted by the session");
                }
            }
        }
        routes.sinks.insert(channel, sink);
        Ok(())
    }

    async fn write(&self, _handle: &LinkHandle, characteristic: &str, _bytes: &[u8]) -> SessionResult<()> {
        warn!(characteristic, "write attempted on receive-only relay link");
        Err(SessionError::WriteUnsupported(self.name().to_string()))
    }

    async fn disconnect(&self, _handle: &LinkHandle) -> SessionResult<()> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.sinks.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LinkEvent;
    use ring_core::relay::{CONTROL_SELECTOR, IMU_SELECTOR};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_relay_routes_payloads_and_signals() {
        let transport = RelayTransport::bind("127.0.0.1:0", RelayFraming::Headered)
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let helper = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"E4:5F:01:AA:BB:CC").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;

            let mut payload = IMU_SELECTOR.to_vec();
            payload.extend_from_slice(&[3, 0xAA, 0x55, 0x01]);
            payload.extend_from_slice(&CONTROL_SELECTOR);
            payload.extend_from_slice(&[2, 0x24, 0x00]);
            stream.write_all(&payload).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;

            stream.write_all(b"Disconnected").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        let (tx, mut rx) = mpsc::channel(8);
        let events = LinkEvents::new(tx);
        let handle = transport.connect("ring-0", events.clone()).await.unwrap();
        transport
            .subscribe(&handle, "spp", events.notifications(StreamChannel::ImuStream))
            .await
            .unwrap();
        transport
            .subscribe(&handle, "notify", events.notifications(StreamChannel::Control))
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Notification {
                channel: StreamChannel::ImuStream,
                bytes: vec![0xAA, 0x55, 0x01],
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Notification {
                channel: StreamChannel::Control,
                bytes: vec![0x24, 0x00],
            })
        );
        assert!(matches!(rx.recv().await, Some(LinkEvent::Disconnected { .. })));

        assert!(!transport.supports_write());
        let err = transport.write(&handle, "notify", &[0]).await.unwrap_err();
        assert_eq!(err.error_code(), "WRITE_UNSUPPORTED");

        helper.await.unwrap();
    }

    #[tokio::test]
    async fn test_payload_before_subscription_is_held() {
        let transport = RelayTransport::bind("127.0.0.1:0", RelayFraming::Headered)
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let (sent_tx, sent_rx) = tokio::sync::oneshot::channel();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        let helper = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut payload = CONTROL_SELECTOR.to_vec();
            payload.extend_from_slice(&[2, 0x24, 0x01]);
            payload.extend_from_slice(&CONTROL_SELECTOR);
            payload.extend_from_slice(&[1, 0x25]);
            stream.write_all(&payload).await.unwrap();
            stream.flush().await.unwrap();
            sent_tx.send(()).unwrap();

            done_rx.await.unwrap();
            stream.write_all(b"Disconnected").await.unwrap();
            stream.flush().await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel(8);
        let events = LinkEvents::new(tx);
        let handle = transport.connect("ring-0", events.clone()).await.unwrap();
        sent_rx.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        transport
            .subscribe(&handle, "notify", events.notifications(StreamChannel::Control))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Notification {
                channel: StreamChannel::Control,
                bytes: vec![0x24, 0x01],
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Notification {
                channel: StreamChannel::Control,
                bytes: vec![0x25],
            })
        );

        done_tx.send(()).unwrap();
        assert!(matches!(rx.recv().await, Some(LinkEvent::Disconnected { .. })));
        helper.await.unwrap();
    }

    #[test]
    fn test_held_payloads_are_bounded() {
        let mut routes = Routes::default();
        for i in 0..EARLY_CAPACITY + 3 {
            assert!(routes.route(StreamChannel::Control, vec![i as u8]).is_none());
        }
        let held = &routes.early[&StreamChannel::Control];
        assert_eq!(held.len(), EARLY_CAPACITY);
        assert_eq!(held.front(), Some(&vec![3u8]));
        assert_eq!(routes.early_dropped, 3);
    }
}
