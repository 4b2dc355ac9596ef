//! Transport seam.
//!
//! The engine never touches bytes. A transport sends whole packets and
//! reports inbound packets and connection changes as [`TransportEvent`]s on
//! a channel handed to the connection at construction.
//!
//! [`MemoryTransport`] is an in-process duplex pair used by tests and by
//! embedders that run both peers in one process.

use crate::error::{Result, RpcError};
use crate::packet::Packet;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Something that happened on the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    MessageReceived(Packet),
    ExceptionOccurred(String),
    Connected,
    Disconnected,
}

/// Sender half used by transports to publish events.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiver half consumed by a connection.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create a transport event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Outbound side of a duplex message transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one packet to the peer.
    async fn send(&self, packet: Packet) -> Result<()>;

    /// Release the transport. Called once during connection teardown.
    async fn close(&self) -> Result<()>;

    /// Whether the transport is currently able to send.
    fn is_running(&self) -> bool;

    fn local_name(&self) -> &str;

    fn remote_name(&self) -> &str;
}

#[derive(Debug)]
struct LinkState {
    up: AtomicBool,
}

/// One end of an in-process duplex link.
///
/// Both ends share a link flag: `disconnect()` on either end drops the link
/// and reports `Disconnected` to both.
#[derive(Debug)]
pub struct MemoryTransport {
    local_name: String,
    remote_name: String,
    link: Arc<LinkState>,
    closed: AtomicBool,
    local_events: EventSender,
    peer_events: EventSender,
}

impl MemoryTransport {
    /// Create two linked ends with their event receivers.
    ///
    /// The link starts down; call [`MemoryTransport::connect`] to bring it up.
    pub fn pair(
        a_name: impl Into<String>,
        b_name: impl Into<String>,
    ) -> ((MemoryTransport, EventReceiver), (MemoryTransport, EventReceiver)) {
        let a_name = a_name.into();
        let b_name = b_name.into();
        let (a_tx, a_rx) = event_channel();
        let (b_tx, b_rx) = event_channel();
        let link = Arc::new(LinkState {
            up: AtomicBool::new(false),
        });

        let a = MemoryTransport {
            local_name: a_name.clone(),
            remote_name: b_name.clone(),
            link: link.clone(),
            closed: AtomicBool::new(false),
            local_events: a_tx.clone(),
            peer_events: b_tx.clone(),
        };
        let b = MemoryTransport {
            local_name: b_name,
            remote_name: a_name,
            link,
            closed: AtomicBool::new(false),
            local_events: b_tx,
            peer_events: a_tx,
        };
        ((a, a_rx), (b, b_rx))
    }

    /// Bring the link up and report `Connected` on both ends.
    pub fn connect(&self) {
        if !self.link.up.swap(true, Ordering::SeqCst) {
            debug!("Memory link {} <-> {} up", self.local_name, self.remote_name);
            let _ = self.local_events.send(TransportEvent::Connected);
            let _ = self.peer_events.send(TransportEvent::Connected);
        }
    }

    /// Drop the link and report `Disconnected` on both ends.
    pub fn disconnect(&self) {
        if self.link.up.swap(false, Ordering::SeqCst) {
            debug!("Memory link {} <-> {} down", self.local_name, self.remote_name);
            let _ = self.local_events.send(TransportEvent::Disconnected);
            let _ = self.peer_events.send(TransportEvent::Disconnected);
        }
    }

    /// Report a transport exception on this end only.
    pub fn raise_exception(&self, message: impl Into<String>) {
        let _ = self
            .local_events
            .send(TransportEvent::ExceptionOccurred(message.into()));
    }

    /// Deliver a packet to this end as if the peer had sent it.
    pub fn inject(&self, packet: Packet) -> Result<()> {
        self.local_events
            .send(TransportEvent::MessageReceived(packet))
            .map_err(|_| RpcError::transport("local event receiver dropped"))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::transport(format!(
                "transport '{}' is closed",
                self.local_name
            )));
        }
        if !self.link.up.load(Ordering::SeqCst) {
            return Err(RpcError::transport(format!(
                "'{}' is not connected to '{}'",
                self.local_name, self.remote_name
            )));
        }
        self.peer_events
            .send(TransportEvent::MessageReceived(packet))
            .map_err(|_| RpcError::transport(format!("peer '{}' is gone", self.remote_name)))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.disconnect();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        !self.is_closed() && self.link.up.load(Ordering::SeqCst)
    }

    fn local_name(&self) -> &str {
        &self.local_name
    }

    fn remote_name(&self) -> &str {
        &self.remote_name
    }
}
