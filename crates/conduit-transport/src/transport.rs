//! The transport contract shared by stdio and tunnel transports.

use conduit_types::{BoxFuture, JsonRpcMessage, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Capacity of the per-transport event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened on a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound message.
    Message(JsonRpcMessage),
    /// A recoverable or fatal error. The transport stays open until `Closed`.
    Error(TransportError),
    /// The transport is gone. Emitted at most once and always last.
    Closed,
}

/// A bidirectional JSON-RPC message channel to one peer.
///
/// `start` hands out the only event receiver, so exactly one consumer sees
/// each event. Dyn-compatible so proxies can hold `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Short name for logs and errors (e.g. "stdio", "tunnel").
    fn kind(&self) -> &str;

    /// Begin receiving. Fails if called more than once or after `close`.
    fn start(&self) -> BoxFuture<'_, Result<mpsc::Receiver<TransportEvent>, TransportError>>;

    /// Send one message. Calls on one transport are written in call order.
    fn send<'a>(
        &'a self,
        message: &'a JsonRpcMessage,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Release the transport's resources. Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Sending half of a transport's event channel.
///
/// Clones share the "closed" flag so `Closed` goes out only once no matter
/// which task notices the end first.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSender {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sender = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (sender, rx)
    }

    /// Deliver a message. Returns `false` once the receiver is gone.
    pub(crate) async fn message(&self, message: JsonRpcMessage) -> bool {
        self.tx.send(TransportEvent::Message(message)).await.is_ok()
    }

    pub(crate) async fn error(&self, error: TransportError) -> bool {
        self.tx.send(TransportEvent::Error(error)).await.is_ok()
    }

    /// Emit `Closed` unless it was already emitted.
    pub(crate) async fn closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(TransportEvent::Closed).await;
        }
    }

    /// Like [`closed`](Self::closed) but never waits for channel capacity.
    pub(crate) fn closed_now(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.try_send(TransportEvent::Closed);
        }
    }
}
