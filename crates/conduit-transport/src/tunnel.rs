//! WebSocket tunnel transport.
//!
//! Opens an outbound WebSocket to a remote relay so the local server can be
//! reached without listening on a port. The first frame of every connection
//! is a handshake identifying the session; after that each text frame carries
//! exactly one JSON-RPC message. Unexpected disconnects are retried with
//! exponential backoff, and the handshake is resent on every reconnection.
//!
//! Delivery is at-most-once: a message in flight when the socket dies is lost.

use crate::backoff::ReconnectPolicy;
use crate::transport::{EventSender, Transport, TransportEvent};
use conduit_types::{BoxFuture, FramingError, JsonRpcMessage, LifecycleError, TransportError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    Reconnecting,
    Closed,
}

/// Protocol name/version optionally declared in the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolInfo {
    pub name: String,
    pub version: String,
}

/// Session identity sent as the first frame of every connection.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub project_root: String,
    pub dev_server_url: String,
    pub protocol: Option<ProtocolInfo>,
}

/// Settings for one tunnel transport.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// `ws://` or `wss://` URL of the relay.
    pub url: String,
    pub handshake: HandshakeInfo,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Wait for `{"type":"handshake_ack"}` before treating the tunnel as up.
    pub require_ack: bool,
    pub reconnect: ReconnectPolicy,
}

impl TunnelConfig {
    pub fn new(url: impl Into<String>, handshake: HandshakeInfo) -> Self {
        Self {
            url: url.into(),
            handshake,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            require_ack: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    session_id: &'a str,
    project_root: &'a str,
    dev_server_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<&'a ProtocolInfo>,
}

/// Transport backed by an outbound WebSocket tunnel.
pub struct TunnelTransport {
    config: Arc<TunnelConfig>,
    session_id: String,
    state: Arc<watch::Sender<TunnelState>>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    events: Mutex<Option<EventSender>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl TunnelTransport {
    pub fn new(config: TunnelConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(TunnelState::Idle);
        Self {
            config: Arc::new(config),
            session_id: uuid::Uuid::new_v4().to_string(),
            state: Arc::new(state),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            events: Mutex::new(None),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Id carried in every handshake; stable across reconnections.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    async fn start_inner(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LifecycleError::Closed("tunnel".into()).into());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyStarted("tunnel".into()).into());
        }

        let outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| LifecycleError::AlreadyStarted("tunnel".into()))?;

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            result = connect_and_handshake(&self.config, &self.session_id, &self.state) => result,
        };
        let ws = match connected {
            Ok(ws) => ws,
            Err(e) => {
                self.state.send_replace(TunnelState::Closed);
                return Err(e);
            }
        };

        let (events, rx) = EventSender::channel();
        *self.events.lock().await = Some(events.clone());

        let session = Session {
            config: Arc::clone(&self.config),
            session_id: self.session_id.clone(),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            events,
        };
        *self.task.lock().await = Some(tokio::spawn(session.run(ws, outbound_rx)));

        Ok(rx)
    }

    async fn send_inner(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || self.state() == TunnelState::Closed {
            return Err(TransportError::Closed);
        }
        let text = serde_json::to_string(message)?;
        self.outbound_tx
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close_inner(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        if let Some(mut handle) = self.task.lock().await.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.state.send_replace(TunnelState::Closed);
        if let Some(events) = self.events.lock().await.take() {
            events.closed_now();
        }

        tracing::info!(url = %self.config.url, "Tunnel closed");
        Ok(())
    }
}

impl Transport for TunnelTransport {
    fn kind(&self) -> &str {
        "tunnel"
    }

    fn start(&self) -> BoxFuture<'_, Result<mpsc::Receiver<TransportEvent>, TransportError>> {
        Box::pin(self.start_inner())
    }

    fn send<'a>(
        &'a self,
        message: &'a JsonRpcMessage,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.send_inner(message))
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.close_inner())
    }
}

/// Why a connected socket stopped pumping.
enum PumpExit {
    Cancelled,
    Lost(String),
}

/// State owned by the background connection task.
struct Session {
    config: Arc<TunnelConfig>,
    session_id: String,
    state: Arc<watch::Sender<TunnelState>>,
    cancel: CancellationToken,
    events: EventSender,
}

impl Session {
    async fn run(self, ws: WsStream, mut outbound: mpsc::Receiver<String>) {
        let mut ws = ws;
        loop {
            let (mut sink, mut source) = ws.split();
            let reason = match self.pump(&mut sink, &mut source, &mut outbound).await {
                PumpExit::Cancelled => {
                    let _ = sink.close().await;
                    break;
                }
                PumpExit::Lost(reason) => reason,
            };

            tracing::warn!(url = %self.config.url, "Tunnel connection lost: {reason}");
            self.events
                .error(TransportError::ConnectionLost(reason))
                .await;

            match self.reconnect().await {
                Some(next) => ws = next,
                None => break,
            }
        }

        self.state.send_replace(TunnelState::Closed);
        if self.cancel.is_cancelled() {
            self.events.closed_now();
        } else {
            self.events.closed().await;
        }
    }

    async fn pump(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        outbound: &mut mpsc::Receiver<String>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                outgoing = outbound.recv() => {
                    // All senders gone means the transport itself was dropped.
                    let Some(text) = outgoing else { return PumpExit::Cancelled };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return PumpExit::Lost(e.to_string());
                    }
                }
                incoming = source.next() => match incoming {
                    None => return PumpExit::Lost("stream ended".into()),
                    Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by remote".into());
                        return PumpExit::Lost(reason);
                    }
                    Some(Ok(message)) => {
                        if !self.dispatch(message).await {
                            return PumpExit::Cancelled;
                        }
                    }
                },
            }
        }
    }

    /// Decode one inbound frame. Returns `false` once nobody is listening.
    async fn dispatch(&self, message: Message) -> bool {
        let text = match &message {
            Message::Text(text) => text.as_str(),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(e) => {
                    return self
                        .events
                        .error(TransportError::Framing(FramingError::InvalidJson {
                            text: String::from_utf8_lossy(data).into_owned(),
                            reason: e.to_string(),
                        }))
                        .await;
                }
            },
            // Ping/Pong are answered by tungstenite itself.
            _ => return true,
        };

        match serde_json::from_str(text) {
            Ok(value) => self.events.message(value).await,
            Err(e) => {
                tracing::debug!("Dropping malformed tunnel frame: {e}");
                self.events
                    .error(TransportError::Framing(FramingError::InvalidJson {
                        text: text.to_string(),
                        reason: e.to_string(),
                    }))
                    .await
            }
        }
    }

    /// Try to re-establish the tunnel. `None` means cancelled or exhausted.
    async fn reconnect(&self) -> Option<WsStream> {
        self.state.send_replace(TunnelState::Reconnecting);
        let policy = &self.config.reconnect;

        for (attempt, delay) in policy.delays() {
            tracing::info!(
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting tunnel"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = connect_and_handshake(&self.config, &self.session_id, &self.state) => result,
            };
            match result {
                Ok(ws) => return Some(ws),
                Err(e) => {
                    tracing::warn!(attempt, "Tunnel reconnect failed: {e}");
                    self.state.send_replace(TunnelState::Reconnecting);
                    self.events.error(e).await;
                }
            }
        }

        tracing::warn!(url = %self.config.url, "Giving up on tunnel");
        self.events
            .error(TransportError::ReconnectExhausted {
                attempts: policy.max_retries,
            })
            .await;
        None
    }
}

/// Open the socket and send the handshake (and wait for the ack if required).
async fn connect_and_handshake(
    config: &TunnelConfig,
    session_id: &str,
    state: &watch::Sender<TunnelState>,
) -> Result<WsStream, TransportError> {
    state.send_replace(TunnelState::Connecting);
    tracing::debug!(url = %config.url, "Connecting tunnel");

    let connect = tokio_tungstenite::connect_async(config.url.as_str());
    let (mut ws, _response) = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            url: config.url.clone(),
            timeout_ms: config.connect_timeout.as_millis() as u64,
        })?
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    state.send_replace(TunnelState::Handshaking);
    let frame = handshake_frame(&config.handshake, session_id)?;
    ws.send(Message::Text(frame.into()))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    if config.require_ack {
        await_ack(&mut ws, config.handshake_timeout).await?;
    }

    state.send_replace(TunnelState::Connected);
    tracing::info!(url = %config.url, session_id, "Tunnel connected");
    Ok(ws)
}

fn handshake_frame(info: &HandshakeInfo, session_id: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&HandshakeFrame {
        kind: "handshake",
        session_id,
        project_root: &info.project_root,
        dev_server_url: &info.dev_server_url,
        protocol: info.protocol.as_ref(),
    })
}

async fn await_ack(ws: &mut WsStream, timeout: Duration) -> Result<(), TransportError> {
    let wait = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return check_ack(text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::HandshakeRejected(
                        "connection closed before acknowledgement".into(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| TransportError::HandshakeTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })?
}

fn check_ack(text: &str) -> Result<(), TransportError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        TransportError::HandshakeRejected(format!("invalid acknowledgement ({e}): {text}"))
    })?;
    match value["type"].as_str() {
        Some("handshake_ack") => Ok(()),
        Some("handshake_error") => Err(TransportError::HandshakeRejected(
            value["message"]
                .as_str()
                .unwrap_or("no reason given")
                .to_string(),
        )),
        _ => Err(TransportError::HandshakeRejected(format!(
            "unexpected frame before acknowledgement: {text}"
        ))),
    }
}
