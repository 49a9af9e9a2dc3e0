//! Tunnel transport against an in-process WebSocket relay.
//!
//! The relay accepts connections on 127.0.0.1 and hands each one to the test
//! as a [`Peer`]; dropping a `Peer` hangs up on the client.

use conduit_transport::{
    HandshakeInfo, ReconnectPolicy, Transport, TransportEvent, TunnelConfig, TunnelState,
    TunnelTransport,
};
use conduit_types::{TransportError, TransportError::Framing};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Relay harness
// ---------------------------------------------------------------------------

struct Relay {
    url: String,
    peers: mpsc::UnboundedReceiver<Peer>,
    accept_task: Option<JoinHandle<()>>,
}

struct Peer {
    frames: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Relay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (peer_tx, peers) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (frame_tx, frames) = mpsc::unbounded_channel();
                let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
                if peer_tx.send(Peer { frames, outbound }).is_err() {
                    break;
                }
                tokio::spawn(async move {
                    let (mut sink, mut source) = ws.split();
                    loop {
                        tokio::select! {
                            out = outbound_rx.recv() => match out {
                                Some(text) => {
                                    if sink.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                            frame = source.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = frame_tx.send(text.as_str().to_string());
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                        }
                    }
                });
            }
        });

        Self {
            url,
            peers,
            accept_task: Some(accept_task),
        }
    }

    async fn accept(&mut self) -> Peer {
        tokio::time::timeout(Duration::from_secs(5), self.peers.recv())
            .await
            .expect("timed out waiting for tunnel connection")
            .expect("relay stopped")
    }

    /// Stop accepting; later connection attempts are refused.
    async fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Peer {
    async fn frame(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed");
        serde_json::from_str(&text).unwrap()
    }

    fn send_text(&self, text: &str) {
        self.outbound.send(text.to_string()).unwrap();
    }
}

fn config(url: &str) -> TunnelConfig {
    let mut config = TunnelConfig::new(
        url,
        HandshakeInfo {
            project_root: "/work/app".into(),
            dev_server_url: "http://localhost:8081".into(),
            protocol: None,
        },
    );
    config.reconnect = ReconnectPolicy {
        max_retries: 3,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_factor: 2.0,
    };
    config
}

async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_precedes_messages() {
    let mut relay = Relay::start().await;
    let transport = TunnelTransport::new(config(&relay.url));

    transport
        .send(&json!({"jsonrpc": "2.0", "method": "early"}))
        .await
        .unwrap();
    let mut rx = transport.start().await.unwrap();
    assert_eq!(transport.state(), TunnelState::Connected);

    let mut peer = relay.accept().await;
    let handshake = peer.frame().await;
    assert_eq!(handshake["type"], "handshake");
    assert_eq!(handshake["projectRoot"], "/work/app");
    assert_eq!(handshake["devServerUrl"], "http://localhost:8081");
    assert_eq!(handshake["sessionId"], transport.session_id());

    // Queued before start, delivered after the handshake.
    assert_eq!(peer.frame().await["method"], "early");

    peer.send_text(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
    match next_event(&mut rx).await {
        TransportEvent::Message(msg) => assert_eq!(msg["method"], "tools/list"),
        other => panic!("expected message, got {other:?}"),
    }

    transport
        .send(&json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}))
        .await
        .unwrap();
    assert_eq!(peer.frame().await["result"]["tools"], json!([]));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn malformed_frame_keeps_socket_open() {
    let mut relay = Relay::start().await;
    let transport = TunnelTransport::new(config(&relay.url));
    let mut rx = transport.start().await.unwrap();
    let mut peer = relay.accept().await;
    peer.frame().await;

    peer.send_text("definitely not json");
    peer.send_text(r#"{"id":2}"#);

    match next_event(&mut rx).await {
        TransportEvent::Error(Framing(e)) => assert!(e.to_string().contains("definitely")),
        other => panic!("expected framing error, got {other:?}"),
    }
    match next_event(&mut rx).await {
        TransportEvent::Message(msg) => assert_eq!(msg, json!({"id": 2})),
        other => panic!("expected message, got {other:?}"),
    }
    assert_eq!(transport.state(), TunnelState::Connected);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn reconnect_resends_handshake_with_same_session() {
    let mut relay = Relay::start().await;
    let transport = TunnelTransport::new(config(&relay.url));
    let mut rx = transport.start().await.unwrap();

    let mut first = relay.accept().await;
    let first_handshake = first.frame().await;
    drop(first);

    match next_event(&mut rx).await {
        TransportEvent::Error(TransportError::ConnectionLost(_)) => {}
        other => panic!("expected ConnectionLost, got {other:?}"),
    }

    let mut second = relay.accept().await;
    let second_handshake = second.frame().await;
    assert_eq!(second_handshake["type"], "handshake");
    assert_eq!(second_handshake["sessionId"], first_handshake["sessionId"]);

    let mut states = transport.subscribe_state();
    states
        .wait_for(|s| *s == TunnelState::Connected)
        .await
        .unwrap();

    transport.send(&json!({"id": 10})).await.unwrap();
    assert_eq!(second.frame().await, json!({"id": 10}));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn reconnect_gives_up_after_max_retries() {
    let mut relay = Relay::start().await;
    let transport = TunnelTransport::new(config(&relay.url));
    let mut rx = transport.start().await.unwrap();

    let mut peer = relay.accept().await;
    peer.frame().await;
    relay.shutdown().await;
    drop(peer);

    let mut errors = Vec::new();
    loop {
        match next_event(&mut rx).await {
            TransportEvent::Error(e) => errors.push(e),
            TransportEvent::Closed => break,
            TransportEvent::Message(m) => panic!("unexpected message {m}"),
        }
    }

    assert!(matches!(errors.first(), Some(TransportError::ConnectionLost(_))));
    assert!(matches!(
        errors.last(),
        Some(TransportError::ReconnectExhausted { attempts: 3 })
    ));
    // Lost + one error per failed attempt + exhausted.
    assert_eq!(errors.len(), 5);
    assert_eq!(transport.state(), TunnelState::Closed);
    assert!(matches!(
        transport.send(&json!({})).await,
        Err(TransportError::Closed)
    ));

    transport.close().await.unwrap();
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn acknowledged_handshake() {
    let mut relay = Relay::start().await;
    let mut cfg = config(&relay.url);
    cfg.require_ack = true;
    let transport = TunnelTransport::new(cfg);

    let (started, _peer) = tokio::join!(transport.start(), async {
        let mut peer = relay.accept().await;
        assert_eq!(peer.frame().await["type"], "handshake");
        peer.send_text(r#"{"type":"handshake_ack"}"#);
        peer
    });

    assert!(started.is_ok());
    assert_eq!(transport.state(), TunnelState::Connected);
    transport.close().await.unwrap();
}

#[tokio::test]
async fn rejected_handshake() {
    let mut relay = Relay::start().await;
    let mut cfg = config(&relay.url);
    cfg.require_ack = true;
    let transport = TunnelTransport::new(cfg);

    let (started, _peer) = tokio::join!(transport.start(), async {
        let mut peer = relay.accept().await;
        peer.frame().await;
        peer.send_text(r#"{"type":"handshake_error","message":"unknown project"}"#);
        peer
    });

    match started {
        Err(TransportError::HandshakeRejected(msg)) => assert_eq!(msg, "unknown project"),
        other => panic!("expected HandshakeRejected, got {other:?}"),
    }
    assert_eq!(transport.state(), TunnelState::Closed);
}

#[tokio::test]
async fn unacknowledged_handshake_times_out() {
    let mut relay = Relay::start().await;
    let mut cfg = config(&relay.url);
    cfg.require_ack = true;
    cfg.handshake_timeout = Duration::from_millis(100);
    let transport = TunnelTransport::new(cfg);

    let (started, _peer) = tokio::join!(transport.start(), relay.accept());
    assert!(matches!(
        started,
        Err(TransportError::HandshakeTimeout { timeout_ms: 100 })
    ));
}

#[tokio::test]
async fn close_during_handshake_cancels_start() {
    let mut relay = Relay::start().await;
    let mut cfg = config(&relay.url);
    cfg.require_ack = true;
    cfg.handshake_timeout = Duration::from_secs(30);
    let transport = TunnelTransport::new(cfg);

    let (started, closed) = tokio::join!(transport.start(), async {
        let mut peer = relay.accept().await;
        peer.frame().await;
        transport.close().await
    });

    assert!(matches!(started, Err(TransportError::Closed)));
    assert!(closed.is_ok());
    assert_eq!(transport.state(), TunnelState::Closed);
}

#[tokio::test]
async fn connect_failure_is_reported_from_start() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = TunnelTransport::new(config(&url));
    assert!(matches!(
        transport.start().await,
        Err(TransportError::WebSocket(_))
    ));
    assert_eq!(transport.state(), TunnelState::Closed);
}

#[tokio::test]
async fn close_twice_emits_closed_once() {
    let mut relay = Relay::start().await;
    let transport = TunnelTransport::new(config(&relay.url));
    let mut rx = transport.start().await.unwrap();
    let _peer = relay.accept().await;

    transport.close().await.unwrap();
    transport.close().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed));
    assert!(rx.recv().await.is_none());
}
