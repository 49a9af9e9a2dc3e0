//! Byte-stream transport (stdin/stdout by default).
//!
//! A background reader task feeds incoming bytes through a [`FrameDecoder`]
//! and forwards decoded messages as [`TransportEvent`]s. Outgoing messages are
//! framed in whatever mode the decoder detected from the peer.

use crate::framing::{self, FrameDecoder};
use crate::transport::{EventSender, Transport, TransportEvent};
use conduit_types::{BoxFuture, JsonRpcMessage, LifecycleError, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Transport over an arbitrary async reader/writer pair.
pub struct StreamTransport<R, W> {
    kind: String,
    reader: Mutex<Option<R>>,
    writer: Mutex<W>,
    decoder: Arc<Mutex<FrameDecoder>>,
    events: Mutex<Option<EventSender>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

/// The process's own stdin/stdout.
pub type StdioTransport = StreamTransport<tokio::io::Stdin, tokio::io::Stdout>;

impl StdioTransport {
    pub fn stdio() -> Self {
        StreamTransport::new("stdio", tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(kind: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            kind: kind.into(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(writer),
            decoder: Arc::new(Mutex::new(FrameDecoder::new())),
            events: Mutex::new(None),
            reader_handle: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The framing mode detected on the input side so far.
    pub async fn framing_mode(&self) -> framing::FramingMode {
        self.decoder.lock().await.mode()
    }

    async fn start_inner(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LifecycleError::Closed(self.kind.clone()).into());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyStarted(self.kind.clone()).into());
        }

        let reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| LifecycleError::AlreadyStarted(self.kind.clone()))?;

        let (events, rx) = EventSender::channel();
        *self.events.lock().await = Some(events.clone());

        let handle = tokio::spawn(read_loop(
            self.kind.clone(),
            reader,
            Arc::clone(&self.decoder),
            events,
        ));
        *self.reader_handle.lock().await = Some(handle);

        tracing::debug!(transport = %self.kind, "Transport started");
        Ok(rx)
    }

    async fn send_inner(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mode = self.decoder.lock().await.mode();
        let frame = framing::encode(mode, message)?;

        // Holding the lock across the write keeps frames whole and in order,
        // and awaiting the write applies the stream's backpressure.
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close_inner(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        self.decoder.lock().await.clear();
        if let Some(events) = self.events.lock().await.take() {
            events.closed_now();
        }

        tracing::debug!(transport = %self.kind, "Transport closed");
        Ok(())
    }
}

impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
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

/// Read chunks, decode, and forward events until EOF.
///
/// A read error is reported and ends the loop without closing the
/// transport; the owner decides what to do about it.
async fn read_loop<R>(
    kind: String,
    mut reader: R,
    decoder: Arc<Mutex<FrameDecoder>>,
    events: EventSender,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(transport = %kind, "Read failed: {e}");
                events.error(e.into()).await;
                return;
            }
        };

        let decoded = decoder.lock().await.feed(&chunk[..n]);
        for item in decoded {
            let delivered = match item {
                Ok(message) => events.message(message).await,
                Err(e) => {
                    tracing::debug!(transport = %kind, "Dropping malformed frame: {e}");
                    events.error(e.into()).await
                }
            };
            if !delivered {
                return;
            }
        }
    }

    tracing::debug!(transport = %kind, "Input reached end of stream");
    events.closed().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FramingMode;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    type PipeTransport = StreamTransport<DuplexStream, DuplexStream>;

    /// Returns the transport, the peer's writer (our input) and the peer's
    /// reader (our output).
    fn pipe() -> (PipeTransport, DuplexStream, DuplexStream) {
        let (input, peer_writer) = tokio::io::duplex(4096);
        let (output, peer_reader) = tokio::io::duplex(4096);
        (
            StreamTransport::new("test", input, output),
            peer_writer,
            peer_reader,
        )
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn expect_message(rx: &mut mpsc::Receiver<TransportEvent>) -> JsonRpcMessage {
        match next_event(rx).await {
            TransportEvent::Message(m) => m,
            other => panic!("expected message, got {other:?}"),
        }
    }

    async fn assert_quiet(rx: &mut mpsc::Receiver<TransportEvent>) {
        let res = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(res.is_err(), "expected no event, got {res:?}");
    }

    #[tokio::test]
    async fn newline_input_gets_newline_output() {
        let (transport, mut peer_writer, peer_reader) = pipe();
        let mut rx = transport.start().await.unwrap();

        peer_writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let msg = expect_message(&mut rx).await;
        assert_eq!(msg["method"], "ping");
        assert_eq!(transport.framing_mode().await, FramingMode::Newline);

        transport
            .send(&json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
            .await
            .unwrap();

        let mut line = String::new();
        BufReader::new(peer_reader)
            .read_line(&mut line)
            .await
            .unwrap();
        assert_eq!(line, "{\"id\":1,\"jsonrpc\":\"2.0\",\"result\":{}}\n");
    }

    #[tokio::test]
    async fn content_length_input_gets_content_length_output() {
        let (transport, mut peer_writer, mut peer_reader) = pipe();
        let mut rx = transport.start().await.unwrap();

        peer_writer
            .write_all(b"Content-Length: 8\r\n\r\n{\"id\":1}")
            .await
            .unwrap();
        expect_message(&mut rx).await;

        transport.send(&json!({"id": 1})).await.unwrap();
        let mut buf = vec![0u8; 29];
        peer_reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"Content-Length: 8\r\n\r\n{\"id\":1}");
    }

    #[tokio::test]
    async fn send_before_detection_uses_content_length() {
        let (transport, _peer_writer, mut peer_reader) = pipe();
        let _rx = transport.start().await.unwrap();

        transport.send(&json!({"id": 1})).await.unwrap();
        let mut buf = vec![0u8; 29];
        peer_reader.read_exact(&mut buf).await.unwrap();
        assert!(buf.starts_with(b"Content-Length: 8\r\n\r\n"));
    }

    #[tokio::test]
    async fn split_frame_dispatches_once_complete() {
        let (transport, mut peer_writer, _peer_reader) = pipe();
        let mut rx = transport.start().await.unwrap();

        peer_writer
            .write_all(b"Content-Length: 18\r\n\r\n")
            .await
            .unwrap();
        assert_quiet(&mut rx).await;
        peer_writer.write_all(b"{\"id\":1,").await.unwrap();
        assert_quiet(&mut rx).await;
        peer_writer.write_all(b"\"ok\":true}").await.unwrap();

        assert_eq!(expect_message(&mut rx).await, json!({"id": 1, "ok": true}));
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn malformed_line_reports_error_in_order() {
        let (transport, mut peer_writer, _peer_reader) = pipe();
        let mut rx = transport.start().await.unwrap();

        peer_writer
            .write_all(b"{\"id\":1}\ngarbage\n{\"id\":2}\n")
            .await
            .unwrap();

        assert_eq!(expect_message(&mut rx).await, json!({"id": 1}));
        match next_event(&mut rx).await {
            TransportEvent::Error(TransportError::Framing(e)) => {
                assert!(e.to_string().contains("garbage"));
            }
            other => panic!("expected framing error, got {other:?}"),
        }
        assert_eq!(expect_message(&mut rx).await, json!({"id": 2}));
    }

    #[tokio::test]
    async fn eof_emits_closed_once() {
        let (transport, peer_writer, _peer_reader) = pipe();
        let mut rx = transport.start().await.unwrap();

        drop(peer_writer);
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed));

        transport.close().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_closed_once() {
        let (transport, _peer_writer, _peer_reader) = pipe();
        let mut rx = transport.start().await.unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn lifecycle_misuse_fails_fast() {
        let (transport, _peer_writer, _peer_reader) = pipe();
        let _rx = transport.start().await.unwrap();

        match transport.start().await {
            Err(TransportError::Lifecycle(LifecycleError::AlreadyStarted(kind))) => {
                assert_eq!(kind, "test");
            }
            other => panic!("expected AlreadyStarted, got {other:?}"),
        }

        transport.close().await.unwrap();
        assert!(matches!(
            transport.send(&json!({})).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn start_after_close_fails() {
        let (transport, _peer_writer, _peer_reader) = pipe();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.start().await,
            Err(TransportError::Lifecycle(LifecycleError::Closed(_)))
        ));
    }

    #[tokio::test]
    async fn sends_preserve_call_order() {
        let (transport, mut peer_writer, peer_reader) = pipe();
        let mut rx = transport.start().await.unwrap();
        peer_writer.write_all(b"{}\n").await.unwrap();
        expect_message(&mut rx).await;

        for id in 0..20 {
            transport.send(&json!({"id": id})).await.unwrap();
        }

        let mut lines = BufReader::new(peer_reader).lines();
        for id in 0..20 {
            let line = lines.next_line().await.unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["id"], id);
        }
    }
}
