//! End-to-end: MCP clients talking to proxies over framed byte streams.

use conduit_server::{CompositeServerProxy, McpServerProxy, ServerProxy};
use conduit_transport::StreamTransport;
use conduit_types::{
    ResourceConfig, ResourceContents, ResourceResult, ToolConfig, ToolError, ToolResult,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// The client's side of one proxy's pipes.
struct Client {
    writer: DuplexStream,
    reader: BufReader<DuplexStream>,
}

impl Client {
    async fn send_line(&mut self, message: Value) {
        let mut line = serde_json::to_vec(&message).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    async fn send_framed(&mut self, message: Value) {
        let body = serde_json::to_vec(&message).unwrap();
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes()).await.unwrap();
        self.writer.write_all(&body).await.unwrap();
    }

    async fn recv_line(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn recv_framed(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut header = String::new();
            self.reader.read_line(&mut header).await.unwrap();
            let length: usize = header
                .trim()
                .strip_prefix("Content-Length: ")
                .expect("Content-Length header")
                .parse()
                .unwrap();
            let mut blank = String::new();
            self.reader.read_line(&mut blank).await.unwrap();
            assert_eq!(blank, "\r\n");

            let mut body = vec![0u8; length];
            self.reader.read_exact(&mut body).await.unwrap();
            serde_json::from_slice(&body).unwrap()
        })
        .await
        .expect("timed out waiting for framed response")
    }
}

fn pipe_proxy(label: &str) -> (Box<dyn ServerProxy>, Client) {
    let (client_out, server_in) = tokio::io::duplex(16 * 1024);
    let (server_out, client_in) = tokio::io::duplex(16 * 1024);
    let transport = StreamTransport::new(label, server_in, server_out);
    let proxy = McpServerProxy::new(label, Arc::new(transport), None);
    let client = Client {
        writer: client_out,
        reader: BufReader::new(client_in),
    };
    (Box::new(proxy), client)
}

#[tokio::test]
async fn one_registration_serves_every_transport() {
    let (stdio, mut newline_client) = pipe_proxy("stdio");
    let (tunnel, mut framed_client) = pipe_proxy("tunnel");
    let composite = CompositeServerProxy::new(
        vec![stdio, tunnel],
        Some("http://localhost:8081".into()),
    )
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    composite
        .register_tool(
            "add",
            ToolConfig::new("Add", "Add two numbers").with_input_schema(json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            })),
            Arc::new(move |input: Value| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let (Some(a), Some(b)) = (input["a"].as_i64(), input["b"].as_i64()) else {
                        return Err(ToolError::InvalidInput {
                            name: "add".into(),
                            message: "a and b must be integers".into(),
                        });
                    };
                    Ok(ToolResult::text((a + b).to_string()))
                }
            }),
        )
        .unwrap();
    composite.start().await.unwrap();

    // Newline client.
    newline_client
        .send_line(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "2025-03-26", "capabilities": {}}}))
        .await;
    let init = newline_client.recv_line().await;
    assert_eq!(init["result"]["protocolVersion"], "2025-03-26");

    newline_client
        .send_line(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": 2, "b": 3}}}))
        .await;
    let resp = newline_client.recv_line().await;
    assert_eq!(resp["id"], 2);
    assert_eq!(resp["result"]["content"][0]["text"], "5");

    // Content-Length client, same handler.
    framed_client
        .send_framed(json!({"jsonrpc": "2.0", "id": "x", "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": "two"}}}))
        .await;
    let resp = framed_client.recv_framed().await;
    assert_eq!(resp["id"], "x");
    assert_eq!(resp["result"]["isError"], true);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(composite.dev_server_url(), Some("http://localhost:8081"));

    composite.close().await.unwrap();
    composite.close().await.unwrap();
}

#[tokio::test]
async fn resources_are_readable_through_a_single_proxy() {
    let (proxy, mut client) = pipe_proxy("stdio");
    proxy
        .register_resource(
            "session",
            ResourceConfig {
                uri: "conduit://session".into(),
                mime_type: Some("application/json".into()),
                ..ResourceConfig::default()
            },
            Arc::new(|uri: String| async move {
                Ok::<_, ToolError>(ResourceResult {
                    contents: vec![ResourceContents::text(
                        uri,
                        Some("application/json"),
                        r#"{"projectRoot":"/work/app"}"#,
                    )],
                })
            }),
        )
        .unwrap();
    proxy.start().await.unwrap();

    client
        .send_framed(json!({"jsonrpc": "2.0", "id": 1, "method": "resources/read",
            "params": {"uri": "conduit://session"}}))
        .await;
    let resp = client.recv_framed().await;
    let text = resp["result"]["contents"][0]["text"].as_str().unwrap();
    assert_eq!(
        serde_json::from_str::<Value>(text).unwrap()["projectRoot"],
        "/work/app"
    );

    client
        .send_framed(json!({"jsonrpc": "2.0", "id": 2, "method": "resources/read",
            "params": {"uri": "conduit://nope"}}))
        .await;
    let resp = client.recv_framed().await;
    assert_eq!(resp["error"]["code"], -32002);

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn malformed_input_does_not_stop_the_proxy() {
    let (proxy, mut client) = pipe_proxy("stdio");
    proxy.start().await.unwrap();

    client
        .send_line(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .await;
    assert_eq!(client.recv_line().await["id"], 1);

    client.writer.write_all(b"this is not json\n").await.unwrap();
    client
        .send_line(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .await;
    assert_eq!(client.recv_line().await["id"], 2);

    proxy.close().await.unwrap();
}
