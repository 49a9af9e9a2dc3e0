//! Transports for Conduit.
//!
//! A transport moves opaque JSON-RPC messages between this process and one
//! peer. Two are provided: [`StreamTransport`] speaks the auto-detected
//! Content-Length / newline framing over a byte stream (normally stdio), and
//! [`TunnelTransport`] carries one message per WebSocket frame over an
//! outbound tunnel with reconnection.

pub mod backoff;
pub mod framing;
pub mod stdio;
pub mod transport;
pub mod tunnel;

pub use backoff::{Backoff, ReconnectPolicy};
pub use framing::{FrameDecoder, FramingMode};
pub use stdio::{StdioTransport, StreamTransport};
pub use transport::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};
pub use tunnel::{HandshakeInfo, ProtocolInfo, TunnelConfig, TunnelState, TunnelTransport};
