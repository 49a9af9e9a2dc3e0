//! Shared types and error hierarchy for Conduit.

pub mod capability;
pub mod error;
pub mod handler;

pub use capability::*;
pub use error::{
    CapabilityKind, ConduitError, ConfigError, FramingError, LifecycleError, RegistrationError,
    ToolError, TransportError,
};
pub use handler::*;

use std::future::Future;
use std::pin::Pin;

/// A JSON-RPC 2.0 message (request, response, or notification).
///
/// Transports treat this as an opaque payload: they serialize and
/// deserialize it but never look inside.
pub type JsonRpcMessage = serde_json::Value;

/// A boxed, sendable future. Used wherever a trait must stay dyn-compatible.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
