//! Error hierarchy for Conduit.

use std::fmt;
use thiserror::Error;

/// Top-level error type for proxy and bootstrap operations.
#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Proxy '{proxy}' failed to start: {source}")]
    ProxyStart {
        proxy: String,
        #[source]
        source: Box<ConduitError>,
    },
}

/// Errors produced while turning a byte stream into JSON-RPC messages.
///
/// These are always recoverable: the decoder reports them and keeps going.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Missing or invalid Content-Length header in: {header:?}")]
    MissingContentLength { header: String },

    #[error("Invalid JSON-RPC message ({reason}): {text}")]
    InvalidJson { text: String, reason: String },
}

/// Errors from a transport (stdio or tunnel).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection to {url} timed out after {timeout_ms}ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    #[error("Tunnel handshake not acknowledged within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("Tunnel handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Tunnel connection lost: {0}")]
    ConnectionLost(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Transport is closed")]
    Closed,
}

/// The kind of capability a registration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Prompt => "prompt",
            CapabilityKind::Resource => "resource",
        })
    }
}

/// Errors from registering tools, prompts, or resources.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("A {kind} named '{name}' is already registered")]
    Duplicate { kind: CapabilityKind, name: String },

    #[error("A {kind} name must not be empty")]
    EmptyName { kind: CapabilityKind },

    #[error("Invalid {kind} '{name}': {message}")]
    InvalidConfig {
        kind: CapabilityKind,
        name: String,
        message: String,
    },
}

/// Errors from calling lifecycle operations in the wrong order.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} has already been started")]
    AlreadyStarted(String),

    #[error("{0} has been closed")]
    Closed(String),
}

/// Errors returned by tool, prompt, and resource handlers.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid input for '{name}': {message}")]
    InvalidInput { name: String, message: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
