//! MCP protocol server and server proxies for Conduit.
//!
//! [`McpServer`] answers MCP requests from a [`CapabilityRegistry`].
//! [`McpServerProxy`] binds one server to one transport, and
//! [`CompositeServerProxy`] fans one set of registrations out to several
//! proxies so the same handlers are reachable over every active transport.

pub mod composite;
pub mod jsonrpc;
pub mod proxy;
pub mod registry;
pub mod server;

pub use composite::CompositeServerProxy;
pub use jsonrpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use proxy::{McpServerProxy, ServerProxy};
pub use registry::CapabilityRegistry;
pub use server::{McpServer, SUPPORTED_PROTOCOL_VERSIONS};
