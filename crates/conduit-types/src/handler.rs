//! Handler traits for tools, prompts, and resources.
//!
//! Handlers are registered once and may be shared by several proxies, so they
//! are passed around as `Arc<dyn ...Handler>`. Plain async closures implement
//! the traits through blanket impls.

use crate::error::ToolError;
use crate::{BoxFuture, PromptResult, ResourceResult, ToolResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Handles `tools/call` for one registered tool.
pub trait ToolHandler: Send + Sync {
    /// Run the tool with the caller's JSON arguments.
    fn call(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult, ToolError>>;
}

/// Renders one registered prompt.
pub trait PromptHandler: Send + Sync {
    fn render(
        &self,
        arguments: HashMap<String, String>,
    ) -> BoxFuture<'_, Result<PromptResult, ToolError>>;
}

/// Reads one registered resource.
pub trait ResourceHandler: Send + Sync {
    fn read(&self, uri: String) -> BoxFuture<'_, Result<ResourceResult, ToolError>>;
}

impl<F, Fut> ToolHandler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
{
    fn call(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult, ToolError>> {
        Box::pin(self(input))
    }
}

impl<F, Fut> PromptHandler for F
where
    F: Fn(HashMap<String, String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PromptResult, ToolError>> + Send + 'static,
{
    fn render(
        &self,
        arguments: HashMap<String, String>,
    ) -> BoxFuture<'_, Result<PromptResult, ToolError>> {
        Box::pin(self(arguments))
    }
}

impl<F, Fut> ResourceHandler for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResourceResult, ToolError>> + Send + 'static,
{
    fn read(&self, uri: String) -> BoxFuture<'_, Result<ResourceResult, ToolError>> {
        Box::pin(self(uri))
    }
}

pub type SharedToolHandler = Arc<dyn ToolHandler>;
pub type SharedPromptHandler = Arc<dyn PromptHandler>;
pub type SharedResourceHandler = Arc<dyn ResourceHandler>;
