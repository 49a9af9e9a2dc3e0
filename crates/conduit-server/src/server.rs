//! MCP protocol server: routes decoded JSON-RPC messages to registered handlers.
//!
//! The server is transport-agnostic. A proxy feeds it one inbound message at a
//! time through [`McpServer::handle`] and writes back whatever it returns.

use crate::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::registry::CapabilityRegistry;
use conduit_types::{
    JsonRpcMessage, PromptConfig, RegistrationError, ResourceConfig, SharedPromptHandler,
    SharedResourceHandler, SharedToolHandler, ToolConfig, ToolResult,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Protocol revisions this server speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// An MCP server instance with its own capability registry.
pub struct McpServer {
    name: String,
    version: String,
    registry: RwLock<CapabilityRegistry>,
}

#[derive(Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Deserialize)]
struct GetPromptParams {
    name: String,
    #[serde(default)]
    arguments: HashMap<String, String>,
}

#[derive(Deserialize)]
struct ReadResourceParams {
    uri: String,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            registry: RwLock::new(CapabilityRegistry::new()),
        }
    }

    pub fn register_tool(
        &self,
        name: &str,
        config: ToolConfig,
        handler: SharedToolHandler,
    ) -> Result<(), RegistrationError> {
        self.write().register_tool(name, config, handler)?;
        tracing::debug!(server = %self.name, "Registered tool '{name}'");
        Ok(())
    }

    pub fn register_prompt(
        &self,
        name: &str,
        config: PromptConfig,
        handler: SharedPromptHandler,
    ) -> Result<(), RegistrationError> {
        self.write().register_prompt(name, config, handler)?;
        tracing::debug!(server = %self.name, "Registered prompt '{name}'");
        Ok(())
    }

    pub fn register_resource(
        &self,
        name: &str,
        config: ResourceConfig,
        handler: SharedResourceHandler,
    ) -> Result<(), RegistrationError> {
        self.write().register_resource(name, config, handler)?;
        tracing::debug!(server = %self.name, "Registered resource '{name}'");
        Ok(())
    }

    /// Names of all registered tools, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        self.read()
            .tool_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn prompt_names(&self) -> Vec<String> {
        self.read()
            .prompt_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.read()
            .resource_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Handle one inbound message.
    ///
    /// Returns the response to send back, or `None` for notifications and for
    /// responses from the peer.
    pub async fn handle(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        let Some(object) = message.as_object() else {
            return Some(failure(
                Value::Null,
                JsonRpcError::invalid_request("Expected a JSON-RPC object"),
            ));
        };

        if !object.contains_key("method") {
            if object.contains_key("result") || object.contains_key("error") {
                tracing::debug!(server = %self.name, "Ignoring response from client");
                return None;
            }
            let id = object.get("id").cloned().unwrap_or(Value::Null);
            return Some(failure(id, JsonRpcError::invalid_request("Missing method")));
        }

        let id = object.get("id").cloned();
        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                return Some(failure(
                    id.unwrap_or(Value::Null),
                    JsonRpcError::invalid_request(e.to_string()),
                ));
            }
        };

        let Some(id) = request.id else {
            self.notify(&request.method);
            return None;
        };

        let response = match self.dispatch(&request.method, request.params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                tracing::debug!(
                    server = %self.name,
                    method = %request.method,
                    code = error.code,
                    "Request failed: {}",
                    error.message
                );
                JsonRpcResponse::failure(id, error)
            }
        };
        Some(to_message(response))
    }

    fn notify(&self, method: &str) {
        match method {
            "notifications/initialized" => {
                tracing::info!(server = %self.name, "Client initialized");
            }
            _ => tracing::debug!(server = %self.name, "Ignoring notification {method}"),
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => Ok(self.initialize(params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list("tools", CapabilityRegistry::tool_definitions)),
            "tools/call" => self.call_tool(parse_params(params)?).await,
            "prompts/list" => Ok(self.list("prompts", CapabilityRegistry::prompt_definitions)),
            "prompts/get" => self.get_prompt(parse_params(params)?).await,
            "resources/list" => Ok(self.list(
                "resources",
                CapabilityRegistry::resource_definitions,
            )),
            "resources/read" => self.read_resource(parse_params(params)?).await,
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    fn list(&self, key: &str, definitions: fn(&CapabilityRegistry) -> Vec<Value>) -> Value {
        let entries = definitions(&self.read());
        let mut result = serde_json::Map::new();
        result.insert(key.to_string(), Value::Array(entries));
        Value::Object(result)
    }

    fn initialize(&self, params: Option<&Value>) -> Value {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);

        tracing::info!(
            server = %self.name,
            requested = requested.unwrap_or("none"),
            negotiated = version,
            "Initialize"
        );

        json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": { "listChanged": true },
                "prompts": { "listChanged": true },
                "resources": { "listChanged": true },
            },
            "serverInfo": {
                "name": self.name,
                "version": self.version,
            },
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<Value, JsonRpcError> {
        let handler = self
            .read()
            .tool(&params.name)
            .map(|tool| tool.handler.clone())
            .ok_or_else(|| JsonRpcError::invalid_params(format!("Unknown tool: {}", params.name)))?;

        let input = params.arguments.unwrap_or_else(|| json!({}));
        let result = match handler.call(input).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(server = %self.name, tool = %params.name, "Tool failed: {e}");
                ToolResult::error(e.to_string())
            }
        };
        serialize(&result)
    }

    async fn get_prompt(&self, params: GetPromptParams) -> Result<Value, JsonRpcError> {
        let (handler, missing) = {
            let registry = self.read();
            let prompt = registry.prompt(&params.name).ok_or_else(|| {
                JsonRpcError::invalid_params(format!("Unknown prompt: {}", params.name))
            })?;
            let missing: Vec<String> = prompt
                .config
                .arguments
                .iter()
                .filter(|arg| arg.required && !params.arguments.contains_key(&arg.name))
                .map(|arg| arg.name.clone())
                .collect();
            (prompt.handler.clone(), missing)
        };
        if !missing.is_empty() {
            return Err(JsonRpcError::invalid_params(format!(
                "Missing required arguments for prompt '{}': {}",
                params.name,
                missing.join(", ")
            )));
        }

        let result = handler
            .render(params.arguments)
            .await
            .map_err(|e| JsonRpcError::internal(e.to_string()))?;
        serialize(&result)
    }

    async fn read_resource(&self, params: ReadResourceParams) -> Result<Value, JsonRpcError> {
        let handler = self
            .read()
            .resource_by_uri(&params.uri)
            .map(|resource| resource.handler.clone())
            .ok_or_else(|| JsonRpcError::resource_not_found(&params.uri))?;

        let result = handler
            .read(params.uri)
            .await
            .map_err(|e| JsonRpcError::internal(e.to_string()))?;
        serialize(&result)
    }

    fn read(&self) -> RwLockReadGuard<'_, CapabilityRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CapabilityRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal(e.to_string()))
}

fn failure(id: Value, error: JsonRpcError) -> JsonRpcMessage {
    to_message(JsonRpcResponse::failure(id, error))
}

fn to_message(response: JsonRpcResponse) -> JsonRpcMessage {
    // Plain structs of strings and Values; serialization cannot fail.
    serde_json::to_value(response).unwrap_or(Value::Null)
}
