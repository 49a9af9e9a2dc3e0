//! Built-in capabilities describing the running session.

use conduit_config::{ConduitConfig, TransportKind};
use conduit_server::ServerProxy;
use conduit_types::{
    Content, ConduitError, ResourceConfig, ResourceContents, ResourceResult, ToolAnnotations,
    ToolConfig, ToolError, ToolResult,
};
use serde::Serialize;
use std::sync::Arc;

pub const SESSION_TOOL: &str = "session_info";
pub const SESSION_RESOURCE: &str = "session";
pub const SESSION_URI: &str = "conduit://session";

/// What a client can learn about this process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub project_root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_server_url: Option<String>,
    pub transports: Vec<String>,
    pub version: &'static str,
}

impl SessionInfo {
    pub fn new(config: &ConduitConfig, transports: &[TransportKind]) -> Self {
        Self {
            project_root: config.project_root.display().to_string(),
            dev_server_url: config.dev_server_url.clone(),
            transports: transports.iter().map(ToString::to_string).collect(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    fn to_json(&self) -> Result<(serde_json::Value, String), ToolError> {
        let value =
            serde_json::to_value(self).map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok((value, text))
    }
}

/// Register the `session_info` tool and the `conduit://session` resource.
pub fn register(proxy: &dyn ServerProxy, info: SessionInfo) -> Result<(), ConduitError> {
    let info = Arc::new(info);

    let tool_info = Arc::clone(&info);
    proxy.register_tool(
        SESSION_TOOL,
        ToolConfig {
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(true),
                idempotent_hint: Some(true),
                ..ToolAnnotations::default()
            }),
            ..ToolConfig::new(
                "Session info",
                "Describe the project root, dev server, and active transports",
            )
        },
        Arc::new(move |_input: serde_json::Value| {
            let info = Arc::clone(&tool_info);
            async move {
                let (value, text) = info.to_json()?;
                Ok::<_, ToolError>(ToolResult {
                    content: vec![Content::text(text)],
                    structured_content: Some(value),
                    is_error: false,
                })
            }
        }),
    )?;

    proxy.register_resource(
        SESSION_RESOURCE,
        ResourceConfig {
            uri: SESSION_URI.into(),
            title: Some("Session".into()),
            description: Some("The running Conduit session as JSON".into()),
            mime_type: Some("application/json".into()),
        },
        Arc::new(move |uri: String| {
            let info = Arc::clone(&info);
            async move {
                let (_, text) = info.to_json()?;
                Ok::<_, ToolError>(ResourceResult {
                    contents: vec![ResourceContents::text(uri, Some("application/json"), text)],
                })
            }
        }),
    )?;

    Ok(())
}
