//! Capability registry for name-based dispatch.

use conduit_types::{
    CapabilityKind, PromptConfig, RegistrationError, ResourceConfig, SharedPromptHandler,
    SharedResourceHandler, SharedToolHandler, ToolConfig,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Clone)]
pub struct RegisteredTool {
    pub name: String,
    pub config: ToolConfig,
    pub handler: SharedToolHandler,
}

#[derive(Clone)]
pub struct RegisteredPrompt {
    pub name: String,
    pub config: PromptConfig,
    pub handler: SharedPromptHandler,
}

#[derive(Clone)]
pub struct RegisteredResource {
    pub name: String,
    pub config: ResourceConfig,
    pub handler: SharedResourceHandler,
}

/// Tools, prompts, and resources known to one server.
///
/// Names are unique per kind. Resources are additionally unique by URI,
/// which is what `resources/read` looks them up by. Listings are sorted by
/// name so every transport sees the same order.
#[derive(Default)]
pub struct CapabilityRegistry {
    tools: BTreeMap<String, RegisteredTool>,
    prompts: BTreeMap<String, RegisteredPrompt>,
    resources: BTreeMap<String, RegisteredResource>,
    resource_uris: HashMap<String, String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails on an empty or already-used name.
    pub fn register_tool(
        &mut self,
        name: &str,
        config: ToolConfig,
        handler: SharedToolHandler,
    ) -> Result<(), RegistrationError> {
        check_name(CapabilityKind::Tool, name, self.tools.contains_key(name))?;
        for (field, schema) in [
            ("inputSchema", &config.input_schema),
            ("outputSchema", &config.output_schema),
        ] {
            if let Some(schema) = schema {
                if !schema.is_object() {
                    return Err(RegistrationError::InvalidConfig {
                        kind: CapabilityKind::Tool,
                        name: name.to_string(),
                        message: format!("{field} must be a JSON object"),
                    });
                }
            }
        }

        self.tools.insert(
            name.to_string(),
            RegisteredTool {
                name: name.to_string(),
                config,
                handler,
            },
        );
        Ok(())
    }

    pub fn register_prompt(
        &mut self,
        name: &str,
        config: PromptConfig,
        handler: SharedPromptHandler,
    ) -> Result<(), RegistrationError> {
        check_name(CapabilityKind::Prompt, name, self.prompts.contains_key(name))?;
        let mut seen = HashSet::new();
        for arg in &config.arguments {
            if !seen.insert(arg.name.as_str()) {
                return Err(RegistrationError::InvalidConfig {
                    kind: CapabilityKind::Prompt,
                    name: name.to_string(),
                    message: format!("argument '{}' is declared twice", arg.name),
                });
            }
        }

        self.prompts.insert(
            name.to_string(),
            RegisteredPrompt {
                name: name.to_string(),
                config,
                handler,
            },
        );
        Ok(())
    }

    pub fn register_resource(
        &mut self,
        name: &str,
        config: ResourceConfig,
        handler: SharedResourceHandler,
    ) -> Result<(), RegistrationError> {
        check_name(
            CapabilityKind::Resource,
            name,
            self.resources.contains_key(name),
        )?;
        if config.uri.trim().is_empty() {
            return Err(RegistrationError::InvalidConfig {
                kind: CapabilityKind::Resource,
                name: name.to_string(),
                message: "uri must not be empty".to_string(),
            });
        }
        if let Some(owner) = self.resource_uris.get(&config.uri) {
            return Err(RegistrationError::InvalidConfig {
                kind: CapabilityKind::Resource,
                name: name.to_string(),
                message: format!("uri '{}' is already served by '{owner}'", config.uri),
            });
        }

        self.resource_uris.insert(config.uri.clone(), name.to_string());
        self.resources.insert(
            name.to_string(),
            RegisteredResource {
                name: name.to_string(),
                config,
                handler,
            },
        );
        Ok(())
    }

    pub fn tool(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn prompt(&self, name: &str) -> Option<&RegisteredPrompt> {
        self.prompts.get(name)
    }

    pub fn resource_by_uri(&self, uri: &str) -> Option<&RegisteredResource> {
        self.resource_uris
            .get(uri)
            .and_then(|name| self.resources.get(name))
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn prompt_names(&self) -> Vec<&str> {
        self.prompts.keys().map(String::as_str).collect()
    }

    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Entries for a `tools/list` result.
    pub fn tool_definitions(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                let mut entry = to_object(&tool.config);
                entry.insert("name".into(), json!(tool.name));
                entry
                    .entry("inputSchema")
                    .or_insert_with(|| json!({"type": "object", "properties": {}}));
                Value::Object(entry)
            })
            .collect()
    }

    /// Entries for a `prompts/list` result.
    pub fn prompt_definitions(&self) -> Vec<Value> {
        self.prompts
            .values()
            .map(|prompt| {
                let mut entry = to_object(&prompt.config);
                entry.insert("name".into(), json!(prompt.name));
                Value::Object(entry)
            })
            .collect()
    }

    /// Entries for a `resources/list` result.
    pub fn resource_definitions(&self) -> Vec<Value> {
        self.resources
            .values()
            .map(|resource| {
                let mut entry = to_object(&resource.config);
                entry.insert("name".into(), json!(resource.name));
                Value::Object(entry)
            })
            .collect()
    }
}

fn check_name(kind: CapabilityKind, name: &str, taken: bool) -> Result<(), RegistrationError> {
    if name.trim().is_empty() {
        return Err(RegistrationError::EmptyName { kind });
    }
    if taken {
        return Err(RegistrationError::Duplicate {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

fn to_object<T: serde::Serialize>(config: &T) -> serde_json::Map<String, Value> {
    match serde_json::to_value(config) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}
