//! Composite proxy: one registration surface fanned out to several proxies.

use crate::proxy::ServerProxy;
use conduit_types::{
    BoxFuture, ConduitError, ConfigError, PromptConfig, ResourceConfig, SharedPromptHandler,
    SharedResourceHandler, SharedToolHandler, ToolConfig,
};
use futures_util::future::{join_all, try_join_all};
use std::sync::Arc;

/// Runs two or more proxies behind the [`ServerProxy`] contract.
///
/// Every registration is replicated to each member, in member order, before
/// returning. The first member error aborts the call; members that already
/// accepted the registration keep it.
pub struct CompositeServerProxy {
    label: String,
    proxies: Vec<Box<dyn ServerProxy>>,
    dev_server_url: Option<String>,
}

impl CompositeServerProxy {
    /// Wrap `proxies`. Needs at least two members; a single proxy should be
    /// used directly.
    pub fn new(
        proxies: Vec<Box<dyn ServerProxy>>,
        dev_server_url: Option<String>,
    ) -> Result<Self, ConduitError> {
        if proxies.len() < 2 {
            return Err(ConfigError::InvalidValue {
                key: "proxies".to_string(),
                message: format!(
                    "a composite proxy needs at least two members, got {}",
                    proxies.len()
                ),
            }
            .into());
        }

        let labels: Vec<&str> = proxies.iter().map(|p| p.label()).collect();
        let label = format!("composite({})", labels.join(", "));
        Ok(Self {
            label,
            proxies,
            dev_server_url,
        })
    }
}

impl ServerProxy for CompositeServerProxy {
    fn label(&self) -> &str {
        &self.label
    }

    fn register_tool(
        &self,
        name: &str,
        config: ToolConfig,
        handler: SharedToolHandler,
    ) -> Result<(), ConduitError> {
        for proxy in &self.proxies {
            proxy.register_tool(name, config.clone(), Arc::clone(&handler))?;
        }
        Ok(())
    }

    fn register_prompt(
        &self,
        name: &str,
        config: PromptConfig,
        handler: SharedPromptHandler,
    ) -> Result<(), ConduitError> {
        for proxy in &self.proxies {
            proxy.register_prompt(name, config.clone(), Arc::clone(&handler))?;
        }
        Ok(())
    }

    fn register_resource(
        &self,
        name: &str,
        config: ResourceConfig,
        handler: SharedResourceHandler,
    ) -> Result<(), ConduitError> {
        for proxy in &self.proxies {
            proxy.register_resource(name, config.clone(), Arc::clone(&handler))?;
        }
        Ok(())
    }

    /// Start every member concurrently. Fails as soon as one member fails;
    /// members that already started are left running.
    fn start(&self) -> BoxFuture<'_, Result<(), ConduitError>> {
        Box::pin(async move {
            try_join_all(self.proxies.iter().map(|proxy| async move {
                proxy
                    .start()
                    .await
                    .map_err(|e| ConduitError::ProxyStart {
                        proxy: proxy.label().to_string(),
                        source: Box::new(e),
                    })
            }))
            .await?;
            tracing::info!(proxy = %self.label, "All proxies started");
            Ok(())
        })
    }

    /// Close every member concurrently. Individual failures are logged and do
    /// not stop the others from closing.
    fn close(&self) -> BoxFuture<'_, Result<(), ConduitError>> {
        Box::pin(async move {
            let results = join_all(self.proxies.iter().map(|proxy| proxy.close())).await;
            for (proxy, result) in self.proxies.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(proxy = proxy.label(), "Failed to close: {e}");
                }
            }
            Ok(())
        })
    }

    /// Resolves once every member has stopped.
    fn wait_closed(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            join_all(self.proxies.iter().map(|proxy| proxy.wait_closed())).await;
        })
    }

    fn dev_server_url(&self) -> Option<&str> {
        self.dev_server_url
            .as_deref()
            .or_else(|| self.proxies.first().and_then(|p| p.dev_server_url()))
    }
}
