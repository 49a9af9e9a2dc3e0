//! Server proxies: one registration surface in front of one transport.

use crate::jsonrpc::JsonRpcNotification;
use crate::server::McpServer;
use conduit_transport::{Transport, TransportEvent};
use conduit_types::{
    BoxFuture, ConduitError, LifecycleError, PromptConfig, ResourceConfig, SharedPromptHandler,
    SharedResourceHandler, SharedToolHandler, ToolConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// How long in-flight requests may keep running once the transport is gone.
/// Shorter than `CLOSE_GRACE` so the serve loop aborts them itself.
const REQUEST_GRACE: Duration = Duration::from_secs(1);

/// Capability registration and lifecycle shared by single and composite proxies.
///
/// Registration is synchronous and fails fast. Dyn-compatible so a composite
/// can hold a heterogeneous list of members.
pub trait ServerProxy: Send + Sync {
    /// Short name used in logs and in start-failure errors.
    fn label(&self) -> &str;

    fn register_tool(
        &self,
        name: &str,
        config: ToolConfig,
        handler: SharedToolHandler,
    ) -> Result<(), ConduitError>;

    fn register_prompt(
        &self,
        name: &str,
        config: PromptConfig,
        handler: SharedPromptHandler,
    ) -> Result<(), ConduitError>;

    fn register_resource(
        &self,
        name: &str,
        config: ResourceConfig,
        handler: SharedResourceHandler,
    ) -> Result<(), ConduitError>;

    /// Start serving. A second call fails.
    fn start(&self) -> BoxFuture<'_, Result<(), ConduitError>>;

    /// Stop serving and release the transport. Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<(), ConduitError>>;

    /// Resolves once the proxy has stopped serving, whether through `close`
    /// or because its transport went away.
    fn wait_closed(&self) -> BoxFuture<'_, ()>;

    /// URL of the development server this session belongs to, if known.
    fn dev_server_url(&self) -> Option<&str>;
}

/// A proxy binding one [`Transport`] to one [`McpServer`].
pub struct McpServerProxy {
    label: String,
    server: Arc<McpServer>,
    transport: Arc<dyn Transport>,
    dev_server_url: Option<String>,
    task: Mutex<Option<JoinHandle<()>>>,
    done: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl McpServerProxy {
    pub fn new(
        label: impl Into<String>,
        transport: Arc<dyn Transport>,
        dev_server_url: Option<String>,
    ) -> Self {
        let server = McpServer::new("conduit", env!("CARGO_PKG_VERSION"));
        Self::with_server(label, transport, Arc::new(server), dev_server_url)
    }

    pub fn with_server(
        label: impl Into<String>,
        transport: Arc<dyn Transport>,
        server: Arc<McpServer>,
        dev_server_url: Option<String>,
    ) -> Self {
        Self {
            label: label.into(),
            server,
            transport,
            dev_server_url,
            task: Mutex::new(None),
            done: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &Arc<McpServer> {
        &self.server
    }

    pub fn transport_kind(&self) -> &str {
        self.transport.kind()
    }

    fn ensure_open(&self) -> Result<(), ConduitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LifecycleError::Closed(self.label.clone()).into());
        }
        Ok(())
    }

    /// Tell a connected client that a capability list changed.
    fn announce(&self, method: &'static str) {
        if !self.started.load(Ordering::SeqCst) || self.done.is_cancelled() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let message = match serde_json::to_value(JsonRpcNotification::new(method, None)) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(proxy = %self.label, "Failed to encode {method}: {e}");
                return;
            }
        };
        let transport = Arc::clone(&self.transport);
        let label = self.label.clone();
        runtime.spawn(async move {
            if let Err(e) = transport.send(&message).await {
                tracing::debug!(proxy = %label, "Failed to send {method}: {e}");
            }
        });
    }

    async fn start_inner(&self) -> Result<(), ConduitError> {
        self.ensure_open()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyStarted(self.label.clone()).into());
        }

        let events = match self.transport.start().await {
            Ok(events) => events,
            Err(e) => {
                // Nothing will ever serve; let waiters go.
                self.done.cancel();
                return Err(e.into());
            }
        };
        let handle = tokio::spawn(serve(
            self.label.clone(),
            Arc::clone(&self.server),
            Arc::clone(&self.transport),
            events,
            self.done.clone(),
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(proxy = %self.label, transport = self.transport.kind(), "Proxy started");
        Ok(())
    }

    async fn close_inner(&self) -> Result<(), ConduitError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.transport.close().await;

        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.done.cancel();

        tracing::info!(proxy = %self.label, "Proxy closed");
        result.map_err(ConduitError::from)
    }
}

impl ServerProxy for McpServerProxy {
    fn label(&self) -> &str {
        &self.label
    }

    fn register_tool(
        &self,
        name: &str,
        config: ToolConfig,
        handler: SharedToolHandler,
    ) -> Result<(), ConduitError> {
        self.ensure_open()?;
        self.server.register_tool(name, config, handler)?;
        self.announce("notifications/tools/list_changed");
        Ok(())
    }

    fn register_prompt(
        &self,
        name: &str,
        config: PromptConfig,
        handler: SharedPromptHandler,
    ) -> Result<(), ConduitError> {
        self.ensure_open()?;
        self.server.register_prompt(name, config, handler)?;
        self.announce("notifications/prompts/list_changed");
        Ok(())
    }

    fn register_resource(
        &self,
        name: &str,
        config: ResourceConfig,
        handler: SharedResourceHandler,
    ) -> Result<(), ConduitError> {
        self.ensure_open()?;
        self.server.register_resource(name, config, handler)?;
        self.announce("notifications/resources/list_changed");
        Ok(())
    }

    fn start(&self) -> BoxFuture<'_, Result<(), ConduitError>> {
        Box::pin(self.start_inner())
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ConduitError>> {
        Box::pin(self.close_inner())
    }

    fn wait_closed(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.done.cancelled())
    }

    fn dev_server_url(&self) -> Option<&str> {
        self.dev_server_url.as_deref()
    }
}

/// Drain transport events, answering each request on its own task.
///
/// Request tasks live in a `JoinSet` owned by this loop. When the transport
/// closes they get `REQUEST_GRACE` to finish and are then aborted.
async fn serve(
    label: String,
    server: Arc<McpServer>,
    transport: Arc<dyn Transport>,
    mut events: mpsc::Receiver<TransportEvent>,
    done: CancellationToken,
) {
    let mut requests = JoinSet::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Message(message)) => {
                    let server = Arc::clone(&server);
                    let transport = Arc::clone(&transport);
                    let label = label.clone();
                    requests.spawn(async move {
                        let Some(response) = server.handle(message).await else {
                            return;
                        };
                        if let Err(e) = transport.send(&response).await {
                            tracing::warn!(proxy = %label, "Failed to send response: {e}");
                        }
                    });
                }
                Some(TransportEvent::Error(e)) => {
                    tracing::warn!(proxy = %label, "Transport error: {e}");
                }
                Some(TransportEvent::Closed) | None => {
                    tracing::info!(proxy = %label, "Transport closed");
                    break;
                }
            },
            Some(finished) = requests.join_next(), if !requests.is_empty() => {
                match finished {
                    Err(e) if e.is_panic() => {
                        tracing::warn!(proxy = %label, "Request handler panicked: {e}");
                    }
                    _ => {}
                }
            }
        }
    }

    let drain = async { while requests.join_next().await.is_some() {} };
    if tokio::time::timeout(REQUEST_GRACE, drain).await.is_err() {
        tracing::debug!(
            proxy = %label,
            pending = requests.len(),
            "Aborting unfinished requests"
        );
        requests.abort_all();
        while requests.join_next().await.is_some() {}
    }
    done.cancel();
}
