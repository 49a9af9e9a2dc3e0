//! Conduit: one set of MCP tools served over stdio and a reverse tunnel.

mod session;

use anyhow::{Context, Result};
use clap::Parser;
use conduit_config::{CliOverrides, ConduitConfig, TransportKind};
use conduit_server::{CompositeServerProxy, McpServerProxy, ServerProxy};
use conduit_transport::{StdioTransport, Transport, TunnelTransport};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "conduit",
    version,
    about = "Serve MCP tools over stdio and a reverse WebSocket tunnel"
)]
struct Cli {
    /// Project root reported to clients and the tunnel relay
    #[arg(long)]
    root: Option<PathBuf>,

    /// Dev server URL (overrides EXPO_DEV_SERVER_URL)
    #[arg(long)]
    dev_server_url: Option<String>,

    /// Tunnel relay WebSocket URL (overrides EXPO_MCP_SERVER_URL)
    #[arg(long)]
    mcp_server_url: Option<String>,

    /// Do not serve over stdin/stdout
    #[arg(long)]
    no_stdio: bool,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout may be the MCP channel.
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = ConduitConfig::load(CliOverrides {
        project_root: cli.root,
        dev_server_url: cli.dev_server_url,
        mcp_server_url: cli.mcp_server_url,
        no_stdio: cli.no_stdio,
    })
    .context("Failed to load configuration")?;

    let kinds = config
        .transports()
        .context("No usable transport configured")?;
    let proxy = build_proxy(&config, &kinds)?;

    session::register(proxy.as_ref(), session::SessionInfo::new(&config, &kinds))
        .context("Failed to register built-in capabilities")?;

    proxy
        .start()
        .await
        .with_context(|| format!("Failed to start {}", proxy.label()))?;
    tracing::info!(proxy = %proxy.label(), "Conduit is serving");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted, shutting down");
        }
        () = proxy.wait_closed() => {
            tracing::info!("All transports closed");
        }
    }

    proxy.close().await.context("Failed to shut down cleanly")?;
    Ok(())
}

/// One proxy per selected transport, composed when there is more than one.
fn build_proxy(config: &ConduitConfig, kinds: &[TransportKind]) -> Result<Box<dyn ServerProxy>> {
    let mut proxies: Vec<Box<dyn ServerProxy>> = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Stdio => Arc::new(StdioTransport::stdio()),
            TransportKind::Tunnel => {
                let tunnel = config
                    .tunnel_config()
                    .context("Tunnel selected without an MCP server URL")?;
                Arc::new(TunnelTransport::new(tunnel))
            }
        };
        proxies.push(Box::new(McpServerProxy::new(
            kind.to_string(),
            transport,
            config.dev_server_url.clone(),
        )));
    }

    if proxies.len() > 1 {
        let composite = CompositeServerProxy::new(proxies, config.dev_server_url.clone())?;
        return Ok(Box::new(composite));
    }
    proxies.pop().context("No transports selected")
}
