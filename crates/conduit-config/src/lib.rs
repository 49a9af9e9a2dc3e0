//! Multi-tier TOML configuration for Conduit.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > global config file > defaults

use conduit_transport::{HandshakeInfo, ProtocolInfo, ReconnectPolicy, TunnelConfig};
use conduit_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PROJECT_ROOT: &str = "EXPO_PROJECT_ROOT";
pub const ENV_DEV_SERVER_URL: &str = "EXPO_DEV_SERVER_URL";
pub const ENV_MCP_SERVER_URL: &str = "EXPO_MCP_SERVER_URL";
pub const ENV_CONFIG_DIR: &str = "CONDUIT_CONFIG_DIR";

/// Protocol declared in the tunnel handshake.
pub const TUNNEL_PROTOCOL_NAME: &str = "mcp";
pub const TUNNEL_PROTOCOL_VERSION: &str = "2025-06-18";

/// A transport the bootstrap should bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Tunnel,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Tunnel => "tunnel",
        })
    }
}

/// Resolved configuration for a Conduit process.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    pub project_root: PathBuf,
    pub dev_server_url: Option<String>,
    pub mcp_server_url: Option<String>,
    pub stdio: bool,
    pub tunnel: TunnelSettings,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    pub dev_server_url: Option<String>,
    pub mcp_server_url: Option<String>,
    pub stdio: Option<bool>,
}

/// `[tunnel]` section. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub require_ack: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            handshake_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            require_ack: false,
            max_retries: policy.max_retries,
            initial_delay_ms: policy.initial_delay_ms,
            max_delay_ms: policy.max_delay_ms,
            backoff_factor: policy.backoff_factor,
        }
    }
}

impl TunnelSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(invalid("tunnel", "timeouts must be greater than zero"));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(invalid(
                "tunnel.backoff_factor",
                format!("must be at least 1.0, got {}", self.backoff_factor),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(invalid(
                "tunnel.max_delay_ms",
                "must not be smaller than initial_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            backoff_factor: self.backoff_factor,
        }
    }
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub project_root: Option<PathBuf>,
    pub dev_server_url: Option<String>,
    pub mcp_server_url: Option<String>,
    pub no_stdio: bool,
}

impl ConduitConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables (`EXPO_PROJECT_ROOT`, `EXPO_DEV_SERVER_URL`,
    ///    `EXPO_MCP_SERVER_URL`)
    /// 3. Global config (~/.conduit/config.toml)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let config_dir = config_dir();
        let settings = load_settings_file(&config_dir.join("config.toml"));
        Self::resolve(overrides, |key| std::env::var(key).ok(), settings, config_dir)
    }

    /// Resolve from explicit sources. `env` looks up one environment variable.
    pub fn resolve(
        overrides: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
        settings: SettingsFile,
        config_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        let project_root = overrides
            .project_root
            .or_else(|| env(ENV_PROJECT_ROOT).map(PathBuf::from))
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let dev_server_url = overrides
            .dev_server_url
            .or_else(|| env(ENV_DEV_SERVER_URL))
            .or(settings.server.dev_server_url)
            .filter(|url| !url.trim().is_empty());
        if let Some(url) = &dev_server_url {
            check_scheme("dev_server_url", url, &["http://", "https://"])?;
        }

        let mcp_server_url = overrides
            .mcp_server_url
            .or_else(|| env(ENV_MCP_SERVER_URL))
            .or(settings.server.mcp_server_url)
            .filter(|url| !url.trim().is_empty());
        if let Some(url) = &mcp_server_url {
            check_scheme("mcp_server_url", url, &["ws://", "wss://"])?;
        }

        let stdio = !overrides.no_stdio && settings.server.stdio.unwrap_or(true);

        settings.tunnel.validate()?;

        Ok(ConduitConfig {
            project_root,
            dev_server_url,
            mcp_server_url,
            stdio,
            tunnel: settings.tunnel,
            config_dir,
        })
    }

    /// Which transports to bring up, in start order.
    pub fn transports(&self) -> Result<Vec<TransportKind>, ConfigError> {
        let mut kinds = Vec::new();
        if self.stdio {
            kinds.push(TransportKind::Stdio);
        }
        if self.mcp_server_url.is_some() {
            if self.dev_server_url.is_none() {
                return Err(ConfigError::MissingKey {
                    key: format!(
                        "dev_server_url (required by the tunnel; \
                         set --dev-server-url or {ENV_DEV_SERVER_URL})"
                    ),
                });
            }
            kinds.push(TransportKind::Tunnel);
        }
        if kinds.is_empty() {
            return Err(invalid(
                "transports",
                format!(
                    "stdio is disabled and no MCP server URL is set \
                     (use --mcp-server-url or {ENV_MCP_SERVER_URL})"
                ),
            ));
        }
        Ok(kinds)
    }

    /// Tunnel settings for this session, if a tunnel is configured.
    pub fn tunnel_config(&self) -> Option<TunnelConfig> {
        let url = self.mcp_server_url.as_ref()?;
        let handshake = HandshakeInfo {
            project_root: self.project_root.display().to_string(),
            dev_server_url: self.dev_server_url.clone().unwrap_or_default(),
            protocol: Some(ProtocolInfo {
                name: TUNNEL_PROTOCOL_NAME.to_string(),
                version: TUNNEL_PROTOCOL_VERSION.to_string(),
            }),
        };
        let mut config = TunnelConfig::new(url.clone(), handshake);
        config.connect_timeout = Duration::from_millis(self.tunnel.connect_timeout_ms);
        config.handshake_timeout = Duration::from_millis(self.tunnel.handshake_timeout_ms);
        config.require_ack = self.tunnel.require_ack;
        config.reconnect = self.tunnel.reconnect_policy();
        Some(config)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn check_scheme(key: &str, url: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    if schemes.iter().any(|scheme| url.starts_with(scheme)) {
        return Ok(());
    }
    Err(invalid(
        key,
        format!("'{url}' must start with {}", schemes.join(" or ")),
    ))
}

/// Get the Conduit config directory path (~/.conduit/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conduit")
}

/// Read and parse a settings file. `Ok(None)` if it does not exist.
pub fn read_settings_file(path: &Path) -> Result<Option<SettingsFile>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            });
        }
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

/// Load a settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match read_settings_file(path) {
        Ok(settings) => settings.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("{e}");
            SettingsFile::default()
        }
    }
}
