//! Global configuration parsing and validation.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::models::server::{ServerAddress, ServerKind};
use crate::server::{ServerSpec, WorkerCommand};
use crate::transport::info::{
    DEFAULT_PIPE_TIMEOUT, DEFAULT_SUBPROCESS_TIMEOUT, DEFAULT_TCP_TIMEOUT,
    DEFAULT_WEBSOCKET_TIMEOUT,
};
use crate::transport::manager::DEFAULT_CLOSE_TIMEOUT;
use crate::transport::{ChannelConnectionInfo, TransportOptions};
use crate::{AppError, Result};

fn default_ipc_name() -> String {
    "host-relay".into()
}

fn default_address() -> String {
    "127.0.0.1".into()
}

fn default_drain_timeout_seconds() -> u64 {
    10
}

fn default_subprocess_timeout_ms() -> u64 {
    duration_ms(DEFAULT_SUBPROCESS_TIMEOUT)
}

fn default_pipe_timeout_ms() -> u64 {
    duration_ms(DEFAULT_PIPE_TIMEOUT)
}

fn default_tcp_timeout_ms() -> u64 {
    duration_ms(DEFAULT_TCP_TIMEOUT)
}

fn default_websocket_timeout_ms() -> u64 {
    duration_ms(DEFAULT_WEBSOCKET_TIMEOUT)
}

fn default_close_timeout_ms() -> u64 {
    duration_ms(DEFAULT_CLOSE_TIMEOUT)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Client-side timeouts, in milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Subprocess open timeout.
    #[serde(default = "default_subprocess_timeout_ms")]
    pub subprocess_open_timeout_ms: u64,
    /// Named-pipe open timeout.
    #[serde(default = "default_pipe_timeout_ms")]
    pub named_pipe_open_timeout_ms: u64,
    /// TCP open timeout.
    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_open_timeout_ms: u64,
    /// WebSocket open timeout.
    #[serde(default = "default_websocket_timeout_ms")]
    pub websocket_open_timeout_ms: u64,
    /// SSH open timeout; 0 waits indefinitely.
    #[serde(default)]
    pub ssh_open_timeout_ms: u64,
    /// Close acknowledgement timeout.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            subprocess_open_timeout_ms: default_subprocess_timeout_ms(),
            named_pipe_open_timeout_ms: default_pipe_timeout_ms(),
            tcp_open_timeout_ms: default_tcp_timeout_ms(),
            websocket_open_timeout_ms: default_websocket_timeout_ms(),
            ssh_open_timeout_ms: 0,
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl ClientConfig {
    /// Open timeout for `info`'s medium; `None` waits indefinitely.
    #[must_use]
    pub fn open_timeout(&self, info: &ChannelConnectionInfo) -> Option<Duration> {
        let ms = match info {
            ChannelConnectionInfo::Subprocess(_) => self.subprocess_open_timeout_ms,
            ChannelConnectionInfo::NamedPipe(_) => self.named_pipe_open_timeout_ms,
            ChannelConnectionInfo::Tcp(_) => self.tcp_open_timeout_ms,
            ChannelConnectionInfo::WebSocket(_) => self.websocket_open_timeout_ms,
            ChannelConnectionInfo::Ssh(_) => self.ssh_open_timeout_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// Transport options for connecting to `info`.
    #[must_use]
    pub fn transport_options(&self, info: &ChannelConnectionInfo) -> TransportOptions {
        TransportOptions {
            open_timeout: self.open_timeout(info),
            close_timeout: Some(Duration::from_millis(self.close_timeout_ms)),
            ..TransportOptions::default()
        }
    }
}

/// One `[[servers]]` entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Unique name; generated when omitted.
    pub name: Option<String>,
    /// Listener kind.
    pub kind: ServerKind,
    /// Interface for TCP and WebSocket servers.
    #[serde(default = "default_address")]
    pub address: String,
    /// Port for TCP and WebSocket servers; 0 lets the OS choose.
    pub port: Option<u16>,
    /// WebSocket upgrade path.
    pub path: Option<String>,
    /// Pipe name for named-pipe servers.
    pub pipe_name: Option<String>,
    /// Connection limit; 0 means unlimited.
    #[serde(default)]
    pub max_connections: usize,
    /// Graceful drain window on stop.
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,
}

impl ServerConfig {
    /// Build the start parameters for this entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a kind-specific field is missing.
    pub fn to_spec(&self, worker: &WorkerCommand) -> Result<ServerSpec> {
        let label = self.name.as_deref().unwrap_or("<unnamed>");
        let address = match self.kind {
            ServerKind::Tcp | ServerKind::WebSocket => {
                let port = self.port.ok_or_else(|| {
                    AppError::Config(format!("server '{label}': {} requires a port", self.kind))
                })?;
                ServerAddress::Socket {
                    host: self.address.clone(),
                    port,
                    path: (self.kind == ServerKind::WebSocket).then(|| {
                        self.path
                            .clone()
                            .unwrap_or_else(|| crate::server::websocket::DEFAULT_PATH.to_owned())
                    }),
                }
            }
            ServerKind::NamedPipe => ServerAddress::Pipe {
                name: self.pipe_name.clone().ok_or_else(|| {
                    AppError::Config(format!("server '{label}': named_pipe requires pipe_name"))
                })?,
            },
        };
        let spec = ServerSpec {
            name: self.name.clone(),
            kind: self.kind,
            address,
            max_connections: self.max_connections,
            drain_timeout: Duration::from_secs(self.drain_timeout_seconds),
            worker: worker.clone(),
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Worker launched per accepted connection.
    pub worker: WorkerCommand,
    /// Client-side timeouts.
    #[serde(default)]
    pub client: ClientConfig,
    /// Control socket name for `host-relay-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Servers started at boot.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Start parameters for every configured server.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an entry is incomplete.
    pub fn server_specs(&self) -> Result<Vec<ServerSpec>> {
        self.servers
            .iter()
            .map(|server| server.to_spec(&self.worker))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.worker.executable.trim().is_empty() {
            return Err(AppError::Config("worker.executable must not be empty".into()));
        }
        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if let Some(name) = &server.name {
                if !names.insert(name.as_str()) {
                    return Err(AppError::Config(format!("duplicate server name '{name}'")));
                }
            }
            server.to_spec(&self.worker)?;
        }
        Ok(())
    }
}
