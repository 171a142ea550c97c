//! Hosted server model: kinds, lifecycle states, and listen addresses.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::connection::ConnectionDetails;
use crate::AppError;

/// Transport kind a server listens on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    /// Raw TCP socket carrying line-framed records.
    Tcp,
    /// HTTP upgrade to WebSocket, one text message per record.
    #[serde(rename = "websocket")]
    WebSocket,
    /// OS named pipe (Unix domain socket off Windows).
    NamedPipe,
}

impl ServerKind {
    /// Whether two kinds share an address namespace.
    ///
    /// TCP and WebSocket servers both bind TCP ports.
    #[must_use]
    pub fn shares_namespace_with(self, other: Self) -> bool {
        match (self, other) {
            (Self::NamedPipe, Self::NamedPipe) => true,
            (Self::NamedPipe, _) | (_, Self::NamedPipe) => false,
            _ => true,
        }
    }
}

impl Display for ServerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "websocket",
            Self::NamedPipe => "named_pipe",
        };
        f.write_str(label)
    }
}

impl FromStr for ServerKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "named_pipe" | "namedpipe" | "pipe" => Ok(Self::NamedPipe),
            other => Err(AppError::Config(format!("unknown server kind '{other}'"))),
        }
    }
}

/// Server lifecycle state.
///
/// `Stopped -> Starting -> Running -> Stopping -> {Stopped, Failed}`;
/// `Starting` and `Running` may move straight to `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Not listening.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Draining and releasing resources.
    Stopping,
    /// Unrecoverable listener error.
    Failed,
}

impl ServerState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Running | Self::Failed)
                | (Self::Running, Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Stopped | Self::Failed)
                | (Self::Failed, Self::Stopping | Self::Stopped)
        )
    }
}

/// Kind-specific listen address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ServerAddress {
    /// TCP or WebSocket socket address; `port == 0` lets the OS choose.
    Socket {
        /// Interface to bind (e.g. `127.0.0.1`).
        host: String,
        /// Port to bind.
        port: u16,
        /// WebSocket upgrade path; ignored for raw TCP.
        path: Option<String>,
    },
    /// Bare pipe name; the platform prefix is applied when binding.
    Pipe {
        /// Pipe name.
        name: String,
    },
}

impl ServerAddress {
    /// Address identity used for uniqueness checks.
    ///
    /// Returns `None` for OS-assigned ports, which never conflict.
    #[must_use]
    pub fn conflict_key(&self) -> Option<String> {
        match self {
            Self::Socket { port: 0, .. } => None,
            Self::Socket { host, port, .. } => Some(format!("{}:{port}", host.to_ascii_lowercase())),
            Self::Pipe { name } => Some(name.to_ascii_lowercase()),
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket { host, port, path } => {
                write!(f, "{host}:{port}{}", path.as_deref().unwrap_or_default())
            }
            Self::Pipe { name } => write!(f, "pipe:{name}"),
        }
    }
}

/// Serializable point-in-time view of a server, returned by list operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerSummary {
    /// Unique server name.
    pub name: String,
    /// Listener kind.
    pub kind: ServerKind,
    /// Current lifecycle state.
    pub state: ServerState,
    /// Configured address.
    pub address: ServerAddress,
    /// Bound local address once running (resolves port 0).
    pub local_address: Option<String>,
    /// Connection limit; 0 means unlimited.
    pub max_connections: usize,
    /// Graceful drain window on stop.
    pub drain_timeout_seconds: u64,
    /// Live connection count.
    pub connection_count: usize,
    /// Last recorded mid-session or fatal error.
    pub last_error: Option<String>,
    /// Time the listener started accepting.
    pub started_at: Option<DateTime<Utc>>,
    /// Live connections.
    pub connections: Vec<ConnectionDetails>,
}
