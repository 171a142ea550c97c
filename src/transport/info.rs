//! Client-side connection targets.
//!
//! [`ChannelConnectionInfo`] is a tagged union with one variant per medium.
//! Constructors validate their inputs, so [`ChannelConnectionInfo::open`]
//! only has to dispatch. Info values are plain data: cloning one never
//! shares transport state, and every `open` produces an independent channel.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::http::Uri;

use super::channel::{ChannelKind, OpenChannel};
use super::pipe_name::{discovery_pipe_name, HostProcess, PlatformFamily};
use super::ssh::DiagnosticsCallback;
use super::{named_pipe, ssh, subprocess, tcp, websocket};
use crate::{AppError, Result};

/// Default open timeout for subprocess channels.
pub const DEFAULT_SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);
/// Default open timeout for named-pipe channels.
pub const DEFAULT_PIPE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default open timeout for TCP channels.
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default open timeout for WebSocket channels.
pub const DEFAULT_WEBSOCKET_TIMEOUT: Duration = Duration::from_secs(10);
/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default remote subsystem for SSH channels.
pub const DEFAULT_SSH_SUBSYSTEM: &str = "powershell";

/// Local child process target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubprocessInfo {
    /// Executable path or bare name resolved on `PATH`.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
}

/// Named pipe target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamedPipeInfo {
    /// Bare pipe name.
    pub pipe_name: String,
}

/// TCP target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpInfo {
    /// Host name or address.
    pub host: String,
    /// Port, 1–65535.
    pub port: u16,
}

/// WebSocket target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebSocketInfo {
    /// `ws://` or `wss://` URI.
    pub uri: String,
}

/// SSH credential.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SshCredential {
    /// Whatever the ssh client finds on its own (agent, default keys).
    Default,
    /// Private key file.
    KeyFile(PathBuf),
    /// Password, supplied to the client through `sshpass`.
    Password(String),
}

impl std::fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// SSH-exec target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshInfo {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Login user; `None` lets the ssh client decide.
    pub user: Option<String>,
    /// Credential.
    pub credential: SshCredential,
    /// Subsystem to execute; `None` opens the remote default shell.
    pub subsystem: Option<String>,
    /// Extra `-o key=value` client options.
    pub options: BTreeMap<String, String>,
}

/// One connection target, tagged by medium.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChannelConnectionInfo {
    /// Local child process stdio.
    Subprocess(SubprocessInfo),
    /// Named pipe.
    NamedPipe(NamedPipeInfo),
    /// TCP socket.
    Tcp(TcpInfo),
    /// WebSocket.
    #[serde(rename = "websocket")]
    WebSocket(WebSocketInfo),
    /// SSH subsystem.
    Ssh(SshInfo),
}

impl ChannelConnectionInfo {
    /// Subprocess target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `program` is empty.
    pub fn subprocess<I, S>(program: impl Into<String>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(AppError::Config("subprocess program must not be empty".into()));
        }
        Ok(Self::Subprocess(SubprocessInfo {
            program,
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            working_dir: None,
        }))
    }

    /// Named pipe target by bare name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the name is empty or contains a path
    /// separator.
    pub fn named_pipe(pipe_name: impl Into<String>) -> Result<Self> {
        let pipe_name = pipe_name.into();
        validate_pipe_name(&pipe_name)?;
        Ok(Self::NamedPipe(NamedPipeInfo { pipe_name }))
    }

    /// Named pipe of a running host process, derived from its identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the derived name is invalid.
    pub fn attach_to_process(process: &HostProcess) -> Result<Self> {
        Self::named_pipe(discovery_pipe_name(process, PlatformFamily::current()))
    }

    /// TCP target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the host is empty or the port is 0.
    pub fn tcp(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(AppError::Config("tcp host must not be empty".into()));
        }
        if port == 0 {
            return Err(AppError::Config("tcp port must be in 1-65535".into()));
        }
        Ok(Self::Tcp(TcpInfo { host, port }))
    }

    /// WebSocket target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the URI does not parse, has no host, or
    /// its scheme is not `ws`/`wss`.
    pub fn websocket(uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();
        validate_websocket_uri(&uri)?;
        Ok(Self::WebSocket(WebSocketInfo { uri }))
    }

    /// SSH target with default port, credential and subsystem.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the host is empty.
    pub fn ssh(host: impl Into<String>) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(AppError::Config("ssh host must not be empty".into()));
        }
        Ok(Self::Ssh(SshInfo {
            host,
            port: DEFAULT_SSH_PORT,
            user: None,
            credential: SshCredential::Default,
            subsystem: Some(DEFAULT_SSH_SUBSYSTEM.to_owned()),
            options: BTreeMap::new(),
        }))
    }

    /// Medium of this target.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Subprocess(_) => ChannelKind::Subprocess,
            Self::NamedPipe(_) => ChannelKind::NamedPipe,
            Self::Tcp(_) => ChannelKind::Tcp,
            Self::WebSocket(_) => ChannelKind::WebSocket,
            Self::Ssh(_) => ChannelKind::Ssh,
        }
    }

    /// Default open timeout; `None` waits indefinitely.
    #[must_use]
    pub fn default_open_timeout(&self) -> Option<Duration> {
        match self {
            Self::Subprocess(_) => Some(DEFAULT_SUBPROCESS_TIMEOUT),
            Self::NamedPipe(_) => Some(DEFAULT_PIPE_TIMEOUT),
            Self::Tcp(_) => Some(DEFAULT_TCP_TIMEOUT),
            Self::WebSocket(_) => Some(DEFAULT_WEBSOCKET_TIMEOUT),
            Self::Ssh(_) => None,
        }
    }

    /// Re-check invariants on values built field by field or deserialized.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Subprocess(info) if info.program.trim().is_empty() => {
                Err(AppError::Config("subprocess program must not be empty".into()))
            }
            Self::NamedPipe(info) => validate_pipe_name(&info.pipe_name),
            Self::Tcp(info) if info.host.trim().is_empty() || info.port == 0 => Err(
                AppError::Config(format!("invalid tcp target {}:{}", info.host, info.port)),
            ),
            Self::WebSocket(info) => validate_websocket_uri(&info.uri),
            Self::Ssh(info) if info.host.trim().is_empty() || info.port == 0 => Err(
                AppError::Config(format!("invalid ssh target {}:{}", info.host, info.port)),
            ),
            _ => Ok(()),
        }
    }

    /// Open the channel, bounded by `timeout` (or the medium's default when
    /// `None` is passed and the medium has one).
    ///
    /// # Errors
    ///
    /// - `AppError::Config` if the target fails validation.
    /// - `AppError::ConnectTimeout` if the open does not finish in time.
    /// - `AppError::ConnectRefused` / spawn errors from the medium.
    pub async fn open(&self, timeout: Option<Duration>) -> Result<OpenChannel> {
        self.open_with(timeout, None).await
    }

    /// [`Self::open`] with a callback receiving SSH client stderr lines.
    /// Ignored by the other media.
    ///
    /// # Errors
    ///
    /// Same as [`Self::open`].
    pub async fn open_with(
        &self,
        timeout: Option<Duration>,
        diagnostics: Option<DiagnosticsCallback>,
    ) -> Result<OpenChannel> {
        self.validate()?;
        let timeout = timeout.or_else(|| self.default_open_timeout());
        match self {
            Self::Subprocess(info) => subprocess::open(info, timeout).await,
            Self::NamedPipe(info) => named_pipe::open(info, timeout).await,
            Self::Tcp(info) => tcp::open(info, timeout).await,
            Self::WebSocket(info) => websocket::open(info, timeout).await,
            Self::Ssh(info) => ssh::open(info, timeout, diagnostics).await,
        }
    }
}

/// Run an open step under an optional timeout.
///
/// The inner future is dropped on expiry, which cancels the pending connect
/// and releases any half-open OS handle.
pub(crate) async fn bounded<T, F>(timeout: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            AppError::ConnectTimeout(format!("{what} did not open within {limit:?}"))
        })?,
    }
}

fn validate_pipe_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AppError::Config("pipe name must not be empty".into()));
    }
    if name.contains(['/', '\\']) {
        return Err(AppError::Config(format!(
            "pipe name '{name}' must not contain path separators"
        )));
    }
    Ok(())
}

fn validate_websocket_uri(uri: &str) -> Result<()> {
    let parsed: Uri = uri
        .parse()
        .map_err(|err| AppError::Config(format!("invalid websocket uri '{uri}': {err}")))?;
    match parsed.scheme_str() {
        Some("ws" | "wss") => {}
        other => {
            return Err(AppError::Config(format!(
                "websocket uri scheme must be ws or wss, got {}",
                other.unwrap_or("none")
            )))
        }
    }
    if parsed.host().is_none_or(str::is_empty) {
        return Err(AppError::Config(format!("websocket uri '{uri}' has no host")));
    }
    Ok(())
}
