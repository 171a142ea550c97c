//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every transport and hosting failure mode.
///
/// Connect-time kinds (`ConnectTimeout`, `ConnectRefused`, spawn errors) are
/// surfaced to whoever requested the connection. Registration conflicts and
/// admission rejections are separate variants so callers can tell "pick a
/// different name/port" apart from "back off and retry".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Channel open did not complete within its timeout.
    ConnectTimeout(String),
    /// Channel open was actively refused or failed outright.
    ConnectRefused(String),
    /// Worker or channel executable could not be located.
    ExecutableNotFound(String),
    /// Worker or channel process failed to start.
    SpawnFailed(String),
    /// Server is at its connection limit.
    AdmissionRejected(String),
    /// A server with the same name is already registered.
    DuplicateName(String),
    /// A server of a compatible kind already listens on the address.
    DuplicateAddress(String),
    /// Close acknowledgement was not observed within the close timeout.
    CloseTimeout(String),
    /// Broken pipe, socket, or channel on an established session.
    Transport(String),
    /// Operation not valid in the current lifecycle state.
    InvalidState(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Control-plane IPC failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// `true` for failures that happened while opening a channel.
    #[must_use]
    pub fn is_connect_error(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_) | Self::ConnectRefused(_))
    }

    /// `true` for worker/channel process launch failures.
    #[must_use]
    pub fn is_spawn_error(&self) -> bool {
        matches!(self, Self::ExecutableNotFound(_) | Self::SpawnFailed(_))
    }

    /// `true` when a server start collided with an existing registration.
    #[must_use]
    pub fn is_registration_conflict(&self) -> bool {
        matches!(self, Self::DuplicateName(_) | Self::DuplicateAddress(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::ConnectTimeout(msg) => write!(f, "connect timeout: {msg}"),
            Self::ConnectRefused(msg) => write!(f, "connect refused: {msg}"),
            Self::ExecutableNotFound(msg) => write!(f, "executable not found: {msg}"),
            Self::SpawnFailed(msg) => write!(f, "spawn failed: {msg}"),
            Self::AdmissionRejected(msg) => write!(f, "admission rejected: {msg}"),
            Self::DuplicateName(msg) => write!(f, "duplicate name: {msg}"),
            Self::DuplicateAddress(msg) => write!(f, "duplicate address: {msg}"),
            Self::CloseTimeout(msg) => write!(f, "close timeout: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
