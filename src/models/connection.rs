//! Live connection bookkeeping model.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, caller-visible identifier for one accepted connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Snapshot of one proxied connection owned by a server's registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectionDetails {
    /// Unique connection identifier.
    pub connection_id: ConnectionId,
    /// Best-effort peer address; a placeholder for pipe transports.
    pub remote_address: String,
    /// Time the connection was accepted.
    pub connected_at: DateTime<Utc>,
    /// Worker process id, set once the isolated worker is spawned.
    pub worker_process_id: Option<u32>,
}

impl ConnectionDetails {
    /// Construct details for a connection accepted right now.
    #[must_use]
    pub fn new(remote_address: impl Into<String>, worker_process_id: Option<u32>) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            remote_address: remote_address.into(),
            connected_at: Utc::now(),
            worker_process_id,
        }
    }

    /// Time elapsed since the connection was accepted.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.connected_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
