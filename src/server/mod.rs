//! Hosted listeners: one accept loop per server, one isolated worker per
//! connection.
//!
//! - [`registry`]: name and address uniqueness, start/stop/list.
//! - [`connections`]: live connections and admission permits.
//! - [`proxy`]: bridges one accepted channel to its worker.
//! - [`tcp`], [`websocket`], [`named_pipe`]: listeners per kind.

pub mod connections;
pub mod named_pipe;
pub mod proxy;
pub mod registry;
pub mod tcp;
pub mod websocket;
pub mod worker;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::connection::ConnectionDetails;
use crate::models::server::{ServerAddress, ServerKind, ServerState, ServerSummary};
use crate::{AppError, Result};

pub use connections::{AdmissionPermit, ConnectionRegistry};
pub use registry::ServerRegistry;
pub use worker::WorkerCommand;

/// Default graceful drain window.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between admission retries while a server is at its limit.
pub const ADMISSION_RETRY: Duration = Duration::from_millis(100);

/// Bound on joining the accept loop during stop.
const ACCEPT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on force-terminated proxies removing their entries.
const FORCE_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters for starting one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    /// Unique name; generated from the kind when `None`.
    pub name: Option<String>,
    /// Listener kind.
    pub kind: ServerKind,
    /// Listen address.
    pub address: ServerAddress,
    /// Connection limit; 0 means unlimited.
    pub max_connections: usize,
    /// Graceful drain window on stop.
    pub drain_timeout: Duration,
    /// Worker launched per connection.
    pub worker: WorkerCommand,
}

impl ServerSpec {
    /// Raw TCP server.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16, worker: WorkerCommand) -> Self {
        Self::new(
            ServerKind::Tcp,
            ServerAddress::Socket {
                host: host.into(),
                port,
                path: None,
            },
            worker,
        )
    }

    /// WebSocket server upgrading requests on `path`.
    #[must_use]
    pub fn websocket(
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        worker: WorkerCommand,
    ) -> Self {
        Self::new(
            ServerKind::WebSocket,
            ServerAddress::Socket {
                host: host.into(),
                port,
                path: Some(path.into()),
            },
            worker,
        )
    }

    /// Named pipe server.
    #[must_use]
    pub fn named_pipe(name: impl Into<String>, worker: WorkerCommand) -> Self {
        Self::new(
            ServerKind::NamedPipe,
            ServerAddress::Pipe { name: name.into() },
            worker,
        )
    }

    fn new(kind: ServerKind, address: ServerAddress, worker: WorkerCommand) -> Self {
        Self {
            name: None,
            kind,
            address,
            max_connections: 0,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            worker,
        }
    }

    /// Set the server name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the connection limit.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the drain window.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Check that the address matches the kind and the fields are usable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(AppError::Config("server name must not be empty".into()));
            }
        }
        if self.worker.executable.trim().is_empty() {
            return Err(AppError::Config("worker executable must not be empty".into()));
        }
        match (&self.kind, &self.address) {
            (ServerKind::Tcp | ServerKind::WebSocket, ServerAddress::Socket { host, path, .. }) => {
                if host.trim().is_empty() {
                    return Err(AppError::Config("listen host must not be empty".into()));
                }
                if let Some(path) = path {
                    if self.kind == ServerKind::WebSocket && !path.starts_with('/') {
                        return Err(AppError::Config(format!(
                            "websocket path '{path}' must start with '/'"
                        )));
                    }
                }
                Ok(())
            }
            (ServerKind::NamedPipe, ServerAddress::Pipe { name }) => {
                if name.trim().is_empty() || name.contains(['/', '\\']) {
                    return Err(AppError::Config(format!("invalid pipe name '{name}'")));
                }
                Ok(())
            }
            (kind, address) => Err(AppError::Config(format!(
                "address {address} does not fit a {kind} server"
            ))),
        }
    }
}

#[derive(Debug)]
struct Status {
    state: ServerState,
    last_error: Option<String>,
    local_address: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

/// One registered server: configuration, lifecycle state, live connections.
#[derive(Debug)]
pub struct ServerInstance {
    name: String,
    kind: ServerKind,
    address: ServerAddress,
    drain_timeout: Duration,
    worker: WorkerCommand,
    connections: ConnectionRegistry,
    cancel: CancellationToken,
    status: Mutex<Status>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInstance {
    fn new(name: String, spec: ServerSpec) -> Self {
        Self {
            name,
            kind: spec.kind,
            address: spec.address,
            drain_timeout: spec.drain_timeout,
            worker: spec.worker,
            connections: ConnectionRegistry::new(spec.max_connections),
            cancel: CancellationToken::new(),
            status: Mutex::new(Status {
                state: ServerState::Stopped,
                last_error: None,
                local_address: None,
                started_at: None,
            }),
            accept_task: Mutex::new(None),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listener kind.
    #[must_use]
    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    /// Configured address.
    #[must_use]
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Worker launched per connection.
    #[must_use]
    pub fn worker(&self) -> &WorkerCommand {
        &self.worker
    }

    /// Live connections.
    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Cancelled when the server stops accepting.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.status().state
    }

    /// Apply a lifecycle transition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the FSM does not allow it.
    pub fn transition(&self, next: ServerState) -> Result<()> {
        let mut status = self.status();
        if !status.state.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "server '{}' cannot move from {:?} to {next:?}",
                self.name, status.state
            )));
        }
        debug!(server = %self.name, from = ?status.state, to = ?next, "server state");
        status.state = next;
        if next == ServerState::Running {
            status.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a mid-session or fatal error.
    pub fn record_error(&self, err: &AppError) {
        self.status().last_error = Some(err.to_string());
    }

    /// Record a fatal error and move to `Failed` when the FSM allows it.
    pub fn fail(&self, err: &AppError) {
        let mut status = self.status();
        status.last_error = Some(err.to_string());
        if status.state.can_transition_to(ServerState::Failed) {
            status.state = ServerState::Failed;
        }
    }

    /// Last recorded error.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.status().last_error.clone()
    }

    /// Bound local address once running.
    #[must_use]
    pub fn local_address(&self) -> Option<String> {
        self.status().local_address.clone()
    }

    fn set_local_address(&self, address: String) {
        self.status().local_address = Some(address);
    }

    fn set_accept_task(&self, task: JoinHandle<()>) {
        *self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Point-in-time view.
    #[must_use]
    pub fn summary(&self) -> ServerSummary {
        let status = self.status();
        ServerSummary {
            name: self.name.clone(),
            kind: self.kind,
            state: status.state,
            address: self.address.clone(),
            local_address: status.local_address.clone(),
            max_connections: self.connections.max_connections(),
            drain_timeout_seconds: self.drain_timeout.as_secs(),
            connection_count: self.connections.count(),
            last_error: status.last_error.clone(),
            started_at: status.started_at,
            connections: self.connections.list(),
        }
    }

    /// Stop accepting, drain (unless `force`), terminate what is left and
    /// join the accept loop.
    ///
    /// Ends in `Stopped`, or `Failed` when the accept loop or a worker could
    /// not be shut down in time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the server is not running (or
    /// failed).
    pub async fn stop(&self, force: bool) -> Result<()> {
        self.transition(ServerState::Stopping)?;
        info!(
            server = %self.name,
            force,
            connections = self.connections.count(),
            "stopping server"
        );
        self.cancel.cancel();

        if !force && self.connections.occupied() > 0 {
            let drained = self.connections.wait_empty(self.drain_timeout).await;
            if !drained {
                info!(
                    server = %self.name,
                    remaining = self.connections.count(),
                    "drain timeout elapsed"
                );
            }
        }

        let mut failure = None;
        let remaining = self.connections.terminate_all();
        if remaining > 0 {
            info!(server = %self.name, remaining, "terminating remaining connections");
            if !self.connections.wait_empty(FORCE_TEARDOWN_TIMEOUT).await {
                failure = Some(AppError::InvalidState(format!(
                    "{} connections did not terminate",
                    self.connections.occupied()
                )));
            }
        }

        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            match tokio::time::timeout(ACCEPT_JOIN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failure = Some(AppError::InvalidState(format!("accept loop panicked: {err}")));
                }
                Err(_) => {
                    task.abort();
                    failure = Some(AppError::InvalidState(format!(
                        "accept loop did not stop within {ACCEPT_JOIN_TIMEOUT:?}"
                    )));
                }
            }
        }

        match failure {
            None => {
                self.transition(ServerState::Stopped)?;
                info!(server = %self.name, "server stopped");
            }
            Some(err) => {
                warn!(server = %self.name, %err, "server stop incomplete");
                self.fail(&err);
            }
        }
        Ok(())
    }
}

/// Caller-facing handle to a started server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    instance: Arc<ServerInstance>,
}

impl ServerHandle {
    pub(crate) fn new(instance: Arc<ServerInstance>) -> Self {
        Self { instance }
    }

    /// Unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.instance.name()
    }

    /// Listener kind.
    #[must_use]
    pub fn kind(&self) -> ServerKind {
        self.instance.kind()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.instance.state()
    }

    /// Live connection count.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.instance.connections().count()
    }

    /// Live connections.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionDetails> {
        self.instance.connections().list()
    }

    /// Bound local address (`host:port` or the pipe path).
    #[must_use]
    pub fn local_address(&self) -> Option<String> {
        self.instance.local_address()
    }

    /// Last recorded error.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.instance.last_error()
    }

    /// Point-in-time view.
    #[must_use]
    pub fn summary(&self) -> ServerSummary {
        self.instance.summary()
    }

    pub(crate) fn instance(&self) -> &Arc<ServerInstance> {
        &self.instance
    }
}
