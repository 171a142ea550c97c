//! Registry of running servers.
//!
//! Names are unique across the registry; addresses are unique among servers
//! whose kinds share a namespace (TCP and WebSocket both bind TCP ports).
//! Both checks and the insert happen under one lock, so two concurrent
//! starts cannot both claim the same name or address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::{named_pipe, tcp, websocket, ServerHandle, ServerInstance, ServerSpec};
use crate::models::server::{ServerKind, ServerState, ServerSummary};
use crate::{AppError, Result};

/// Injected registry of live servers. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Arc<Mutex<HashMap<String, Arc<ServerInstance>>>>,
}

impl ServerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<String, Arc<ServerInstance>>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register, bind and start accepting.
    ///
    /// A bind failure unregisters the server again and returns the error.
    ///
    /// # Errors
    ///
    /// - `AppError::Config` if `spec` fails validation.
    /// - `AppError::DuplicateName` / `AppError::DuplicateAddress` on
    ///   registration conflicts.
    /// - Bind errors from the listener.
    pub async fn start(&self, spec: ServerSpec) -> Result<ServerHandle> {
        spec.validate()?;
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| generated_name(spec.kind));
        let instance = Arc::new(ServerInstance::new(name.clone(), spec));
        self.register(&instance)?;
        instance.transition(ServerState::Starting)?;

        let span = info_span!("server", server = %name, kind = %instance.kind());
        let bound = match bind(&instance).instrument(span.clone()).await {
            Ok(bound) => bound,
            Err(err) => {
                error!(server = %name, %err, "server failed to bind");
                instance.fail(&err);
                self.unregister(&instance);
                return Err(err);
            }
        };

        instance.set_local_address(bound.local_address());
        instance.transition(ServerState::Running)?;
        info!(
            server = %name,
            kind = %instance.kind(),
            local = ?instance.local_address(),
            "server running"
        );

        let accept = Arc::clone(&instance);
        let task = tokio::spawn(
            async move {
                if let Err(err) = bound.serve(Arc::clone(&accept)).await {
                    error!(%err, "accept loop failed");
                    accept.fail(&err);
                }
            }
            .instrument(span),
        );
        instance.set_accept_task(task);

        Ok(ServerHandle::new(instance))
    }

    fn register(&self, instance: &Arc<ServerInstance>) -> Result<()> {
        let mut servers = self.servers();
        if servers.contains_key(instance.name()) {
            return Err(AppError::DuplicateName(format!(
                "a server named '{}' already exists",
                instance.name()
            )));
        }
        if let Some(key) = instance.address().conflict_key() {
            let clash = servers.values().find(|other| {
                other.kind().shares_namespace_with(instance.kind())
                    && other.address().conflict_key().as_deref() == Some(key.as_str())
            });
            if let Some(other) = clash {
                return Err(AppError::DuplicateAddress(format!(
                    "{} is already used by server '{}'",
                    instance.address(),
                    other.name()
                )));
            }
        }
        servers.insert(instance.name().to_owned(), Arc::clone(instance));
        Ok(())
    }

    fn unregister(&self, instance: &Arc<ServerInstance>) {
        let mut servers = self.servers();
        if servers
            .get(instance.name())
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            servers.remove(instance.name());
        }
    }

    /// Stop a server and remove it from the registry.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if no server has that name.
    /// - `AppError::InvalidState` if it is already stopping.
    pub async fn stop(&self, name: &str, force: bool) -> Result<ServerSummary> {
        let instance = self
            .servers()
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no server named '{name}'")))?;
        Self::stop_instance(&instance, force).await?;
        self.unregister(&instance);
        Ok(instance.summary())
    }

    /// Stop a server by handle.
    ///
    /// # Errors
    ///
    /// Same as [`Self::stop`].
    pub async fn stop_handle(&self, handle: &ServerHandle, force: bool) -> Result<ServerSummary> {
        let instance = handle.instance();
        Self::stop_instance(instance, force).await?;
        self.unregister(instance);
        Ok(instance.summary())
    }

    async fn stop_instance(instance: &ServerInstance, force: bool) -> Result<()> {
        instance
            .stop(force)
            .instrument(info_span!("server_stop", server = %instance.name()))
            .await
    }

    /// Stop every registered server concurrently.
    pub async fn stop_all(&self, force: bool) -> Vec<ServerSummary> {
        let instances: Vec<Arc<ServerInstance>> = self.servers().values().cloned().collect();
        let stops = instances.iter().map(|instance| async move {
            if let Err(err) = Self::stop_instance(instance, force).await {
                error!(server = %instance.name(), %err, "server stop failed");
            }
            self.unregister(instance);
            instance.summary()
        });
        join_all(stops).await
    }

    /// Handle for a named server.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ServerHandle> {
        self.servers().get(name).cloned().map(ServerHandle::new)
    }

    /// Summaries of all servers, optionally of one kind, sorted by name.
    #[must_use]
    pub fn list(&self, kind: Option<ServerKind>) -> Vec<ServerSummary> {
        let mut summaries: Vec<ServerSummary> = self
            .servers()
            .values()
            .filter(|instance| kind.is_none_or(|kind| instance.kind() == kind))
            .map(|instance| instance.summary())
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Number of registered servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers().len()
    }

    /// Whether no server is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers().is_empty()
    }
}

fn generated_name(kind: ServerKind) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{kind}-{}", &id[..8])
}

/// A bound listener of any kind.
enum BoundListener {
    Tcp(tokio::net::TcpListener),
    WebSocket(tokio::net::TcpListener),
    NamedPipe(interprocess::local_socket::tokio::Listener, String),
}

impl BoundListener {
    fn local_address(&self) -> String {
        match self {
            Self::Tcp(listener) | Self::WebSocket(listener) => listener
                .local_addr()
                .map_or_else(|_| "unknown".to_owned(), |addr| addr.to_string()),
            Self::NamedPipe(_, path) => path.clone(),
        }
    }

    async fn serve(self, instance: Arc<ServerInstance>) -> Result<()> {
        match self {
            Self::Tcp(listener) => tcp::serve(instance, listener).await,
            Self::WebSocket(listener) => websocket::serve(instance, listener).await,
            Self::NamedPipe(listener, _) => named_pipe::serve(instance, listener).await,
        }
    }
}

async fn bind(instance: &ServerInstance) -> Result<BoundListener> {
    match instance.kind() {
        ServerKind::Tcp => tcp::bind(instance.address()).await.map(BoundListener::Tcp),
        ServerKind::WebSocket => websocket::bind(instance.address())
            .await
            .map(BoundListener::WebSocket),
        ServerKind::NamedPipe => named_pipe::bind(instance.address())
            .await
            .map(|(listener, path)| BoundListener::NamedPipe(listener, path)),
    }
}
