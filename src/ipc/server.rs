//! Local IPC server for `host-relay-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands and
//! routes them to the server registry.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "list", "kind": "websocket"}
//! {"command": "connections", "name": "relay-ws"}
//! {"command": "stop", "name": "relay-ws", "force": true}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: no server named 'x'"}
//! ```

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::server::ServerKind;
use crate::server::ServerRegistry;
use crate::{AppError, Result};

/// Inbound IPC request from `host-relay-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Server name (for `stop`, `connections`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Kind filter (for `list`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Skip the drain window (for `stop`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

/// Outbound IPC response to `host-relay-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl From<AppError> for IpcResponse {
    fn from(err: AppError) -> Self {
        Self::error(err.to_string())
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: &str,
    registry: ServerRegistry,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, registry.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    registry: ServerRegistry,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = handle_line(trimmed, &registry).await;
                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Parse one request line and execute it.
pub async fn handle_line(line: &str, registry: &ServerRegistry) -> IpcResponse {
    match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => dispatch_command(&request, registry).await,
        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
    }
}

/// Route an IPC command to the appropriate handler.
pub async fn dispatch_command(request: &IpcRequest, registry: &ServerRegistry) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        match request.command.as_str() {
            "list" => handle_list(request, registry),
            "connections" => handle_connections(request, registry),
            "stop" => handle_stop(request, registry).await,
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

fn handle_list(request: &IpcRequest, registry: &ServerRegistry) -> IpcResponse {
    let kind = match request.kind.as_deref().map(str::parse::<ServerKind>).transpose() {
        Ok(kind) => kind,
        Err(err) => return err.into(),
    };
    let servers = registry.list(kind);
    match serde_json::to_value(&servers) {
        Ok(items) => IpcResponse::success(serde_json::json!({ "servers": items })),
        Err(err) => IpcResponse::error(format!("failed to serialize servers: {err}")),
    }
}

fn handle_connections(request: &IpcRequest, registry: &ServerRegistry) -> IpcResponse {
    let Some(ref name) = request.name else {
        return IpcResponse::error("missing required 'name' field");
    };
    let Some(handle) = registry.get(name) else {
        return AppError::NotFound(format!("no server named '{name}'")).into();
    };
    match serde_json::to_value(handle.connections()) {
        Ok(items) => IpcResponse::success(serde_json::json!({
            "server": name,
            "connections": items,
        })),
        Err(err) => IpcResponse::error(format!("failed to serialize connections: {err}")),
    }
}

async fn handle_stop(request: &IpcRequest, registry: &ServerRegistry) -> IpcResponse {
    let Some(ref name) = request.name else {
        return IpcResponse::error("missing required 'name' field");
    };
    let force = request.force.unwrap_or(false);
    match registry.stop(name, force).await {
        Ok(summary) => {
            info!(server = %name, force, state = ?summary.state, "server stopped via IPC");
            match serde_json::to_value(&summary) {
                Ok(data) => IpcResponse::success(data),
                Err(err) => IpcResponse::error(format!("failed to serialize summary: {err}")),
            }
        }
        Err(err) => err.into(),
    }
}
