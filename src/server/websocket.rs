//! WebSocket listener on an axum router.
//!
//! One upgrade route at the configured path. Admission happens before the
//! upgrade completes: a server at its limit answers `503 Service
//! Unavailable` and the peer never gets a socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::{proxy, ServerInstance};
use crate::models::server::ServerAddress;
use crate::transport::channel::{ChannelKind, ChannelRead, ChannelWrite, OpenChannel};
use crate::{AppError, Result};

/// Upgrade path used when none is configured.
pub const DEFAULT_PATH: &str = "/";

/// Bind the TCP socket under the router.
///
/// # Errors
///
/// Same as [`super::tcp::bind`].
pub async fn bind(address: &ServerAddress) -> Result<TcpListener> {
    super::tcp::bind(address).await
}

/// Serve upgrades until the server is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the HTTP server fails.
pub async fn serve(server: Arc<ServerInstance>, listener: TcpListener) -> Result<()> {
    let path = match server.address() {
        ServerAddress::Socket {
            path: Some(path), ..
        } => path.clone(),
        _ => DEFAULT_PATH.to_owned(),
    };
    let cancel = server.cancel_token().clone();
    let app = router(&path, Arc::clone(&server));

    info!(local = ?listener.local_addr().ok(), %path, "websocket server accepting");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await
    .map_err(|err| AppError::Io(format!("websocket server error: {err}")))
}

fn router(path: &str, server: Arc<ServerInstance>) -> Router {
    Router::new()
        .route(path, get(upgrade))
        .with_state(server)
}

async fn upgrade(
    State(server): State<Arc<ServerInstance>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(permit) = server.connections().try_reserve() else {
        debug!(%peer, "connection limit reached, rejecting upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let channel = OpenChannel {
            kind: ChannelKind::WebSocket,
            remote: peer.to_string(),
            reader: Box::new(SocketReader { stream }),
            writer: Box::new(SocketWriter { sink, closed: false }),
            process: None,
        };
        proxy::run(server, channel, permit).await;
    })
}

struct SocketReader {
    stream: SplitStream<WebSocket>,
}

impl ChannelRead for SocketReader {
    fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Ok(Some(Bytes::copy_from_slice(text.as_str().as_bytes())))
                    }
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Err(err)) => {
                        return Err(AppError::Transport(format!("websocket read failed: {err}")))
                    }
                }
            }
        })
    }
}

struct SocketWriter {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

impl ChannelWrite for SocketWriter {
    fn write_chunk(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed {
                return Err(AppError::Transport("write after shutdown".into()));
            }
            let message = match String::from_utf8(chunk.to_vec()) {
                Ok(text) => Message::Text(text.into()),
                Err(_) => Message::Binary(chunk),
            };
            self.sink
                .send(message)
                .await
                .map_err(|err| AppError::Transport(format!("websocket write failed: {err}")))
        })
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if std::mem::replace(&mut self.closed, true) {
                return Ok(());
            }
            self.sink.close().await.ok();
            Ok(())
        })
    }
}
