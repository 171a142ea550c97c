//! WebSocket client channel.
//!
//! Each inbound text or binary message becomes one chunk; records that span
//! several messages are reassembled above this layer. Each outbound record
//! is sent as one text message (binary if it is not valid UTF-8).

use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use super::channel::{ChannelKind, ChannelRead, ChannelWrite, OpenChannel};
use super::info::{bounded, WebSocketInfo};
use crate::{AppError, Result};

/// Connect and complete the upgrade handshake; `wss://` runs it over
/// rustls with the bundled web PKI roots.
///
/// # Errors
///
/// - `AppError::ConnectTimeout` if the handshake does not finish in time.
/// - `AppError::AdmissionRejected` if the server answers 503 (at its
///   connection limit).
/// - `AppError::ConnectRefused` if the connect, TLS or upgrade fails.
pub async fn open(info: &WebSocketInfo, timeout: Option<Duration>) -> Result<OpenChannel> {
    if info.uri.starts_with("wss:") {
        install_crypto_provider();
    }

    let (stream, response) = bounded(timeout, &format!("websocket {}", info.uri), async {
        tokio_tungstenite::connect_async(info.uri.as_str())
            .await
            .map_err(|err| map_connect_error(&info.uri, err))
    })
    .await?;

    debug!(uri = %info.uri, status = %response.status(), "websocket channel opened");

    let (sink, source) = stream.split();
    Ok(OpenChannel {
        kind: ChannelKind::WebSocket,
        remote: info.uri.clone(),
        reader: Box::new(MessageReader::new(source)),
        writer: Box::new(MessageWriter::new(sink)),
        process: None,
    })
}

fn map_connect_error(uri: &str, err: WsError) -> AppError {
    match err {
        WsError::Http(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
            AppError::AdmissionRejected(format!("websocket {uri}: server at connection limit"))
        }
        other => AppError::ConnectRefused(format!("websocket {uri}: {other}")),
    }
}

/// rustls needs a process-wide provider; the first caller installs ring.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// [`ChannelRead`] over a stream of WebSocket messages.
pub struct MessageReader<S> {
    inner: S,
}

impl<S> MessageReader<S> {
    /// Wrap a message stream.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> ChannelRead for MessageReader<S>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send,
{
    fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            loop {
                match self.inner.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => {}
                    Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                    Some(Err(err)) => {
                        return Err(AppError::Transport(format!("websocket read failed: {err}")))
                    }
                }
            }
        })
    }
}

/// [`ChannelWrite`] over a sink of WebSocket messages.
pub struct MessageWriter<S> {
    inner: S,
    closed: bool,
}

impl<S> MessageWriter<S> {
    /// Wrap a message sink.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

impl<S> ChannelWrite for MessageWriter<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    fn write_chunk(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed {
                return Err(AppError::Transport("write after shutdown".into()));
            }
            let message = match String::from_utf8(chunk.to_vec()) {
                Ok(text) => Message::Text(text.into()),
                Err(_) => Message::Binary(chunk),
            };
            self.inner
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
            match self.inner.close().await {
                Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
                Err(err) => Err(AppError::Transport(format!(
                    "websocket close failed: {err}"
                ))),
            }
        })
    }
}
