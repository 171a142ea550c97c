//! Medium-agnostic channel halves.
//!
//! Every medium is opened into an [`OpenChannel`]: a read half yielding raw
//! byte chunks, a write half accepting framed records, and optionally the
//! process that backs the channel. Record framing lives above this layer
//! (see [`super::codec`]), so chunk boundaries carry no meaning here.

use std::fmt::{Display, Formatter};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::process::{terminate_child, TERMINATE_GRACE};
use crate::{AppError, Result};

/// Read buffer size for byte-stream media.
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Physical medium behind a channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Local child process stdio.
    Subprocess,
    /// OS named pipe.
    NamedPipe,
    /// Raw TCP socket.
    Tcp,
    /// WebSocket messages.
    #[serde(rename = "websocket")]
    WebSocket,
    /// Remote subsystem over an SSH session.
    Ssh,
}

impl Display for ChannelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Subprocess => "subprocess",
            Self::NamedPipe => "named_pipe",
            Self::Tcp => "tcp",
            Self::WebSocket => "websocket",
            Self::Ssh => "ssh",
        };
        f.write_str(label)
    }
}

/// Inbound half of a channel.
pub trait ChannelRead: Send {
    /// Read the next chunk of inbound bytes.
    ///
    /// `Ok(None)` signals orderly end of stream.
    fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>>;
}

/// Outbound half of a channel.
pub trait ChannelWrite: Send {
    /// Write one chunk completely (a whole record for message media).
    fn write_chunk(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Flush and close the outbound direction.
    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Process backing a channel (subprocess or SSH client), plus its stderr
/// drain task.
#[derive(Debug)]
pub struct ChannelProcess {
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
}

impl ChannelProcess {
    /// Wrap a spawned child and the task draining its stderr.
    #[must_use]
    pub fn new(child: Child, stderr_task: Option<JoinHandle<()>>) -> Self {
        Self { child, stderr_task }
    }

    /// OS process id while the child is alive.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Terminate the process (grace window, then kill) and stop the drain.
    pub async fn terminate(&mut self) {
        terminate_child(&mut self.child, TERMINATE_GRACE).await;
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// A freshly opened channel, ready to be driven by a transport manager.
pub struct OpenChannel {
    /// Medium.
    pub kind: ChannelKind,
    /// Best-effort description of the peer.
    pub remote: String,
    /// Inbound half.
    pub reader: Box<dyn ChannelRead>,
    /// Outbound half.
    pub writer: Box<dyn ChannelWrite>,
    /// Backing process for process-based media.
    pub process: Option<ChannelProcess>,
}

impl std::fmt::Debug for OpenChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenChannel")
            .field("kind", &self.kind)
            .field("remote", &self.remote)
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// [`ChannelRead`] over any async byte stream.
pub struct StreamReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> StreamReader<R> {
    /// Wrap a byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_BYTES),
        }
    }
}

impl<R> ChannelRead for StreamReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            self.buf.reserve(READ_CHUNK_BYTES);
            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .map_err(|err| AppError::Transport(format!("read failed: {err}")))?;
            if n == 0 {
                return Ok(None);
            }
            Ok(Some(self.buf.split().freeze()))
        })
    }
}

/// [`ChannelWrite`] over any async byte sink.
///
/// `shutdown` also drops the sink: some sinks (child stdin) only signal EOF
/// to the peer once the handle is closed.
pub struct StreamWriter<W> {
    inner: Option<W>,
}

impl<W> StreamWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<W> ChannelWrite for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn write_chunk(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let inner = self
                .inner
                .as_mut()
                .ok_or_else(|| AppError::Transport("write after shutdown".into()))?;
            inner
                .write_all(&chunk)
                .await
                .map_err(|err| AppError::Transport(format!("write failed: {err}")))?;
            inner
                .flush()
                .await
                .map_err(|err| AppError::Transport(format!("flush failed: {err}")))
        })
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(mut inner) = self.inner.take() else {
                return Ok(());
            };
            inner
                .shutdown()
                .await
                .map_err(|err| AppError::Transport(format!("shutdown failed: {err}")))
        })
    }
}
