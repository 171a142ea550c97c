//! Bridges one accepted channel to its isolated worker process.
//!
//! The worker is spawned before the connection is registered. Two copy loops
//! then run on their own tasks (channel to worker stdin, worker stdout to
//! channel) next to a stderr drain. Whichever loop ends first cancels the
//! connection's teardown token; the supervisor then joins both loops,
//! terminates the worker and only afterwards removes the registry entry.
//!
//! Bytes pass through unchanged. Message channels (WebSocket) get worker
//! output cut at `\n` so each message carries one whole record.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::connections::AdmissionPermit;
use super::ServerInstance;
use crate::models::connection::ConnectionDetails;
use crate::process::{terminate_child, TERMINATE_GRACE};
use crate::transport::channel::{ChannelKind, ChannelRead, ChannelWrite, OpenChannel, StreamReader};
use crate::transport::codec::MAX_RECORD_BYTES;
use crate::{AppError, Result};

/// Bound on the copy loops winding down after teardown starts.
const LOOP_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the proxy for one accepted channel to completion.
///
/// On resolve or spawn failure the channel is closed, the permit released
/// and the error recorded on the server; nothing is registered.
pub async fn run(server: Arc<ServerInstance>, channel: OpenChannel, permit: AdmissionPermit) {
    let OpenChannel {
        kind,
        remote,
        reader,
        mut writer,
        ..
    } = channel;
    let per_record = kind == ChannelKind::WebSocket;

    if server.connections().is_closed() {
        debug!(server = %server.name(), %remote, "server stopping, connection not served");
        writer.shutdown().await.ok();
        return;
    }

    let spawned = server
        .worker()
        .resolve()
        .and_then(|program| server.worker().spawn(&program));
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            warn!(server = %server.name(), %remote, %err, "worker unavailable, closing connection");
            server.record_error(&err);
            writer.shutdown().await.ok();
            drop(permit);
            return;
        }
    };

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let err = AppError::SpawnFailed("failed to capture worker stdio".into());
        warn!(server = %server.name(), %err, "worker spawn incomplete");
        server.record_error(&err);
        terminate_child(&mut child, TERMINATE_GRACE).await;
        writer.shutdown().await.ok();
        return;
    };

    let pid = child.id();
    let teardown = CancellationToken::new();
    let Some(connection_id) =
        permit.register(ConnectionDetails::new(remote.clone(), pid), teardown.clone())
    else {
        info!(server = %server.name(), %remote, ?pid, "server stopping, connection dropped");
        terminate_child(&mut child, TERMINATE_GRACE).await;
        writer.shutdown().await.ok();
        return;
    };

    let span = info_span!("connection", server = %server.name(), %connection_id, %remote, ?pid);
    async move {
        info!("connection accepted");

        let mut inbound = tokio::spawn(
            copy_inbound(reader, stdin, teardown.clone()).instrument(tracing::Span::current()),
        );
        let mut outbound = tokio::spawn(
            copy_outbound(stdout, writer, per_record, teardown.clone())
                .instrument(tracing::Span::current()),
        );
        let discard = tokio::spawn(async move {
            let mut stderr = stderr;
            tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await.ok();
        });

        teardown.cancelled().await;

        for (direction, task) in [("inbound", &mut inbound), ("outbound", &mut outbound)] {
            match tokio::time::timeout(LOOP_EXIT_TIMEOUT, &mut *task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    debug!(direction, %err, "copy loop failed");
                    server.record_error(&err);
                }
                Ok(Err(err)) => warn!(direction, %err, "copy loop panicked"),
                Err(_) => {
                    debug!(direction, "copy loop did not exit in time");
                    task.abort();
                }
            }
        }

        terminate_child(&mut child, TERMINATE_GRACE).await;
        discard.abort();
        server.connections().remove(connection_id);
        info!("connection closed");
    }
    .instrument(span)
    .await;
}

/// Channel to worker stdin, chunks copied verbatim.
async fn copy_inbound(
    mut reader: Box<dyn ChannelRead>,
    mut stdin: ChildStdin,
    teardown: CancellationToken,
) -> Result<()> {
    let result = forward_chunks(reader.as_mut(), &mut stdin, &teardown).await;
    teardown.cancel();
    result
}

async fn forward_chunks(
    reader: &mut dyn ChannelRead,
    stdin: &mut ChildStdin,
    teardown: &CancellationToken,
) -> Result<()> {
    loop {
        let chunk = tokio::select! {
            () = teardown.cancelled() => return Ok(()),
            chunk = reader.read_chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            debug!("peer closed");
            return Ok(());
        };
        stdin
            .write_all(&chunk)
            .await
            .map_err(|err| AppError::Transport(format!("worker stdin write failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| AppError::Transport(format!("worker stdin flush failed: {err}")))?;
    }
}

/// Worker stdout to channel.
async fn copy_outbound(
    stdout: ChildStdout,
    mut writer: Box<dyn ChannelWrite>,
    per_record: bool,
    teardown: CancellationToken,
) -> Result<()> {
    let result = forward_output(stdout, writer.as_mut(), per_record, &teardown).await;
    teardown.cancel();
    if let Err(err) = writer.shutdown().await {
        debug!(%err, "channel shutdown failed");
    }
    result
}

/// Copy `stdout` to `writer`. With `per_record` every write is one record
/// including its `\n`; otherwise chunks are copied as read.
async fn forward_output<R>(
    stdout: R,
    writer: &mut dyn ChannelWrite,
    per_record: bool,
    teardown: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut source = StreamReader::new(stdout);
    let mut pending = BytesMut::new();
    loop {
        let chunk = tokio::select! {
            () = teardown.cancelled() => return Ok(()),
            chunk = source.read_chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            if !pending.is_empty() {
                writer.write_chunk(pending.split().freeze()).await?;
            }
            debug!("worker closed stdout");
            return Ok(());
        };
        if !per_record {
            writer.write_chunk(chunk).await?;
            continue;
        }

        let scanned = pending.len();
        pending.extend_from_slice(&chunk);
        let mut from = scanned;
        while let Some(offset) = pending[from..].iter().position(|b| *b == b'\n') {
            let record = pending.split_to(from + offset + 1).freeze();
            writer.write_chunk(record).await?;
            from = 0;
        }
        if pending.len() > MAX_RECORD_BYTES {
            warn!(len = pending.len(), "worker record exceeds limit, sending it split");
            writer.write_chunk(pending.split().freeze()).await?;
        }
    }
}
