//! TCP client channel.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use super::channel::{ChannelKind, OpenChannel, StreamReader, StreamWriter};
use super::info::{bounded, TcpInfo};
use crate::{AppError, Result};

/// Connect to `info.host:info.port`.
///
/// # Errors
///
/// - `AppError::ConnectTimeout` if the connect does not finish in time.
/// - `AppError::ConnectRefused` if the connect fails.
pub async fn open(info: &TcpInfo, timeout: Option<Duration>) -> Result<OpenChannel> {
    let target = format!("{}:{}", info.host, info.port);
    let stream = bounded(timeout, &format!("tcp {target}"), async {
        TcpStream::connect((info.host.as_str(), info.port))
            .await
            .map_err(|err| AppError::ConnectRefused(format!("tcp {target}: {err}")))
    })
    .await?;

    stream.set_nodelay(true).ok();
    let remote = stream
        .peer_addr()
        .map_or_else(|_| target.clone(), |addr| addr.to_string());
    debug!(%remote, "tcp channel opened");

    let (read, write) = stream.into_split();
    Ok(OpenChannel {
        kind: ChannelKind::Tcp,
        remote,
        reader: Box::new(StreamReader::new(read)),
        writer: Box::new(StreamWriter::new(write)),
        process: None,
    })
}
