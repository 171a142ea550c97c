//! Named-pipe client channel.
//!
//! The pipe may not exist yet when the client starts; connect is retried
//! every 100ms until it succeeds or the open timeout elapses.

use std::io::ErrorKind;
use std::time::Duration;

use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::GenericFilePath;
use tracing::debug;

use super::channel::{ChannelKind, OpenChannel, StreamReader, StreamWriter};
use super::info::{bounded, NamedPipeInfo};
use super::pipe_name::pipe_path;
use crate::{AppError, Result};

/// Delay between connect attempts while the pipe is absent.
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Connect to the pipe named by `info`.
///
/// # Errors
///
/// - `AppError::ConnectTimeout` if no server appears within `timeout`.
/// - `AppError::ConnectRefused` on any other connect failure.
pub async fn open(info: &NamedPipeInfo, timeout: Option<Duration>) -> Result<OpenChannel> {
    let path = pipe_path(&info.pipe_name);
    let label = format!("named pipe {}", info.pipe_name);

    let stream = bounded(timeout, &label, async {
        loop {
            let name = path.as_path().to_fs_name::<GenericFilePath>().map_err(|err| {
                AppError::Config(format!("invalid pipe path {}: {err}", path.display()))
            })?;
            match Stream::connect(name).await {
                Ok(stream) => break Ok(stream),
                Err(err) if is_retryable(&err) => tokio::time::sleep(CONNECT_RETRY).await,
                Err(err) => break Err(AppError::ConnectRefused(format!("{label}: {err}"))),
            }
        }
    })
    .await?;

    debug!(pipe = %info.pipe_name, "named pipe channel opened");

    let (read, write) = stream.split();
    Ok(OpenChannel {
        kind: ChannelKind::NamedPipe,
        remote: format!("pipe:{}", info.pipe_name),
        reader: Box::new(StreamReader::new(read)),
        writer: Box::new(StreamWriter::new(write)),
        process: None,
    })
}

/// Errors meaning "no server listening yet".
fn is_retryable(err: &std::io::Error) -> bool {
    // 231: ERROR_PIPE_BUSY, all server instances taken.
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused)
        || (cfg!(windows) && err.raw_os_error() == Some(231))
}
