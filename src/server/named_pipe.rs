//! Named-pipe listener (Unix domain socket off Windows).

use std::path::Path;
use std::sync::Arc;

use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
use interprocess::local_socket::{GenericFilePath, ListenerOptions, Name};
use tracing::{debug, info, warn};

use super::{proxy, ServerInstance, ADMISSION_RETRY};
use crate::models::server::ServerAddress;
use crate::transport::channel::{ChannelKind, OpenChannel, StreamReader, StreamWriter};
use crate::transport::pipe_name::pipe_path;
use crate::{AppError, Result};

fn fs_name(path: &Path) -> Result<Name<'_>> {
    path.to_fs_name::<GenericFilePath>()
        .map_err(|err| AppError::Config(format!("invalid pipe path {}: {err}", path.display())))
}

/// Create the pipe listener for `address`.
///
/// On Unix a socket file left behind by a dead process is removed first;
/// one that still answers is reported as a duplicate.
///
/// # Errors
///
/// - `AppError::DuplicateAddress` if another server owns the pipe.
/// - `AppError::Io` for other creation failures.
pub async fn bind(address: &ServerAddress) -> Result<(Listener, String)> {
    let ServerAddress::Pipe { name } = address else {
        return Err(AppError::Config(format!("{address} is not a pipe address")));
    };
    let path = pipe_path(name);

    if cfg!(unix) && path.exists() {
        if Stream::connect(fs_name(&path)?).await.is_ok() {
            return Err(AppError::DuplicateAddress(format!("{address} is already in use")));
        }
        debug!(path = %path.display(), "removing stale pipe socket");
        std::fs::remove_file(&path)
            .map_err(|err| AppError::Io(format!("failed to remove {}: {err}", path.display())))?;
    }

    let listener = ListenerOptions::new()
        .name(fs_name(&path)?)
        .create_tokio()
        .map_err(|err| super::tcp::map_bind_error(address, &err))?;
    Ok((listener, path.display().to_string()))
}

/// Accept pipe clients until the server is cancelled.
///
/// # Errors
///
/// Never fails today; accept errors are logged and retried.
pub async fn serve(server: Arc<ServerInstance>, listener: Listener) -> Result<()> {
    let cancel = server.cancel_token().clone();
    let remote = server.address().to_string();
    info!(%remote, "pipe server accepting");
    loop {
        let permit = loop {
            if let Some(permit) = server.connections().try_reserve() {
                break permit;
            }
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(ADMISSION_RETRY) => {}
            }
        };

        let accepted = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(stream) => {
                debug!("pipe client accepted");
                let (read, write) = stream.split();
                let channel = OpenChannel {
                    kind: ChannelKind::NamedPipe,
                    remote: remote.clone(),
                    reader: Box::new(StreamReader::new(read)),
                    writer: Box::new(StreamWriter::new(write)),
                    process: None,
                };
                tokio::spawn(proxy::run(Arc::clone(&server), channel, permit));
            }
            Err(err) => {
                warn!(%err, "pipe accept failed");
                tokio::time::sleep(ADMISSION_RETRY).await;
            }
        }
    }
}
