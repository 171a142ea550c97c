//! Raw TCP listener.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{proxy, ServerInstance, ADMISSION_RETRY};
use crate::models::server::ServerAddress;
use crate::transport::channel::{ChannelKind, OpenChannel, StreamReader, StreamWriter};
use crate::{AppError, Result};

/// Bind a TCP listener for `address`.
///
/// # Errors
///
/// - `AppError::DuplicateAddress` if the port is already taken.
/// - `AppError::Io` for other bind failures.
pub async fn bind(address: &ServerAddress) -> Result<TcpListener> {
    let ServerAddress::Socket { host, port, .. } = address else {
        return Err(AppError::Config(format!("{address} is not a socket address")));
    };
    TcpListener::bind((host.as_str(), *port))
        .await
        .map_err(|err| map_bind_error(address, &err))
}

pub(crate) fn map_bind_error(address: &ServerAddress, err: &std::io::Error) -> AppError {
    if err.kind() == std::io::ErrorKind::AddrInUse {
        AppError::DuplicateAddress(format!("{address} is already in use"))
    } else {
        AppError::Io(format!("failed to bind {address}: {err}"))
    }
}

/// Accept connections until the server is cancelled.
///
/// At the connection limit the loop waits for a free slot before accepting,
/// so excess peers queue in the OS backlog instead of being refused.
///
/// # Errors
///
/// Never fails today; accept errors are logged and retried.
pub async fn serve(server: Arc<ServerInstance>, listener: TcpListener) -> Result<()> {
    let cancel = server.cancel_token().clone();
    info!(local = ?listener.local_addr().ok(), "tcp server accepting");
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
            Ok((stream, peer)) => {
                debug!(%peer, "tcp connection accepted");
                stream.set_nodelay(true).ok();
                let (read, write) = stream.into_split();
                let channel = OpenChannel {
                    kind: ChannelKind::Tcp,
                    remote: peer.to_string(),
                    reader: Box::new(StreamReader::new(read)),
                    writer: Box::new(StreamWriter::new(write)),
                    process: None,
                };
                tokio::spawn(proxy::run(Arc::clone(&server), channel, permit));
            }
            Err(err) => {
                warn!(%err, "tcp accept failed");
                tokio::time::sleep(ADMISSION_RETRY).await;
            }
        }
    }
}
