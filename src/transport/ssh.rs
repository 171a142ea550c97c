//! SSH-exec channel through the platform OpenSSH client.
//!
//! A plain TCP connect to `host:port` runs first so an unreachable host
//! fails with a connect error under the open timeout, not a dead child.
//! The client then runs the named subsystem with no pty; its stdout is the
//! record stream, its stderr is diagnostics only.
//!
//! The channel is reported open only once the client logs that it has
//! authenticated. That connect, the client's own handshake and authentication
//! all share one open timeout; on expiry the client is killed.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::channel::{ChannelKind, ChannelProcess, OpenChannel, StreamReader, StreamWriter};
use super::info::{bounded, SshCredential, SshInfo};
use super::subprocess::drain_stderr;
use crate::process::resolve_executable;
use crate::{AppError, Result};

/// Receives SSH client stderr lines.
pub type DiagnosticsCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// OpenSSH client executable.
const SSH_PROGRAM: &str = "ssh";
/// Password helper executable.
const SSHPASS_PROGRAM: &str = "sshpass";
/// Stderr line OpenSSH writes at `VERBOSE` once user authentication succeeds.
pub const AUTHENTICATED_MARKER: &str = "Authenticated to ";

/// Start the ssh client for `info` and wait until it has authenticated.
///
/// # Errors
///
/// - `AppError::ConnectTimeout` if the host, the SSH handshake or
///   authentication does not finish within `timeout`.
/// - `AppError::ConnectRefused` if the host is unreachable or the client
///   exits before authenticating.
/// - `AppError::ExecutableNotFound` if `ssh` (or `sshpass` for password
///   credentials) is not on `PATH`.
/// - `AppError::SpawnFailed` if the client cannot be started.
pub async fn open(
    info: &SshInfo,
    timeout: Option<Duration>,
    diagnostics: Option<DiagnosticsCallback>,
) -> Result<OpenChannel> {
    let started = Instant::now();
    let target = format!("{}:{}", info.host, info.port);
    bounded(timeout, &format!("ssh {target}"), async {
        TcpStream::connect((info.host.as_str(), info.port))
            .await
            .map(drop)
            .map_err(|err| AppError::ConnectRefused(format!("ssh {target}: {err}")))
    })
    .await?;

    let ssh = resolve_executable(SSH_PROGRAM)?;
    let mut cmd = match &info.credential {
        SshCredential::Password(password) => {
            let sshpass = resolve_executable(SSHPASS_PROGRAM)?;
            let mut cmd = Command::new(sshpass);
            cmd.arg("-e").arg(&ssh).env("SSHPASS", password);
            cmd
        }
        SshCredential::Default | SshCredential::KeyFile(_) => Command::new(&ssh),
    };
    cmd.args(ssh_args(info, timeout))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::SpawnFailed(format!("failed to spawn ssh client: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::SpawnFailed("failed to capture ssh stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::SpawnFailed("failed to capture ssh stdout".into()))?;

    let (ready_tx, mut ready_rx) = watch::channel(false);
    let host = info.host.clone();
    let stderr_task = child.stderr.take().map(|stderr| {
        drain_stderr(stderr, child.id(), move |pid, line| {
            if line.starts_with(AUTHENTICATED_MARKER) {
                ready_tx.send_replace(true);
            }
            warn!(%host, ?pid, line, "ssh diagnostics");
            if let Some(callback) = &diagnostics {
                callback(line);
            }
        })
    });

    let remaining = timeout.map(|limit| limit.saturating_sub(started.elapsed()));
    let handshake = bounded(remaining, &format!("ssh {target} authentication"), async {
        tokio::select! {
            ready = ready_rx.wait_for(|ready| *ready) => Ok(ready.is_ok()),
            status = child.wait() => Err(exited_early(&target, status)),
        }
    })
    .await;

    let failure = match handshake {
        Ok(true) => None,
        Ok(false) => Some(AppError::ConnectRefused(format!(
            "ssh {target}: client closed stderr before authenticating"
        ))),
        Err(err) => Some(err),
    };
    if let Some(err) = failure {
        warn!(%target, %err, "ssh client did not authenticate");
        ChannelProcess::new(child, stderr_task).terminate().await;
        return Err(err);
    }

    debug!(%target, subsystem = ?info.subsystem, pid = ?child.id(), "ssh channel opened");

    Ok(OpenChannel {
        kind: ChannelKind::Ssh,
        remote: format!("ssh://{target}"),
        reader: Box::new(StreamReader::new(stdout)),
        writer: Box::new(StreamWriter::new(stdin)),
        process: Some(ChannelProcess::new(child, stderr_task)),
    })
}

fn exited_early(target: &str, status: std::io::Result<ExitStatus>) -> AppError {
    match status {
        Ok(status) => AppError::ConnectRefused(format!(
            "ssh {target}: client exited with {status} before authenticating"
        )),
        Err(err) => AppError::ConnectRefused(format!("ssh {target}: {err}")),
    }
}

/// Build the ssh client argument list for `info`.
///
/// `connect_timeout` becomes `ConnectTimeout`, rounded up to whole seconds.
/// `LogLevel=VERBOSE` comes before user options so the authentication line
/// is always written.
#[must_use]
pub fn ssh_args(info: &SshInfo, connect_timeout: Option<Duration>) -> Vec<String> {
    let mut args = vec!["-T".to_owned(), "-p".to_owned(), info.port.to_string()];
    if let Some(user) = &info.user {
        args.extend(["-l".to_owned(), user.clone()]);
    }
    match &info.credential {
        SshCredential::KeyFile(path) => {
            args.extend(["-i".to_owned(), path.display().to_string()]);
            args.extend(["-o".to_owned(), "BatchMode=yes".to_owned()]);
        }
        SshCredential::Default => {
            args.extend(["-o".to_owned(), "BatchMode=yes".to_owned()]);
        }
        SshCredential::Password(_) => {
            args.extend(["-o".to_owned(), "PubkeyAuthentication=no".to_owned()]);
        }
    }
    if let Some(limit) = connect_timeout {
        let secs = (limit.as_secs() + u64::from(limit.subsec_nanos() > 0)).max(1);
        args.extend(["-o".to_owned(), format!("ConnectTimeout={secs}")]);
    }
    args.extend(["-o".to_owned(), "LogLevel=VERBOSE".to_owned()]);
    for (key, value) in &info.options {
        args.extend(["-o".to_owned(), format!("{key}={value}")]);
    }
    match &info.subsystem {
        Some(subsystem) => {
            args.extend(["-s".to_owned(), info.host.clone(), subsystem.clone()]);
        }
        None => args.push(info.host.clone()),
    }
    args
}
