//! Subprocess-stdio channel.
//!
//! Spawns the target with piped stdio. Stdout becomes the inbound half,
//! stdin the outbound half. Stderr is drained on its own task and logged at
//! `debug`; it never reaches the record stream.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use super::channel::{ChannelKind, ChannelProcess, OpenChannel, StreamReader, StreamWriter};
use super::info::{bounded, SubprocessInfo};
use crate::process::resolve_executable;
use crate::{AppError, Result};

/// Spawn the process described by `info`.
///
/// # Errors
///
/// - `AppError::ExecutableNotFound` if the program cannot be resolved.
/// - `AppError::SpawnFailed` if the OS refuses to start it or stdio cannot
///   be captured.
/// - `AppError::ConnectTimeout` if spawning exceeds `timeout`.
pub async fn open(info: &SubprocessInfo, timeout: Option<Duration>) -> Result<OpenChannel> {
    bounded(timeout, "subprocess", async {
        let program = resolve_executable(&info.program)?;

        let mut cmd = Command::new(&program);
        cmd.args(&info.args)
            .envs(&info.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &info.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::SpawnFailed(format!("failed to spawn {}: {err}", program.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::SpawnFailed("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::SpawnFailed("failed to capture child stdout".into()))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(stderr, child.id(), |pid, line| {
                debug!(?pid, line, "subprocess stderr");
            }));

        debug!(program = %program.display(), pid = ?child.id(), "subprocess channel opened");

        Ok(OpenChannel {
            kind: ChannelKind::Subprocess,
            remote: format!("process:{}", program.display()),
            reader: Box::new(StreamReader::new(stdout)),
            writer: Box::new(StreamWriter::new(stdin)),
            process: Some(ChannelProcess::new(child, stderr_task)),
        })
    })
    .await
}

/// Read `stderr` line by line until EOF, handing each line to `sink`.
pub(crate) fn drain_stderr<R, F>(stderr: R, pid: Option<u32>, sink: F) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(Option<u32>, &str) + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink(pid, &line);
        }
    })
}
