//! Child-process helpers shared by process-backed channels and workers.
//!
//! - [`resolve_executable`] locates a program on the search path.
//! - [`terminate_child`] asks a child to exit and hard-kills it after a
//!   grace window, always reaping it so no zombie is left behind.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Grace window between the polite exit request and the hard kill.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Resolve `program` to an existing executable path.
///
/// Programs containing a path separator are checked as given; bare names are
/// searched on `PATH` (honouring `PATHEXT` on Windows).
///
/// # Errors
///
/// Returns `AppError::ExecutableNotFound` if nothing matches.
pub fn resolve_executable(program: &str) -> Result<PathBuf> {
    if program.trim().is_empty() {
        return Err(AppError::ExecutableNotFound("empty program name".into()));
    }

    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return if is_executable(candidate) {
            Ok(candidate.to_path_buf())
        } else {
            Err(AppError::ExecutableNotFound(program.to_owned()))
        };
    }

    let search_path = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&search_path) {
        for name in candidate_names(program) {
            let full = dir.join(&name);
            if is_executable(&full) {
                return Ok(full);
            }
        }
    }

    Err(AppError::ExecutableNotFound(format!(
        "'{program}' not found on PATH"
    )))
}

#[cfg(windows)]
fn candidate_names(program: &str) -> Vec<String> {
    let mut names = vec![program.to_owned()];
    if Path::new(program).extension().is_none() {
        let exts = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".into());
        names.extend(exts.split(';').filter(|e| !e.is_empty()).map(|e| format!("{program}{e}")));
    }
    names
}

#[cfg(not(windows))]
fn candidate_names(program: &str) -> Vec<String> {
    vec![program.to_owned()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Terminate `child`: request a graceful exit, wait up to `grace`, then kill.
///
/// On Unix the polite request is `SIGTERM`; elsewhere there is no portable
/// equivalent, so the child is killed immediately. Safe to call on a child
/// that already exited.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    if let Ok(Some(status)) = child.try_wait() {
        debug!(pid, %status, "child already exited");
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Ok(raw) = i32::try_from(pid) {
            if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                debug!(pid, error = ?err, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, %status, "child exited after SIGTERM");
                return;
            }
            Ok(Err(err)) => warn!(pid, %err, "wait failed after SIGTERM"),
            Err(_) => debug!(pid, "child did not exit within grace window"),
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill().await {
        warn!(pid, %err, "kill failed");
        return;
    }
    info!(pid, "child killed");
}
