//! Named-pipe addressing.
//!
//! [`pipe_path`] is the one place that turns a bare pipe name into the
//! platform path: `\\.\pipe\<name>` on Windows, `<tmp>/CoreFxPipe_<name>` on
//! Unix (the convention .NET-hosted endpoints listen on).
//!
//! [`discovery_pipe_name`] derives the well-known pipe a running host
//! process listens on, so a client can attach to it by pid.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Prefix of every discoverable host pipe.
pub const DISCOVERY_PREFIX: &str = "PSHost";

/// App-domain tag used on Windows when the caller does not supply one.
pub const DEFAULT_APP_DOMAIN: &str = "DefaultAppDomain";

/// Fixed app-domain tag used on Unix.
pub const UNIX_APP_DOMAIN: &str = "None";

/// Unix pipe file prefix inside the temp directory.
pub const UNIX_PIPE_PREFIX: &str = "CoreFxPipe_";

/// 100ns ticks between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;

/// Platform family; the discovery formula differs between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFamily {
    /// Windows named pipes.
    Windows,
    /// Unix domain sockets under the temp directory.
    Unix,
}

impl PlatformFamily {
    /// Family of the running platform.
    #[must_use]
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }
}

/// Identity of a running host process, as needed for pipe discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProcess {
    /// Process id.
    pub pid: u32,
    /// Process name without extension.
    pub process_name: String,
    /// Process start time.
    pub start_time: DateTime<Utc>,
    /// Optional app-domain qualifier (Windows only).
    pub app_domain: Option<String>,
}

/// Platform path for a bare pipe name.
#[must_use]
pub fn pipe_path(name: &str) -> PathBuf {
    pipe_path_for(name, PlatformFamily::current())
}

/// Platform path for a bare pipe name on an explicit platform family.
#[must_use]
pub fn pipe_path_for(name: &str, family: PlatformFamily) -> PathBuf {
    match family {
        PlatformFamily::Windows => PathBuf::from(format!(r"\\.\pipe\{name}")),
        PlatformFamily::Unix => std::env::temp_dir().join(format!("{UNIX_PIPE_PREFIX}{name}")),
    }
}

/// Windows FILETIME (100ns ticks since 1601-01-01 UTC) for `time`.
#[must_use]
pub fn to_file_time(time: DateTime<Utc>) -> i64 {
    let ticks_since_unix = time.timestamp() * 10_000_000 + i64::from(time.timestamp_subsec_nanos() / 100);
    ticks_since_unix + FILETIME_UNIX_EPOCH_TICKS
}

/// Well-known pipe name of a running host process.
///
/// `PSHost.{timestamp}.{pid}.{appDomain}.{processName}`. Windows uses the
/// decimal FILETIME and the caller's app domain; Unix uses eight hex digits
/// of the FILETIME (skipping the first) and the fixed tag
/// [`UNIX_APP_DOMAIN`].
#[must_use]
pub fn discovery_pipe_name(process: &HostProcess, family: PlatformFamily) -> String {
    let file_time = to_file_time(process.start_time);
    match family {
        PlatformFamily::Windows => {
            let app_domain = process
                .app_domain
                .as_deref()
                .filter(|d| !d.is_empty())
                .unwrap_or(DEFAULT_APP_DOMAIN);
            format!(
                "{DISCOVERY_PREFIX}.{file_time}.{}.{app_domain}.{}",
                process.pid, process.process_name
            )
        }
        PlatformFamily::Unix => {
            let hex = format!("{file_time:08X}");
            let end = hex.len().min(9);
            let stamp = hex.get(1..end).unwrap_or(&hex);
            format!(
                "{DISCOVERY_PREFIX}.{stamp}.{}.{UNIX_APP_DOMAIN}.{}",
                process.pid, process.process_name
            )
        }
    }
}
