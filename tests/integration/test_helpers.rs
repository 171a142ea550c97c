//! Shared helpers for transport and server integration tests.

#![cfg_attr(not(unix), allow(dead_code))]

use std::sync::Arc;
use std::time::Duration;

use host_relay::server::{ServerHandle, WorkerCommand};
use host_relay::transport::RecordCallback;
use tokio::sync::mpsc;

/// Worker that echoes every inbound line.
pub fn echo_worker() -> WorkerCommand {
    WorkerCommand::new("cat", Vec::<String>::new())
}

/// Callback forwarding each record into a channel.
pub fn collecting_callback() -> (RecordCallback, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: RecordCallback = Arc::new(move |record: &str| {
        let _ = tx.send(record.to_owned());
    });
    (callback, rx)
}

/// Next record, or `None` after `timeout`.
pub async fn next_record(
    rx: &mut mpsc::UnboundedReceiver<String>,
    timeout: Duration,
) -> Option<String> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// A TCP port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind scratch listener");
    listener.local_addr().expect("scratch addr").port()
}

/// Port the server actually bound.
pub fn bound_port(handle: &ServerHandle) -> u16 {
    handle
        .local_address()
        .and_then(|addr| addr.rsplit(':').next().map(str::to_owned))
        .and_then(|port| port.parse().ok())
        .expect("bound port")
}

/// Unique pipe name for one test.
pub fn unique_pipe_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// Poll `check` every 20ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether a process with `pid` still exists (reaped children do not).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let pid = nix::unistd::Pid::from_raw(i32::try_from(pid).expect("pid fits i32"));
    nix::sys::signal::kill(pid, None).is_ok()
}
