#![cfg(unix)]

use std::time::{Duration, Instant};

use host_relay::process::{resolve_executable, terminate_child};
use host_relay::AppError;
use tokio::process::Command;

#[test]
fn resolves_bare_name_on_path() {
    let path = resolve_executable("sh").expect("sh on PATH");
    assert!(path.is_absolute());
    assert!(path.ends_with("sh"));
}

#[test]
fn explicit_path_must_exist() {
    assert!(resolve_executable("/bin/sh").is_ok());
    assert!(matches!(
        resolve_executable("/nonexistent/dir/tool"),
        Err(AppError::ExecutableNotFound(_))
    ));
    assert!(matches!(resolve_executable(""), Err(AppError::ExecutableNotFound(_))));
}

#[test]
fn non_executable_file_is_not_resolved() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("plain.txt");
    std::fs::write(&file, "data").expect("write");
    assert!(resolve_executable(file.to_str().expect("utf8")).is_err());
}

#[tokio::test]
async fn terminate_stops_cooperative_child_quickly() {
    let mut child = Command::new("sleep").arg("30").spawn().expect("spawn");
    let started = Instant::now();
    terminate_child(&mut child, Duration::from_millis(500)).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(child.try_wait().expect("wait").is_some());
}

#[tokio::test]
async fn terminate_kills_child_ignoring_sigterm() {
    let mut child = Command::new("sh")
        .args(["-c", "trap '' TERM; sleep 30"])
        .spawn()
        .expect("spawn");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    terminate_child(&mut child, Duration::from_millis(300)).await;
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(child.try_wait().expect("wait").is_some());
}

#[tokio::test]
async fn terminate_is_noop_after_exit() {
    let mut child = Command::new("true").spawn().expect("spawn");
    child.wait().await.expect("wait");
    terminate_child(&mut child, Duration::from_millis(100)).await;
    terminate_child(&mut child, Duration::from_millis(100)).await;
}
