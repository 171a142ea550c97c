//! Open timeouts and connect failures across channel kinds.

use std::time::{Duration, Instant};

use host_relay::models::transport::TransportState;
use host_relay::transport::info::{SshCredential, SshInfo};
use host_relay::transport::{ChannelConnectionInfo, TransportManager, TransportOptions};
use host_relay::AppError;

use super::test_helpers::{collecting_callback, free_port};

fn short(timeout_ms: u64) -> TransportOptions {
    TransportOptions {
        open_timeout: Some(Duration::from_millis(timeout_ms)),
        ..TransportOptions::default()
    }
}

#[tokio::test]
async fn tcp_refused_is_a_connect_error() {
    let info = ChannelConnectionInfo::tcp("127.0.0.1", free_port()).expect("info");
    let manager = TransportManager::new(short(2_000));
    let (callback, _rx) = collecting_callback();

    let err = manager.open(&info, callback).await.expect_err("nothing listening");
    assert!(err.is_connect_error(), "unexpected error: {err}");
    assert_eq!(manager.state(), TransportState::Broken);
    assert_eq!(manager.last_error(), Some(err));
}

#[tokio::test]
async fn tcp_unroutable_host_is_bounded_by_open_timeout() {
    let info = ChannelConnectionInfo::tcp("10.255.255.1", 9).expect("info");
    let (callback, _rx) = collecting_callback();

    let started = Instant::now();
    match TransportManager::connect(&info, short(300), callback).await {
        Err(err) => assert!(err.is_connect_error(), "unexpected error: {err}"),
        // Some sandboxes answer every address; nothing to bound then.
        Ok(manager) => manager.cleanup().await,
    }
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn invalid_info_is_rejected_before_connecting() {
    let info = ChannelConnectionInfo::Ssh(SshInfo {
        host: String::new(),
        port: 22,
        user: None,
        credential: SshCredential::Default,
        subsystem: None,
        options: Default::default(),
    });
    let (callback, _rx) = collecting_callback();

    let err = TransportManager::connect(&info, TransportOptions::default(), callback)
        .await
        .expect_err("empty host");
    assert!(matches!(err, AppError::Config(_)));
}
