//! TCP listener, proxy, admission, drain and registry uniqueness.

#![cfg(unix)]

use std::time::{Duration, Instant};

use host_relay::models::server::{ServerKind, ServerState};
use host_relay::models::transport::TransportState;
use host_relay::server::{ServerRegistry, ServerSpec, WorkerCommand};
use host_relay::transport::{AckMatcher, ChannelConnectionInfo, TransportManager, TransportOptions};
use host_relay::AppError;
use serial_test::serial;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::test_helpers::{
    bound_port, collecting_callback, echo_worker, free_port, next_record, pid_alive, wait_until,
};

const WAIT: Duration = Duration::from_secs(5);

async fn client(port: u16) -> (TransportManager, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let info = ChannelConnectionInfo::tcp("127.0.0.1", port).expect("info");
    let (callback, rx) = collecting_callback();
    let manager = TransportManager::connect(&info, TransportOptions::default(), callback)
        .await
        .expect("tcp connect");
    (manager, rx)
}

#[tokio::test]
async fn proxies_records_through_worker() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::tcp("127.0.0.1", 0, echo_worker()).with_name("tcp-echo"))
        .await
        .expect("start");
    assert_eq!(handle.state(), ServerState::Running);

    let (manager, mut rx) = client(bound_port(&handle)).await;
    manager.send("{\"op\":\"ping\"}").await.expect("send");
    assert_eq!(
        next_record(&mut rx, WAIT).await.as_deref(),
        Some("{\"op\":\"ping\"}")
    );

    assert!(wait_until(WAIT, || handle.connection_count() == 1).await);
    let details = handle.connections();
    assert_eq!(details.len(), 1);
    assert!(details[0].worker_process_id.is_some());
    assert!(details[0].remote_address.starts_with("127.0.0.1:"));

    manager.cleanup().await;
    registry.stop("tcp-echo", true).await.expect("stop");
}

#[tokio::test]
async fn record_split_across_writes_is_delivered_whole() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::tcp("127.0.0.1", 0, echo_worker()))
        .await
        .expect("start");

    let mut stream = TcpStream::connect(("127.0.0.1", bound_port(&handle)))
        .await
        .expect("connect");
    stream.write_all(b"first-ha").await.expect("write");
    stream.flush().await.expect("flush");
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(b"lf\nsecond\n").await.expect("write");

    let (read, _write) = stream.split();
    let mut lines = BufReader::new(read).lines();
    let first = tokio::time::timeout(WAIT, lines.next_line()).await.expect("in time");
    assert_eq!(first.expect("read").as_deref(), Some("first-half"));
    let second = tokio::time::timeout(WAIT, lines.next_line()).await.expect("in time");
    assert_eq!(second.expect("read").as_deref(), Some("second"));

    registry.stop_all(true).await;
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let registry = ServerRegistry::new();
    registry
        .start(ServerSpec::tcp("127.0.0.1", 0, echo_worker()).with_name("dup"))
        .await
        .expect("first start");

    let err = registry
        .start(ServerSpec::tcp("127.0.0.1", 0, echo_worker()).with_name("dup"))
        .await
        .expect_err("second start must fail");
    assert!(matches!(err, AppError::DuplicateName(_)));
    assert_eq!(registry.len(), 1);

    registry.stop_all(true).await;
}

#[tokio::test]
#[serial]
async fn duplicate_address_is_rejected_across_tcp_and_websocket() {
    let registry = ServerRegistry::new();
    let port = free_port();
    registry
        .start(ServerSpec::tcp("127.0.0.1", port, echo_worker()).with_name("a"))
        .await
        .expect("first start");

    let err = registry
        .start(ServerSpec::tcp("127.0.0.1", port, echo_worker()).with_name("b"))
        .await
        .expect_err("same port");
    assert!(err.is_registration_conflict());
    assert!(matches!(err, AppError::DuplicateAddress(_)));

    let err = registry
        .start(ServerSpec::websocket("127.0.0.1", port, "/", echo_worker()).with_name("c"))
        .await
        .expect_err("websocket on the same port");
    assert!(matches!(err, AppError::DuplicateAddress(_)));

    assert_eq!(registry.list(None).len(), 1);
    registry.stop_all(true).await;
}

#[tokio::test]
#[serial]
async fn bind_failure_unregisters_server() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("occupy port");
    let port = taken.local_addr().expect("addr").port();
    let registry = ServerRegistry::new();

    let err = registry
        .start(ServerSpec::tcp("127.0.0.1", port, echo_worker()).with_name("clash"))
        .await
        .expect_err("port is taken");

    assert!(matches!(err, AppError::DuplicateAddress(_)));
    assert!(registry.get("clash").is_none());
}

#[tokio::test]
async fn admission_delays_excess_connections() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(
            ServerSpec::tcp("127.0.0.1", 0, echo_worker())
                .with_name("limited")
                .with_max_connections(1),
        )
        .await
        .expect("start");
    let port = bound_port(&handle);

    let (first, mut first_rx) = client(port).await;
    first.send("one").await.expect("send");
    assert_eq!(next_record(&mut first_rx, WAIT).await.as_deref(), Some("one"));

    // TCP connect succeeds from the backlog, but nothing is proxied yet.
    let (second, mut second_rx) = client(port).await;
    second.send("two").await.expect("send");
    assert_eq!(next_record(&mut second_rx, Duration::from_millis(500)).await, None);
    assert_eq!(handle.connection_count(), 1);

    first.cleanup().await;
    assert_eq!(next_record(&mut second_rx, WAIT).await.as_deref(), Some("two"));
    assert!(handle.connection_count() <= 1);

    second.cleanup().await;
    registry.stop_all(true).await;
}

#[tokio::test]
async fn graceful_stop_waits_for_drain_window() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(
            ServerSpec::tcp("127.0.0.1", 0, echo_worker())
                .with_name("drain")
                .with_drain_timeout(Duration::from_secs(2)),
        )
        .await
        .expect("start");

    let (manager, mut rx) = client(bound_port(&handle)).await;
    manager.send("x").await.expect("send");
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("x"));
    let pid = handle.connections()[0].worker_process_id.expect("pid");

    let started = Instant::now();
    let summary = registry.stop("drain", false).await.expect("stop");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(1500), "stopped after {elapsed:?}");
    assert_eq!(summary.state, ServerState::Stopped);
    assert_eq!(summary.connection_count, 0);
    assert!(!pid_alive(pid));
    assert!(registry.get("drain").is_none());
}

#[tokio::test]
async fn graceful_stop_returns_early_once_drained() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(
            ServerSpec::tcp("127.0.0.1", 0, echo_worker())
                .with_name("early")
                .with_drain_timeout(Duration::from_secs(10)),
        )
        .await
        .expect("start");

    let (manager, mut rx) = client(bound_port(&handle)).await;
    manager.send("x").await.expect("send");
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("x"));

    let stopper = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.stop("early", false).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.cleanup().await;

    let summary = tokio::time::timeout(Duration::from_secs(3), stopper)
        .await
        .expect("stop finishes once drained")
        .expect("join")
        .expect("stop");
    assert_eq!(summary.state, ServerState::Stopped);
}

#[tokio::test]
async fn forced_stop_is_prompt_and_kills_workers() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(
            ServerSpec::tcp("127.0.0.1", 0, echo_worker())
                .with_name("force")
                .with_drain_timeout(Duration::from_secs(30)),
        )
        .await
        .expect("start");

    let (manager, mut rx) = client(bound_port(&handle)).await;
    manager.send("x").await.expect("send");
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("x"));
    let pid = handle.connections()[0].worker_process_id.expect("pid");

    let started = Instant::now();
    let summary = registry.stop("force", true).await.expect("stop");

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(summary.state, ServerState::Stopped);
    assert_eq!(summary.connection_count, 0);
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn peer_close_terminates_worker() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::tcp("127.0.0.1", 0, echo_worker()))
        .await
        .expect("start");

    let (manager, mut rx) = client(bound_port(&handle)).await;
    manager.send("x").await.expect("send");
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("x"));
    let pid = handle.connections()[0].worker_process_id.expect("pid");

    manager.cleanup().await;

    assert!(wait_until(WAIT, || handle.connection_count() == 0).await);
    assert!(!pid_alive(pid));
    registry.stop_all(true).await;
}

#[tokio::test]
async fn worker_exit_closes_peer() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::tcp(
            "127.0.0.1",
            0,
            WorkerCommand::new("sh", ["-c", "read line; echo \"got $line\""]),
        ))
        .await
        .expect("start");

    let (manager, mut rx) = client(bound_port(&handle)).await;
    manager.send("hello").await.expect("send");
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("got hello"));

    let reached = tokio::time::timeout(WAIT, manager.wait_for_state(TransportState::Closed))
        .await
        .expect("peer closed in time");
    assert_eq!(reached, TransportState::Closed);
    assert!(wait_until(WAIT, || handle.connection_count() == 0).await);
    registry.stop_all(true).await;
}

#[tokio::test]
async fn missing_worker_closes_connection_and_records_error() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::tcp(
            "127.0.0.1",
            0,
            WorkerCommand::new("no-such-worker-binary-xyz", Vec::<String>::new()),
        ))
        .await
        .expect("start");

    let mut stream = TcpStream::connect(("127.0.0.1", bound_port(&handle)))
        .await
        .expect("connect");
    let mut buf = [0_u8; 16];
    let read = tokio::time::timeout(WAIT, tokio::io::AsyncReadExt::read(&mut stream, &mut buf))
        .await
        .expect("closed in time");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(wait_until(WAIT, || handle.last_error().is_some()).await);
    assert!(handle
        .last_error()
        .is_some_and(|err| err.starts_with("executable not found")));
    assert_eq!(handle.connection_count(), 0);
    registry.stop_all(true).await;
}

#[tokio::test]
async fn list_filters_by_kind() {
    let registry = ServerRegistry::new();
    registry
        .start(ServerSpec::tcp("127.0.0.1", 0, echo_worker()).with_name("t1"))
        .await
        .expect("tcp");
    registry
        .start(ServerSpec::websocket("127.0.0.1", 0, "/", echo_worker()).with_name("w1"))
        .await
        .expect("ws");

    assert_eq!(registry.list(None).len(), 2);
    let tcp = registry.list(Some(ServerKind::Tcp));
    assert_eq!(tcp.len(), 1);
    assert_eq!(tcp[0].name, "t1");
    assert!(tcp[0].started_at.is_some());

    registry.stop_all(true).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn stopping_unknown_server_is_not_found() {
    let registry = ServerRegistry::new();
    assert!(matches!(
        registry.stop("ghost", false).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn worker_output_reaches_tcp_peer_byte_for_byte() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::tcp(
            "127.0.0.1",
            0,
            WorkerCommand::new("sh", ["-c", r"printf 'crlf\r\nbad\377byte\nok\n'"]),
        ))
        .await
        .expect("start");

    let mut stream = TcpStream::connect(("127.0.0.1", bound_port(&handle)))
        .await
        .expect("connect");
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut received))
        .await
        .expect("worker exit ends the stream")
        .expect("read");

    assert_eq!(received, b"crlf\r\nbad\xffbyte\nok\n");
    registry.stop_all(true).await;
}

#[tokio::test]
async fn close_handshake_through_server_waits_for_delayed_ack() {
    let script = r#"while read line; do if [ "$line" = "CLOSE" ]; then sleep 0.3; echo ACK; sleep 5; fi; done"#;
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::tcp("127.0.0.1", 0, WorkerCommand::new("sh", ["-c", script])))
        .await
        .expect("start");

    let (manager, mut rx) = client(bound_port(&handle)).await;
    assert!(wait_until(WAIT, || handle.connection_count() == 1).await);
    let pid = handle.connections()[0].worker_process_id.expect("pid");

    let matcher: AckMatcher = Box::new(|record: &str| record == "ACK");
    let started = Instant::now();
    manager
        .request_close(Some("CLOSE"), Some(matcher))
        .await
        .expect("close acknowledged");

    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("ACK"));
    assert_eq!(manager.state(), TransportState::Closed);

    assert!(wait_until(WAIT, || handle.connection_count() == 0).await);
    assert!(!pid_alive(pid));
    registry.stop_all(true).await;
}
