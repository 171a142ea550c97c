//! WebSocket client transport and WebSocket listener.

#![cfg(unix)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use host_relay::server::{ServerRegistry, ServerSpec};
use host_relay::models::transport::TransportState;
use host_relay::transport::{ChannelConnectionInfo, TransportManager, TransportOptions};
use host_relay::AppError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::test_helpers::{bound_port, collecting_callback, echo_worker, next_record, pid_alive, wait_until};

const WAIT: Duration = Duration::from_secs(5);

async fn next_text<S>(stream: &mut S) -> Option<String>
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match tokio::time::timeout(WAIT, stream.next()).await.ok()?? {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

#[tokio::test]
async fn client_round_trip_through_server() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::websocket("127.0.0.1", 0, "/relay", echo_worker()).with_name("ws-echo"))
        .await
        .expect("start");
    let uri = format!("ws://127.0.0.1:{}/relay", bound_port(&handle));

    let info = ChannelConnectionInfo::websocket(uri).expect("info");
    let (callback, mut rx) = collecting_callback();
    let manager = TransportManager::connect(&info, TransportOptions::default(), callback)
        .await
        .expect("connect");

    manager.send("alpha").await.expect("send");
    manager.send("beta").await.expect("send");
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("alpha"));
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("beta"));
    assert!(wait_until(WAIT, || handle.connection_count() == 1).await);

    let pid = handle.connections()[0].worker_process_id.expect("pid");
    manager.cleanup().await;
    assert!(wait_until(WAIT, || handle.connection_count() == 0).await);
    assert!(!pid_alive(pid));

    registry.stop_all(true).await;
}

#[tokio::test]
async fn server_reassembles_record_split_across_frames() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::websocket("127.0.0.1", 0, "/", echo_worker()))
        .await
        .expect("start");
    let uri = format!("ws://127.0.0.1:{}/", bound_port(&handle));

    let (mut socket, _) = tokio_tungstenite::connect_async(uri).await.expect("connect");
    socket.send(Message::Text("hel".into())).await.expect("send");
    socket.send(Message::Text("lo\nwor".into())).await.expect("send");
    socket.send(Message::Text("ld\n".into())).await.expect("send");

    assert_eq!(next_text(&mut socket).await.as_deref(), Some("hello\n"));
    assert_eq!(next_text(&mut socket).await.as_deref(), Some("world\n"));

    socket.close(None).await.ok();
    registry.stop_all(true).await;
}

#[tokio::test]
async fn client_reassembles_records_split_across_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut socket = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        for frame in ["par", "tial\nsec", "ond\n"] {
            socket.send(Message::Text(frame.into())).await.expect("send");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let info = ChannelConnectionInfo::websocket(format!("ws://127.0.0.1:{port}/")).expect("info");
    let (callback, mut rx) = collecting_callback();
    let manager = TransportManager::connect(&info, TransportOptions::default(), callback)
        .await
        .expect("connect");

    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("partial"));
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("second"));

    manager.cleanup().await;
    server.await.expect("server task");
}

#[tokio::test]
async fn full_server_answers_503_before_upgrade() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(
            ServerSpec::websocket("127.0.0.1", 0, "/", echo_worker())
                .with_name("ws-limited")
                .with_max_connections(1),
        )
        .await
        .expect("start");
    let uri = format!("ws://127.0.0.1:{}/", bound_port(&handle));

    let (mut first, _) = tokio_tungstenite::connect_async(uri.as_str()).await.expect("first");
    first.send(Message::Text("ping\n".into())).await.expect("send");
    assert_eq!(next_text(&mut first).await.as_deref(), Some("ping\n"));

    match tokio_tungstenite::connect_async(uri.as_str()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 503),
        other => panic!("expected 503 rejection, got {:?}", other.map(|_| ())),
    }
    assert_eq!(handle.connection_count(), 1);

    first.close(None).await.ok();
    assert!(wait_until(WAIT, || handle.connection_count() == 0).await);
    let (second, _) = tokio_tungstenite::connect_async(uri.as_str())
        .await
        .expect("slot freed");
    drop(second);

    registry.stop_all(true).await;
}

#[tokio::test]
async fn unknown_path_is_not_upgraded() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(ServerSpec::websocket("127.0.0.1", 0, "/psrp", echo_worker()))
        .await
        .expect("start");
    let uri = format!("ws://127.0.0.1:{}/elsewhere", bound_port(&handle));

    match tokio_tungstenite::connect_async(uri).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 404),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }
    registry.stop_all(true).await;
}

#[tokio::test]
async fn handshake_against_silent_listener_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let info = ChannelConnectionInfo::websocket(format!("ws://127.0.0.1:{port}/")).expect("info");
    let manager = TransportManager::new(TransportOptions {
        open_timeout: Some(Duration::from_millis(300)),
        ..TransportOptions::default()
    });
    let (callback, _rx) = collecting_callback();

    let started = std::time::Instant::now();
    let result = manager.open(&info, callback).await;

    assert!(matches!(result, Err(AppError::ConnectTimeout(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    drop(listener);
}

#[tokio::test]
async fn secure_scheme_runs_tls_handshake() {
    // A plain-text peer: the TLS handshake must fail, not be skipped.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut hello = [0_u8; 5];
        stream.read_exact(&mut hello).await.expect("client hello");
        stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
            .await
            .ok();
        hello
    });

    let info = ChannelConnectionInfo::websocket(format!("wss://127.0.0.1:{port}/")).expect("info");
    let (callback, _rx) = collecting_callback();
    let result = TransportManager::connect(&info, TransportOptions::default(), callback).await;

    assert!(matches!(result, Err(AppError::ConnectRefused(_))), "got {:?}", result.err());
    let hello = server.await.expect("server task");
    // TLS record header: handshake content type.
    assert_eq!(hello[0], 0x16);
}

#[tokio::test]
async fn secure_handshake_against_silent_listener_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let info = ChannelConnectionInfo::websocket(format!("wss://127.0.0.1:{port}/")).expect("info");
    let manager = TransportManager::new(TransportOptions {
        open_timeout: Some(Duration::from_millis(300)),
        ..TransportOptions::default()
    });
    let (callback, _rx) = collecting_callback();

    let started = std::time::Instant::now();
    let result = manager.open(&info, callback).await;

    assert!(matches!(result, Err(AppError::ConnectTimeout(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    drop(listener);
}

#[tokio::test]
async fn client_at_connection_limit_gets_admission_rejected() {
    let registry = ServerRegistry::new();
    let handle = registry
        .start(
            ServerSpec::websocket("127.0.0.1", 0, "/", echo_worker())
                .with_name("ws-admission")
                .with_max_connections(1),
        )
        .await
        .expect("start");
    let info =
        ChannelConnectionInfo::websocket(format!("ws://127.0.0.1:{}/", bound_port(&handle))).expect("info");

    let (callback, mut rx) = collecting_callback();
    let first = TransportManager::connect(&info, TransportOptions::default(), callback)
        .await
        .expect("first connect");
    first.send("ping").await.expect("send");
    assert_eq!(next_record(&mut rx, WAIT).await.as_deref(), Some("ping"));

    let (callback, _rx) = collecting_callback();
    let second = TransportManager::new(TransportOptions::default());
    let result = second.open(&info, callback).await;
    assert!(
        matches!(result, Err(AppError::AdmissionRejected(_))),
        "got {:?}",
        result.err()
    );
    assert_eq!(second.state(), TransportState::Broken);
    assert_eq!(handle.connection_count(), 1);

    first.cleanup().await;
    registry.stop_all(true).await;
}
