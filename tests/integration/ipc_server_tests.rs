//! IPC control-plane command dispatch.

use std::time::Duration;

use host_relay::ipc::server::{dispatch_command, handle_line, spawn_ipc_server, IpcRequest, IpcResponse};
use host_relay::server::{ServerRegistry, ServerSpec};
use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::GenericNamespaced;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{echo_worker, unique_pipe_name};

async fn registry_with_two_servers() -> ServerRegistry {
    let registry = ServerRegistry::new();
    registry
        .start(ServerSpec::tcp("127.0.0.1", 0, echo_worker()).with_name("raw"))
        .await
        .expect("tcp");
    registry
        .start(ServerSpec::websocket("127.0.0.1", 0, "/", echo_worker()).with_name("web"))
        .await
        .expect("websocket");
    registry
}

fn server_names(response: &IpcResponse) -> Vec<String> {
    response.data.as_ref().expect("data")["servers"]
        .as_array()
        .expect("servers array")
        .iter()
        .map(|s| s["name"].as_str().expect("name").to_owned())
        .collect()
}

#[tokio::test]
async fn list_returns_all_servers_sorted() {
    let registry = registry_with_two_servers().await;

    let response = handle_line(r#"{"command":"list"}"#, &registry).await;
    assert!(response.ok);
    assert_eq!(server_names(&response), vec!["raw", "web"]);

    registry.stop_all(true).await;
}

#[tokio::test]
async fn list_filters_by_kind() {
    let registry = registry_with_two_servers().await;

    let response = handle_line(r#"{"command":"list","kind":"websocket"}"#, &registry).await;
    assert!(response.ok);
    assert_eq!(server_names(&response), vec!["web"]);
    let first = &response.data.as_ref().expect("data")["servers"][0];
    assert_eq!(first["kind"], "websocket");
    assert_eq!(first["state"], "running");

    let bad = handle_line(r#"{"command":"list","kind":"carrier-pigeon"}"#, &registry).await;
    assert!(!bad.ok);

    registry.stop_all(true).await;
}

#[tokio::test]
async fn connections_reports_named_server() {
    let registry = registry_with_two_servers().await;

    let response = handle_line(r#"{"command":"connections","name":"raw"}"#, &registry).await;
    assert!(response.ok);
    let data = response.data.expect("data");
    assert_eq!(data["server"], "raw");
    assert_eq!(data["connections"].as_array().map(Vec::len), Some(0));

    let missing = handle_line(r#"{"command":"connections","name":"nope"}"#, &registry).await;
    assert!(!missing.ok);
    assert!(missing.error.expect("error").starts_with("not found"));

    let unnamed = handle_line(r#"{"command":"connections"}"#, &registry).await;
    assert!(!unnamed.ok);

    registry.stop_all(true).await;
}

#[tokio::test]
async fn stop_removes_server_and_returns_summary() {
    let registry = registry_with_two_servers().await;

    let request = IpcRequest {
        command: "stop".into(),
        name: Some("raw".into()),
        kind: None,
        force: Some(true),
    };
    let response = dispatch_command(&request, &registry).await;
    assert!(response.ok, "{:?}", response.error);
    let data = response.data.expect("data");
    assert_eq!(data["name"], "raw");
    assert_eq!(data["state"], "stopped");
    assert!(registry.get("raw").is_none());
    assert_eq!(registry.len(), 1);

    let again = dispatch_command(&request, &registry).await;
    assert!(!again.ok);

    registry.stop_all(true).await;
}

#[tokio::test]
async fn unknown_command_and_bad_json_are_errors() {
    let registry = ServerRegistry::new();

    let unknown = handle_line(r#"{"command":"reboot"}"#, &registry).await;
    assert!(!unknown.ok);
    assert_eq!(unknown.error.as_deref(), Some("unknown command: reboot"));

    let garbage = handle_line("not json", &registry).await;
    assert!(!garbage.ok);
    assert!(garbage.error.expect("error").starts_with("invalid json"));
}

#[tokio::test]
async fn socket_round_trip() {
    let registry = registry_with_two_servers().await;
    let ipc_name = unique_pipe_name("host-relay-ipc");
    let ct = CancellationToken::new();
    let task = spawn_ipc_server(&ipc_name, registry.clone(), ct.clone()).expect("ipc server");

    let name = ipc_name.as_str().to_ns_name::<GenericNamespaced>().expect("name");
    let stream = Stream::connect(name).await.expect("connect");
    let (reader, mut writer) = stream.split();
    writer
        .write_all(b"{\"command\":\"list\",\"kind\":\"tcp\"}\n")
        .await
        .expect("write");

    let mut lines = BufReader::new(reader).lines();
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("response in time")
        .expect("read")
        .expect("one line");
    let response: IpcResponse = serde_json::from_str(&line).expect("response json");
    assert!(response.ok);
    assert_eq!(server_names(&response), vec!["raw"]);

    ct.cancel();
    task.await.expect("ipc task");
    registry.stop_all(true).await;
}
