//! End-to-end tests for the srag-ml framed TCP server.
//!
//! These drive `srag_core::server::run` over a real loopback socket,
//! exercising the wire protocol exactly as a client would: connect, write a
//! length-prefixed JSON frame, read the length-prefixed JSON reply.

use serde_json::{json, Value};
use srag_core::config::{Provider, ServerConfig};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start_server(config: ServerConfig) -> (u16, tokio::sync::oneshot::Sender<()>, tokio::task::JoinHandle<srag_core::error::Result<()>>) {
    let port_file = config.port_file.clone();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        srag_core::server::run(config, async {
            let _ = stop_rx.await;
        })
        .await
    });

    // Poll the port file or just give the listener a moment to bind; a real
    // client would discover the port via --port-file.
    let port_file = port_file.expect("tests always configure a port file");
    let mut port = None;
    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(&port_file) {
            if let Ok(p) = contents.trim().parse::<u16>() {
                port = Some(p);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    (port.expect("server did not write its port file in time"), stop_tx, handle)
}

async fn rpc_call(port: u16, request: Value) -> Value {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let payload = serde_json::to_vec(&request).unwrap();
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
    stream.write_all(&payload).await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn test_config(dir: &tempfile::TempDir, auth_token: Option<String>) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        port_file: Some(dir.path().join("port")),
        models_dir: Some(dir.path().join("models")),
        auth_token,
        api_provider: Provider::Anthropic,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn ping_round_trip_echoes_id_and_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (port, stop_tx, handle) = start_server(test_config(&dir, None)).await;

    let resp = rpc_call(port, json!({"id": 1, "method": "ping", "params": {}})).await;
    assert_eq!(resp["id"], 1);
    assert_eq!(resp["result"]["status"], "ok");
    assert!(resp.get("error").is_none());

    stop_tx.send(()).ok();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_method_fails_bad_args_without_closing_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (port, stop_tx, handle) = start_server(test_config(&dir, None)).await;

    let resp = rpc_call(port, json!({"id": 2, "method": "frobnicate", "params": {}})).await;
    assert_eq!(resp["id"], 2);
    assert_eq!(resp["error"]["code"], -32603);

    // The connection-ending behavior only applies to frame-size violations,
    // not handler errors; a second call on a fresh connection still works.
    let resp2 = rpc_call(port, json!({"id": 3, "method": "ping", "params": {}})).await;
    assert_eq!(resp2["result"]["status"], "ok");

    stop_tx.send(()).ok();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn auth_token_rejects_requests_missing_the_exact_token() {
    let dir = tempfile::tempdir().unwrap();
    let (port, stop_tx, handle) = start_server(test_config(&dir, Some("sekret".to_string()))).await;

    let resp = rpc_call(port, json!({"id": 5, "method": "ping", "params": {}})).await;
    assert_eq!(resp["error"]["code"], -32600);

    let resp_wrong = rpc_call(
        port,
        json!({"id": 6, "method": "ping", "params": {}, "auth": "nope"}),
    )
    .await;
    assert_eq!(resp_wrong["error"]["code"], -32600);

    let resp_ok = rpc_call(
        port,
        json!({"id": 7, "method": "ping", "params": {}, "auth": "sekret"}),
    )
    .await;
    assert_eq!(resp_ok["result"]["status"], "ok");

    stop_tx.send(()).ok();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn embed_rejects_more_than_64_texts() {
    let dir = tempfile::tempdir().unwrap();
    let (port, stop_tx, handle) = start_server(test_config(&dir, None)).await;

    let texts: Vec<String> = (0..65).map(|i| format!("text {i}")).collect();
    let resp = rpc_call(port, json!({"id": 9, "method": "embed", "params": {"texts": texts}})).await;
    assert_eq!(resp["error"]["code"], -32603);

    stop_tx.send(()).ok();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn oversized_frame_closes_the_connection_without_a_reply() {
    let dir = tempfile::tempdir().unwrap();
    let (port, stop_tx, handle) = start_server(test_config(&dir, None)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let huge_len: u32 = 10 * 1024 * 1024 + 1;
    stream.write_all(&huge_len.to_be_bytes()).await.unwrap();

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "server must close the connection, not reply");

    stop_tx.send(()).ok();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_rpc_stops_the_accept_loop_and_removes_the_port_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, None);
    let port_file = config.port_file.clone().unwrap();
    let (port, _stop_tx, handle) = start_server(config).await;

    let resp = rpc_call(port, json!({"id": 10, "method": "shutdown", "params": {}})).await;
    assert_eq!(resp["result"]["status"], "shutting_down");

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not shut down in time")
        .unwrap()
        .unwrap();

    assert!(!port_file.exists(), "port file must be removed on clean shutdown");
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
