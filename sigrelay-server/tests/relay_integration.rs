//! End-to-end relay tests over real WebSocket connections.
//!
//! Each test binds a relay on an ephemeral port, connects producer/consumer
//! sessions with `tokio-tungstenite`, and drives the wire protocol directly.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use sigrelay_server::{RelayConfig, RelayCore, RelayServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PRODUCER_TOKEN: &str = "it-producer-token";
const CONSUMER_TOKEN: &str = "it-consumer-token";

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

async fn start_relay(request_timeout: Duration) -> (SocketAddr, RelayCore) {
    let config = RelayConfig::new()
        .bind("127.0.0.1:0".parse().unwrap())
        .with_tokens(PRODUCER_TOKEN, CONSUMER_TOKEN)
        .with_request_timeout(request_timeout);

    let server = RelayServer::bind(config).await.expect("bind relay");
    let addr = server.local_addr().expect("local addr");
    let core = server.core();
    tokio::spawn(server.serve());
    (addr, core)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("connect to relay");
    ws
}

async fn send_json(ws: &mut Ws, v: Value) {
    ws.send(Message::Text(v.to_string().into()))
        .await
        .expect("send frame");
}

/// Receive the next JSON text frame, skipping keepalive control frames.
async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Assert that no text frame arrives within `window`.
async fn assert_silent(ws: &mut Ws, window: Duration) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return,
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => panic!("unexpected frame: {}", text),
                Some(Ok(_)) => continue,
                _ => return,
            },
        }
    }
}

/// Connect and authenticate with the given role/token.
async fn authed(addr: SocketAddr, role: &str, token: &str) -> Ws {
    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({"type": "auth", "role": role, "token": token})).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "auth_ok");
    assert_eq!(ack["role"], role);
    ws
}

async fn producer(addr: SocketAddr) -> Ws {
    authed(addr, "producer", PRODUCER_TOKEN).await
}

async fn consumer(addr: SocketAddr) -> Ws {
    authed(addr, "consumer", CONSUMER_TOKEN).await
}

/// Wait for the close frame and return its code.
async fn recv_close_code(ws: &mut Ws) -> u16 {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without close");
        match msg {
            Ok(Message::Close(Some(frame))) => return frame.code.into(),
            Ok(Message::Close(None)) => panic!("close frame without code"),
            Ok(_) => continue,
            Err(e) => panic!("websocket error before close: {}", e),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Authentication
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn auth_grants_roles() {
    let (addr, core) = start_relay(Duration::from_secs(5)).await;

    let _producer = producer(addr).await;
    let _consumer = consumer(addr).await;

    // Registration is visible through the core once the handshake completed.
    wait_until(|| core.consumer_count() == 1).await;
    assert!(core.producer_connected().await);
}

#[tokio::test]
async fn auth_rejects_bad_token_with_distinct_code() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;

    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        json!({"type": "auth", "role": "consumer", "token": "wrong"}),
    )
    .await;
    assert_eq!(recv_close_code(&mut ws).await, 4002);
}

#[tokio::test]
async fn auth_rejects_non_auth_first_frame() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;

    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({"type": "get", "resource": "trades"})).await;
    assert_eq!(recv_close_code(&mut ws).await, 4001);
}

#[tokio::test]
async fn auth_rejects_invalid_json() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;

    let mut ws = connect(addr).await;
    ws.send(Message::Text("definitely not json".into()))
        .await
        .expect("send frame");
    assert_eq!(recv_close_code(&mut ws).await, 4000);
}

// ════════════════════════════════════════════════════════════════════
// Request routing
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn get_without_producer_yields_offline_error() {
    let (addr, core) = start_relay(Duration::from_secs(5)).await;
    let mut consumer = consumer(addr).await;

    send_json(
        &mut consumer,
        json!({"type": "get", "resource": "trades", "params": {}, "request_id": "r1"}),
    )
    .await;

    let resp = recv_json(&mut consumer).await;
    assert_eq!(resp["type"], "response");
    assert_eq!(resp["request_id"], "r1");
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["error"], "producer_offline");
    assert_eq!(core.pending_count(), 0);
}

#[tokio::test]
async fn roundtrip_delivers_producer_payload_verbatim() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;
    let mut producer = producer(addr).await;
    let mut consumer = consumer(addr).await;

    send_json(
        &mut consumer,
        json!({"type": "get", "resource": "probabilities", "params": {"limit": 5}, "request_id": "r1"}),
    )
    .await;

    let req = recv_json(&mut producer).await;
    assert_eq!(req["type"], "request");
    assert_eq!(req["request_id"], "r1");
    assert_eq!(req["resource"], "probabilities");
    assert_eq!(req["params"]["limit"], 5);

    // Fields the relay does not model must survive forwarding.
    let answer = json!({
        "type": "response",
        "request_id": "r1",
        "status": "ok",
        "data": [{"ts": 1700000000, "prob_long": 0.61}],
        "source": "live_signals",
    });
    send_json(&mut producer, answer.clone()).await;

    let resp = recv_json(&mut consumer).await;
    assert_eq!(resp, answer);
}

#[tokio::test]
async fn resolver_error_is_forwarded_unchanged() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;
    let mut producer = producer(addr).await;
    let mut consumer = consumer(addr).await;

    send_json(
        &mut consumer,
        json!({"type": "get", "resource": "bogus", "request_id": "r2"}),
    )
    .await;

    let req = recv_json(&mut producer).await;
    assert_eq!(req["resource"], "bogus");

    send_json(
        &mut producer,
        json!({"type": "response", "request_id": "r2", "status": "error", "error": "unknown_resource"}),
    )
    .await;

    let resp = recv_json(&mut consumer).await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["error"], "unknown_resource");
}

#[tokio::test]
async fn server_assigns_request_id_when_absent() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;
    let mut producer = producer(addr).await;
    let mut consumer = consumer(addr).await;

    send_json(&mut consumer, json!({"type": "get", "resource": "trades"})).await;

    let req = recv_json(&mut producer).await;
    let id = req["request_id"].as_str().expect("assigned id").to_string();
    assert!(!id.is_empty());

    send_json(
        &mut producer,
        json!({"type": "response", "request_id": id, "status": "ok", "data": []}),
    )
    .await;

    let resp = recv_json(&mut consumer).await;
    assert_eq!(resp["request_id"].as_str(), Some(id.as_str()));
}

// ════════════════════════════════════════════════════════════════════
// Timeout supervision
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn silent_producer_yields_exactly_one_timeout_error() {
    let (addr, core) = start_relay(Duration::from_millis(300)).await;
    let mut producer = producer(addr).await;
    let mut consumer = consumer(addr).await;

    send_json(
        &mut consumer,
        json!({"type": "get", "resource": "trades", "request_id": "slow"}),
    )
    .await;
    let _req = recv_json(&mut producer).await;

    let resp = recv_json(&mut consumer).await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["error"], "timeout");
    assert_eq!(resp["request_id"], "slow");
    assert_eq!(core.pending_count(), 0);

    // A late answer must not reach the consumer a second time.
    send_json(
        &mut producer,
        json!({"type": "response", "request_id": "slow", "status": "ok", "data": []}),
    )
    .await;
    assert_silent(&mut consumer, Duration::from_millis(500)).await;
}

#[tokio::test]
async fn response_for_unknown_id_has_no_observable_effect() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;
    let mut producer = producer(addr).await;
    let mut consumer = consumer(addr).await;

    send_json(
        &mut producer,
        json!({"type": "response", "request_id": "never-issued", "status": "ok", "data": []}),
    )
    .await;
    assert_silent(&mut consumer, Duration::from_millis(300)).await;

    // The relay keeps working afterwards.
    send_json(
        &mut consumer,
        json!({"type": "get", "resource": "trades", "request_id": "after"}),
    )
    .await;
    let req = recv_json(&mut producer).await;
    assert_eq!(req["request_id"], "after");
}

// ════════════════════════════════════════════════════════════════════
// Producer replacement
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reconnecting_producer_supersedes_the_old_one() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;
    let mut old_producer = producer(addr).await;
    let mut new_producer = producer(addr).await;
    let mut consumer = consumer(addr).await;

    send_json(
        &mut consumer,
        json!({"type": "get", "resource": "trades", "request_id": "r5"}),
    )
    .await;

    // Only the new producer is a forwarding target.
    let req = recv_json(&mut new_producer).await;
    assert_eq!(req["request_id"], "r5");
    assert_silent(&mut old_producer, Duration::from_millis(300)).await;

    // A late answer from the superseded producer is treated as unknown.
    send_json(
        &mut old_producer,
        json!({"type": "response", "request_id": "r5", "status": "ok", "data": ["stale"]}),
    )
    .await;
    assert_silent(&mut consumer, Duration::from_millis(300)).await;

    send_json(
        &mut new_producer,
        json!({"type": "response", "request_id": "r5", "status": "ok", "data": ["fresh"]}),
    )
    .await;
    let resp = recv_json(&mut consumer).await;
    assert_eq!(resp["data"][0], "fresh");
}

// ════════════════════════════════════════════════════════════════════
// Disconnect cleanup
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn consumer_disconnect_abandons_outstanding_requests() {
    let (addr, core) = start_relay(Duration::from_secs(10)).await;
    let mut producer = producer(addr).await;
    let mut consumer = consumer(addr).await;

    send_json(
        &mut consumer,
        json!({"type": "get", "resource": "trades", "request_id": "orphan"}),
    )
    .await;
    let _req = recv_json(&mut producer).await;
    assert_eq!(core.pending_count(), 1);

    consumer.close(None).await.expect("close consumer");
    wait_until(|| core.pending_count() == 0).await;
    wait_until(|| core.consumer_count() == 0).await;
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_session() {
    let (addr, _core) = start_relay(Duration::from_secs(5)).await;
    let mut producer = producer(addr).await;
    let mut consumer = consumer(addr).await;

    // Garbage and unknown message types are discarded without closing.
    consumer
        .send(Message::Text("not json at all".into()))
        .await
        .expect("send frame");
    send_json(&mut consumer, json!({"type": "subscribe", "topics": ["x"]})).await;

    send_json(
        &mut consumer,
        json!({"type": "get", "resource": "trades", "request_id": "still-alive"}),
    )
    .await;
    let req = recv_json(&mut producer).await;
    assert_eq!(req["request_id"], "still-alive");
}

// ════════════════════════════════════════════════════════════════════
// Health endpoint
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn health_endpoint_reports_status() {
    let (addr, core) = start_relay(Duration::from_secs(5)).await;
    let _producer = producer(addr).await;
    assert!(core.producer_connected().await);

    let mut stream = TcpStream::connect(addr).await.expect("connect health");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: relay\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");

    let mut body = String::new();
    stream
        .read_to_string(&mut body)
        .await
        .expect("read response");

    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body.contains("\"status\":\"ok\""));
    assert!(body.contains("\"producer_connected\":true"));
}

// ════════════════════════════════════════════════════════════════════
// Polling helper
// ════════════════════════════════════════════════════════════════════

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..40 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 2s");
}
