//! # Live Sync Integration Tests
//!
//! Drives a real `ConnectionManager` against a local `tokio-tungstenite`
//! push server and checks fan-out, malformed frame handling, unsubscribe,
//! reconnect timing and the reconnect budget.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use lib_portdash::sync::connection::NORMAL_CLOSURE;
use lib_portdash::sync::{ConnectionManager, ConnectionState, MessageRouter, ReconnectPolicy};

/// What the mock server should do next on its current connection.
enum ServerCmd {
    Text(String),
    Close(u16),
    /// Drop the TCP stream without a close handshake.
    Drop,
}

struct PushServer {
    url: String,
    accepted: Arc<AtomicUsize>,
    cmds: mpsc::UnboundedSender<ServerCmd>,
}

impl PushServer {
    fn send(&self, cmd: ServerCmd) {
        self.cmds.send(cmd).unwrap();
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Serves WebSocket connections one at a time, driven by `ServerCmd`s.
async fn spawn_push_server() -> PushServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (cmds, mut rx) = mpsc::unbounded_channel();

    let count = accepted.clone();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let Ok(mut ws) = accept_async(tcp).await else {
                continue;
            };
            count.fetch_add(1, Ordering::SeqCst);

            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(ServerCmd::Text(text)) => {
                            if ws.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(ServerCmd::Close(code)) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: Utf8Bytes::from_static("server shutdown"),
                            };
                            let _ = ws.close(Some(frame)).await;
                        }
                        Some(ServerCmd::Drop) | None => break,
                    },
                    msg = ws.next() => {
                        if !matches!(msg, Some(Ok(_))) {
                            break;
                        }
                    }
                }
            }
        }
    });

    PushServer {
        url: format!("ws://{}/ws", addr),
        accepted,
        cmds,
    }
}

fn frame(kind: &str, data: Value) -> String {
    json!({"type": kind, "data": data, "timestamp": "2024-05-01T12:00:00Z"}).to_string()
}

fn manager(url: &str, delay_ms: u64, max_attempts: u32) -> (ConnectionManager, Arc<MessageRouter>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let router = Arc::new(MessageRouter::new());
    let policy = ReconnectPolicy {
        delay: Duration::from_millis(delay_ms),
        max_attempts,
    };
    (ConnectionManager::new(url, policy, router.clone()), router)
}

async fn wait_state(m: &ConnectionManager, want: ConnectionState) {
    let mut states = m.watch_state();
    timeout(Duration::from_secs(5), states.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", want))
        .unwrap();
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no delivery")
        .expect("listener channel closed")
}

fn channel_listener(router: &MessageRouter, resource: &str) -> (lib_portdash::Subscription, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = router.subscribe_fn(resource, move |data: &Value| {
        let _ = tx.send(data.clone());
    });
    (sub, rx)
}

#[tokio::test]
async fn test_account_update_reaches_every_listener() {
    let server = spawn_push_server().await;
    let (m, router) = manager(&server.url, 50, 3);
    let (_a, mut rx_a) = channel_listener(&router, "accounts");
    let (_b, mut rx_b) = channel_listener(&router, "accounts");
    let (_c, mut rx_c) = channel_listener(&router, "containers");

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    server.send(ServerCmd::Text(frame("account_update", json!({"account_id": "DU1"}))));

    assert_eq!(recv(&mut rx_a).await, json!({"account_id": "DU1"}));
    assert_eq!(recv(&mut rx_b).await, json!({"account_id": "DU1"}));
    assert!(rx_c.try_recv().is_err());

    m.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let server = spawn_push_server().await;
    let (m, router) = manager(&server.url, 50, 3);
    let (_sub, mut rx) = channel_listener(&router, "system_status");

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    server.send(ServerCmd::Text("{not json".to_string()));
    server.send(ServerCmd::Text(frame("error", json!({"message": "boom"}))));
    server.send(ServerCmd::Text(frame("system_status", json!({"cpu": 12}))));

    // Only the well-formed, mapped frame is delivered.
    assert_eq!(recv(&mut rx).await, json!({"cpu": 12}));
    assert!(rx.try_recv().is_err());
    assert_eq!(m.state(), ConnectionState::Open);
    assert_eq!(server.accepted(), 1);

    m.shutdown().await;
}

#[tokio::test]
async fn test_frames_delivered_in_order() {
    let server = spawn_push_server().await;
    let (m, router) = manager(&server.url, 50, 3);
    let (_sub, mut rx) = channel_listener(&router, "containers");

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    for i in 0..5 {
        server.send(ServerCmd::Text(frame("container_status", json!({"name": "svc", "seq": i}))));
    }

    for i in 0..5 {
        assert_eq!(recv(&mut rx).await["seq"], json!(i));
    }

    m.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = spawn_push_server().await;
    let (m, router) = manager(&server.url, 50, 3);
    let (first, mut rx_first) = channel_listener(&router, "accounts");
    let (_second, mut rx_second) = channel_listener(&router, "accounts");

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    server.send(ServerCmd::Text(frame("account_update", json!({"account_id": "DU1"}))));
    recv(&mut rx_first).await;
    recv(&mut rx_second).await;

    first.unsubscribe();
    server.send(ServerCmd::Text(frame("account_update", json!({"account_id": "DU2"}))));

    assert_eq!(recv(&mut rx_second).await, json!({"account_id": "DU2"}));
    assert!(rx_first.try_recv().is_err());

    m.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_abnormal_close_with_fixed_delay() {
    let server = spawn_push_server().await;
    let (m, router) = manager(&server.url, 300, 5);
    let (_sub, mut rx) = channel_listener(&router, "accounts");

    m.connect();
    wait_state(&m, ConnectionState::Open).await;

    let dropped_at = Instant::now();
    server.send(ServerCmd::Drop);
    wait_state(&m, ConnectionState::Closed).await;
    assert_eq!(m.attempts(), 1);

    wait_state(&m, ConnectionState::Open).await;
    assert!(dropped_at.elapsed() >= Duration::from_millis(300));
    assert_eq!(m.attempts(), 0);
    wait_until("second handshake", || server.accepted() == 2).await;

    // The new socket delivers like the old one.
    server.send(ServerCmd::Text(frame("account_update", json!({"account_id": "DU9"}))));
    assert_eq!(recv(&mut rx).await, json!({"account_id": "DU9"}));

    m.shutdown().await;
}

#[tokio::test]
async fn test_non_normal_disconnect_reconnects() {
    let server = spawn_push_server().await;
    let (m, _router) = manager(&server.url, 50, 5);

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    m.disconnect(4000);
    assert_eq!(m.state(), ConnectionState::Closing);

    wait_until("reconnect", || server.accepted() == 2).await;
    wait_state(&m, ConnectionState::Open).await;

    m.shutdown().await;
}

#[tokio::test]
async fn test_intentional_disconnect_does_not_reconnect() {
    let server = spawn_push_server().await;
    let (m, _router) = manager(&server.url, 50, 5);

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    timeout(Duration::from_secs(5), m.shutdown()).await.expect("shutdown hangs");

    sleep(Duration::from_millis(300)).await;
    assert_eq!(m.state(), ConnectionState::Closed);
    assert_eq!(server.accepted(), 1);
    assert_eq!(m.attempts(), 0);
}

#[tokio::test]
async fn test_server_normal_close_does_not_reconnect() {
    let server = spawn_push_server().await;
    let (m, _router) = manager(&server.url, 50, 5);

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    server.send(ServerCmd::Close(NORMAL_CLOSURE));
    wait_state(&m, ConnectionState::Closed).await;

    sleep(Duration::from_millis(300)).await;
    assert_eq!(m.state(), ConnectionState::Closed);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_server_abnormal_close_code_reconnects() {
    let server = spawn_push_server().await;
    let (m, _router) = manager(&server.url, 50, 5);

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    server.send(ServerCmd::Close(1011));

    wait_until("reconnect", || server.accepted() == 2).await;
    wait_state(&m, ConnectionState::Open).await;

    m.shutdown().await;
}

#[tokio::test]
async fn test_stops_after_max_attempts() {
    // Accepts TCP and hangs up before the handshake, so every attempt fails.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            drop(tcp);
        }
    });

    let (m, _router) = manager(&url, 30, 3);
    m.connect();
    wait_until("budget exhausted", || m.is_exhausted()).await;

    // Initial attempt plus three reconnects, then nothing.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 4);
    assert_eq!(m.attempts(), 3);
    assert_eq!(m.state(), ConnectionState::Closed);

    // A manual connect starts a fresh budget.
    m.connect();
    assert!(!m.is_exhausted());
    wait_until("second budget exhausted", || m.is_exhausted()).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_connect_is_idempotent_while_connecting_or_open() {
    let server = spawn_push_server().await;
    let (m, _router) = manager(&server.url, 50, 3);

    m.connect();
    m.connect();
    assert_eq!(m.state(), ConnectionState::Connecting);
    wait_state(&m, ConnectionState::Open).await;

    m.connect();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(m.state(), ConnectionState::Open);
    assert_eq!(server.accepted(), 1);

    m.shutdown().await;
}

#[tokio::test]
async fn test_manual_connect_replaces_pending_reconnect() {
    let server = spawn_push_server().await;
    let (m, _router) = manager(&server.url, 400, 5);

    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    server.send(ServerCmd::Drop);
    wait_state(&m, ConnectionState::Closed).await;
    assert_eq!(m.attempts(), 1);

    // Reconnect timer is pending; connect now instead.
    m.connect();
    wait_state(&m, ConnectionState::Open).await;
    wait_until("manual handshake", || server.accepted() == 2).await;

    // Well past the reconnect delay: the cancelled timer opened nothing.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(server.accepted(), 2);
    assert_eq!(m.state(), ConnectionState::Open);
    assert_eq!(m.attempts(), 0);

    m.shutdown().await;
}

#[test]
fn test_release_profile_unwinds_listener_panics() {
    let manifest = include_str!("../../Cargo.toml");
    let release = manifest.split("[profile.release]").nth(1).unwrap_or_default();
    let release = release.split("\n[").next().unwrap_or_default();
    assert!(
        !release
            .lines()
            .any(|l| l.trim_start().starts_with("panic") && l.contains("abort")),
        "listener isolation relies on unwinding"
    );
}
