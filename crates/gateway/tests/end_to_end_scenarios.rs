#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Drives the gateway over real WebSocket connections against an in-process
//! server, the same harness shape as the teacher's `chat_ui.rs`
//! (`start_test_server` + `tokio_tungstenite::connect_async`). Covers the
//! happy path, capability denial, the channel cap, the rate limit, and
//! graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use mycelium_auth::{ApiKeyRecord, ApiKeyStore};
use mycelium_bus::Bus;
use mycelium_gateway::hub::Hub;
use mycelium_gateway::router::{self, AppState};
use mycelium_store::{CounterStore, SqliteApiKeyStore};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct FakeCounters {
    values: Mutex<HashMap<String, i64>>,
}

impl FakeCounters {
    async fn snapshot(&self) -> HashMap<String, i64> {
        self.values.lock().await.clone()
    }
}

#[async_trait]
impl CounterStore for FakeCounters {
    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        let mut v = self.values.lock().await;
        let e = v.entry(key.to_string()).or_insert(0);
        *e += 1;
        Ok(*e)
    }

    async fn decr(&self, key: &str) -> anyhow::Result<i64> {
        let mut v = self.values.lock().await;
        let e = v.entry(key.to_string()).or_insert(0);
        *e -= 1;
        Ok(*e)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.values.lock().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.values.lock().await.remove(key);
        Ok(())
    }

    async fn set_if_greater(&self, key: &str, value: i64) -> anyhow::Result<()> {
        let mut v = self.values.lock().await;
        let e = v.entry(key.to_string()).or_insert(i64::MIN);
        if *e < value {
            *e = value;
        }
        Ok(())
    }
}

/// In-process bus backed by a broadcast channel, good enough to exercise
/// publish fan-out without a real NATS server.
struct FakeBus {
    tx: broadcast::Sender<Bytes>,
}

impl FakeBus {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }
}

#[async_trait]
impl Bus for FakeBus {
    async fn publish(&self, _subject: &str, payload: Bytes) -> anyhow::Result<()> {
        let _ = self.tx.send(payload);
        Ok(())
    }

    async fn subscribe(&self, _subject: &str) -> anyhow::Result<Pin<Box<dyn Stream<Item = Bytes> + Send>>> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|r| async { r.ok() });
        Ok(Box::pin(stream))
    }
}

struct TestServer {
    addr: SocketAddr,
    hub: Arc<Hub>,
    counters: Arc<FakeCounters>,
    shutdown_tx: watch::Sender<bool>,
}

async fn start_test_server() -> TestServer {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    SqliteApiKeyStore::init(&pool).await.unwrap();
    let store = SqliteApiKeyStore::new(pool);
    store
        .upsert(&ApiKeyRecord {
            id: "key1".to_string(),
            secret: "secret1".to_string(),
            capabilities: serde_json::json!({"*": "subscribe,publish"}).to_string(),
            app_id: "app1".to_string(),
        })
        .await
        .unwrap();
    store
        .upsert(&ApiKeyRecord {
            id: "key2".to_string(),
            secret: "secret2".to_string(),
            capabilities: serde_json::json!({"*": "subscribe"}).to_string(),
            app_id: "app1".to_string(),
        })
        .await
        .unwrap();
    let api_key_store: Arc<dyn ApiKeyStore> = Arc::new(store);

    let counters = Arc::new(FakeCounters::default());
    let hub = Arc::new(Hub::new(Arc::clone(&counters) as Arc<dyn CounterStore>));
    let bus: Arc<dyn Bus> = Arc::new(FakeBus::new());

    tokio::spawn(mycelium_gateway::bus_relay::run(Arc::clone(&bus), Arc::clone(&hub)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState {
        hub: Arc::clone(&hub),
        api_key_store,
        bus,
        shutdown: shutdown_rx,
    };
    let app = router::build(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
    });

    TestServer {
        addr,
        hub,
        counters,
        shutdown_tx,
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    let msg = ws.next().await.expect("stream ended").expect("ws error");
    let text = msg.into_text().expect("expected a text frame");
    serde_json::from_str(&text).expect("expected a JSON frame")
}

async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.expect("send failed");
}

#[tokio::test]
async fn s1_happy_path_subscribe_then_publish_success() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/realtime?key=key1:secret1", server.addr))
        .await
        .expect("ws connect failed");

    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["t"], "hello");
    assert!(hello["d"]["sid"].is_string());

    send_json(&mut ws, serde_json::json!({"t": "subscribe", "d": {"s": 1, "c": "room"}})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["t"], "subscribe_success");
    assert_eq!(reply["d"]["s"], 1);

    let counters = server.counters.snapshot().await;
    assert_eq!(counters.get("subscribers:app1:room"), Some(&1));

    ws.close(None).await.ok();
}

#[tokio::test]
async fn s3_capability_denial_on_publish() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/realtime?key=key2:secret2", server.addr))
        .await
        .expect("ws connect failed");
    let _hello = recv_json(&mut ws).await;

    send_json(&mut ws, serde_json::json!({"t": "subscribe", "d": {"s": 1, "c": "room"}})).await;
    let sub_reply = recv_json(&mut ws).await;
    assert_eq!(sub_reply["t"], "subscribe_success");

    send_json(
        &mut ws,
        serde_json::json!({"t": "publish", "d": {"s": 2, "ip": false, "c": "room", "e": "msg", "d": {}}}),
    )
    .await;
    let err = recv_json(&mut ws).await;
    assert_eq!(err["t"], "error");
    assert_eq!(err["d"]["s"], 2);
    assert_eq!(err["d"]["r"], "you're not allowed to publish messages on the channel room");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn s4_channel_cap_rejects_the_501st_subscription() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/realtime?key=key1:secret1", server.addr))
        .await
        .expect("ws connect failed");
    let hello = recv_json(&mut ws).await;
    let session_id = hello["d"]["sid"].as_str().expect("sid").to_string();

    for i in 0..mycelium_protocol::MAX_CHANNELS {
        assert!(server.hub.subscribe(&session_id, &format!("app1:chan{i}")).await);
    }
    assert_eq!(server.hub.channel_count_of(&session_id).await, mycelium_protocol::MAX_CHANNELS);

    send_json(&mut ws, serde_json::json!({"t": "subscribe", "d": {"s": 1, "c": "one-too-many"}})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["t"], "error");
    assert_eq!(reply["d"]["s"], 1);
    assert_eq!(reply["d"]["r"], "you can't subscribe to more than 500 channels");
    assert_eq!(server.hub.channel_count_of(&session_id).await, mycelium_protocol::MAX_CHANNELS);

    ws.close(None).await.ok();
}

#[tokio::test]
async fn s5_rate_limit_closes_before_the_eleventh_reply() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/realtime?key=key1:secret1", server.addr))
        .await
        .expect("ws connect failed");
    let _hello = recv_json(&mut ws).await;

    for i in 0..10 {
        send_json(&mut ws, serde_json::json!({"t": "subscribe", "d": {"s": i, "c": format!("room{i}")}})).await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["t"], "subscribe_success");
    }

    send_json(&mut ws, serde_json::json!({"t": "subscribe", "d": {"s": 10, "c": "room10"}})).await;

    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for rate-limit close")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4029),
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn s6_shutdown_closes_connections_and_reconciles_counters() {
    let server = start_test_server().await;

    let mut sockets = Vec::new();
    for _ in 0..2 {
        let (mut ws, _) = connect_async(format!("ws://{}/realtime?key=key1:secret1", server.addr))
            .await
            .expect("ws connect failed");
        let _hello = recv_json(&mut ws).await;
        send_json(&mut ws, serde_json::json!({"t": "subscribe", "d": {"s": 1, "c": "room"}})).await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["t"], "subscribe_success");
        sockets.push(ws);
    }

    {
        let counters = server.counters.snapshot().await;
        assert_eq!(counters.get("subscribers:app1:room"), Some(&2));
        assert_eq!(counters.get("current-clients:app1"), Some(&2));
    }

    server.shutdown_tx.send(true).expect("no connections listening for shutdown");

    for ws in &mut sockets {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for shutdown close")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4009);
                assert_eq!(frame.reason, "please reconnect");
            },
            other => panic!("expected a close frame, got {other:?}"),
        }
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while server.hub.client_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connections never finished disconnecting after the shutdown signal");

    let counters = server.counters.snapshot().await;
    assert!(!counters.contains_key("subscribers:app1:room"));
    assert!(!counters.contains_key("current-clients:app1"));
}
