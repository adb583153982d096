use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use draw_rooms::{
    App, Config,
    identity::InstanceId,
    stats::StatsHandle,
    store::{BlobStore, KvStore, MemoryBlobStore, MemoryKvStore, StoreError, snapshot_key},
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode, header},
        protocol::Message,
    },
};
use yrs::{Doc, GetString, Text, Transact, Update, updates::decoder::Decode};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reads succeed, every write fails.
#[derive(Default)]
struct ReadOnlyKv(MemoryKvStore);

#[async_trait]
impl KvStore for ReadOnlyKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.0.get(key).await
    }

    async fn put_all(&self, _: Vec<(String, serde_json::Value)>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("read-only".into()))
    }
}

async fn start(blobs: Arc<dyn BlobStore>, kv: Arc<dyn KvStore>) -> (SocketAddr, StatsHandle) {
    let app = App::with_stores(Config::default(), blobs, kv).await.unwrap();
    let stats = app.state().stats.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { app.serve(listener).await });
    (addr, stats)
}

async fn start_in_memory() -> (SocketAddr, StatsHandle) {
    start(
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryKvStore::new()),
    )
    .await
}

async fn open(addr: SocketAddr, room_id: &str, session_id: &str) -> Socket {
    let url = format!("ws://{addr}/connect/{room_id}?sessionId={session_id}");
    let (socket, response) = connect_async(url).await.unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    socket
}

async fn next_binary(socket: &mut Socket) -> Vec<u8> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Binary(bytes) = message {
            return bytes.to_vec();
        }
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

fn text_update(content: &str) -> Vec<u8> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("drawing");
    let mut txn = doc.transact_mut();
    text.insert(&mut txn, 0, content);
    txn.encode_update_v1()
}

fn read_text(state: &[u8]) -> String {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("drawing");
    doc.transact_mut()
        .apply_update(Update::decode_v1(state).unwrap())
        .unwrap();
    text.get_string(&doc.transact())
}

#[tokio::test]
async fn upgrade_returns_101_and_initial_state() {
    let (addr, _) = start_in_memory().await;
    let mut socket = open(addr, "roomA", "s1").await;
    assert_eq!(read_text(&next_binary(&mut socket).await), "");
}

#[tokio::test]
async fn upgrade_from_allowed_origin_has_no_cors_headers() {
    let (addr, _) = start_in_memory().await;
    let mut request = format!("ws://{addr}/connect/roomA?sessionId=s1")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        header::ORIGIN,
        HeaderValue::from_static("https://m-draw-web.vercel.app"),
    );

    let (_socket, response) = connect_async(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert!(
        !response
            .headers()
            .keys()
            .any(|name| name.as_str().starts_with("access-control-"))
    );
}

#[tokio::test]
async fn missing_session_id_is_400() {
    let (addr, stats) = start_in_memory().await;
    match connect_async(format!("ws://{addr}/connect/roomA")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
        Err(e) => panic!("expected HTTP 400, got {e}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
    assert_eq!(stats.room_count("roomA").await.unwrap(), 0);
}

#[tokio::test]
async fn persistence_failure_still_upgrades() {
    let (addr, stats) = start(
        Arc::new(MemoryBlobStore::new()),
        Arc::new(ReadOnlyKv::default()),
    )
    .await;
    let _socket = open(addr, "roomA", "s1").await;
    // The write failed but the in-memory count stays applied.
    assert_eq!(stats.room_count("roomA").await.unwrap(), 1);
}

#[tokio::test]
async fn occupancy_follows_sockets() {
    let (addr, stats) = start_in_memory().await;
    let mut a = open(addr, "roomA", "s1").await;
    let _b = open(addr, "roomA", "s2").await;
    let _c = open(addr, "roomB", "s3").await;
    assert_eq!(stats.room_count("roomA").await.unwrap(), 2);
    assert_eq!(stats.room_count("roomB").await.unwrap(), 1);

    a.close(None).await.unwrap();
    eventually(|| {
        let stats = stats.clone();
        async move { stats.room_count("roomA").await.unwrap() == 1 }
    })
    .await;
    assert_eq!(stats.connected_total().await.unwrap(), 2);
}

#[tokio::test]
async fn updates_reach_other_sessions() {
    let (addr, _) = start_in_memory().await;
    let mut a = open(addr, "roomA", "s1").await;
    let mut b = open(addr, "roomA", "s2").await;
    next_binary(&mut a).await;
    next_binary(&mut b).await;

    let update = text_update("hello");
    a.send(Message::Binary(update.clone().into())).await.unwrap();
    assert_eq!(next_binary(&mut b).await, update);
}

#[tokio::test]
async fn reused_session_id_replaces_the_old_socket() {
    let (addr, stats) = start_in_memory().await;
    let mut old = open(addr, "roomA", "s1").await;
    next_binary(&mut old).await;
    let _new = open(addr, "roomA", "s1").await;

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = old.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "old socket was not closed");

    eventually(|| {
        let stats = stats.clone();
        async move { stats.room_count("roomA").await.unwrap() == 1 }
    })
    .await;
}

#[tokio::test]
async fn snapshot_survives_cold_restart() {
    let blobs = Arc::new(MemoryBlobStore::new());

    let (addr, _) = start(blobs.clone(), Arc::new(MemoryKvStore::new())).await;
    let mut socket = open(addr, "roomA", "s1").await;
    next_binary(&mut socket).await;
    socket
        .send(Message::Binary(text_update("sketch").into()))
        .await
        .unwrap();
    socket.close(None).await.unwrap();

    let key = snapshot_key(&InstanceId::room("roomA"));
    eventually(|| {
        let blobs = blobs.clone();
        let key = key.clone();
        async move {
            match blobs.get(&key).await.unwrap() {
                Some(blob) => read_text(&blob.data) == "sketch",
                None => false,
            }
        }
    })
    .await;

    let (restarted, _) = start(blobs, Arc::new(MemoryKvStore::new())).await;
    let mut socket = open(restarted, "roomA", "s2").await;
    assert_eq!(read_text(&next_binary(&mut socket).await), "sketch");
}
