use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    signal::ctrl_c,
    sync::{Mutex, watch},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use url::Url;
use yrs::{Doc, GetString, Text, Transact, Update, updates::decoder::Decode};

type WsWriter = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const DEFAULT_BASE_URL: &str = "ws://127.0.0.1:8787";
const TEXT_NAME: &str = "drawing";
const PING_INTERVAL_SECONDS: u64 = 30;

/// Usage: `client <roomId> [baseUrl]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let room_id = args.next().unwrap_or_else(|| "default_room".to_string());
    let base = args.next().unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let session_id = uuid::Uuid::new_v4().to_string();

    let mut url = Url::parse(&base)?;
    url.path_segments_mut()
        .map_err(|_| format!("{base} cannot be used as a base URL"))?
        .pop_if_empty()
        .extend(["connect", room_id.as_str()]);
    url.query_pairs_mut().append_pair("sessionId", &session_id);
    tracing::info!(%session_id, %room_id, "Connecting to {}", url);

    let (ws_stream, response) = connect_async(url.as_str())
        .await
        .map_err(|e| format!("Failed to connect: {}", e))?;
    tracing::info!(%session_id, %room_id, status = %response.status(), "Connected");

    let (write, read) = ws_stream.split();
    let writer: WsWriter = Arc::new(Mutex::new(write));
    let doc = Arc::new(Doc::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ping_handle = tokio::spawn(ping_task(writer.clone(), shutdown_rx.clone()));
    let sender_handle = tokio::spawn(sender_task(
        writer.clone(),
        doc.clone(),
        shutdown_rx.clone(),
        shutdown_tx.clone(),
    ));
    let receiver_handle = tokio::spawn(receiver_task(
        read,
        doc,
        shutdown_rx.clone(),
        shutdown_tx.clone(),
    ));

    let mut shutdown_rx_main = shutdown_rx;
    tokio::select! {
        result = ping_handle => tracing::info!("Ping task finished: {:?}", result),
        result = sender_handle => tracing::info!("Sender task finished: {:?}", result),
        result = receiver_handle => tracing::info!("Receiver task finished: {:?}", result),
        result = ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("Ctrl+C received, shutting down");
        }
        _ = shutdown_rx_main.changed() => {}
    }

    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Err(e) = writer.lock().await.close().await {
        tracing::warn!("Error closing WebSocket writer: {}", e);
    }

    tracing::info!("Client exiting.");
    Ok(())
}

async fn ping_task(writer: WsWriter, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECONDS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = writer.lock().await.send(Message::Ping(vec![].into())).await {
                    tracing::warn!("Failed to send Ping: {}", e);
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Appends each stdin line to the shared text and ships the resulting update.
async fn sender_task(
    writer: WsWriter,
    doc: Arc<Doc>,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) {
    let text = doc.get_or_insert_text(TEXT_NAME);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = stdin.next_line() => {
                match result {
                    Ok(Some(line)) => {
                        if line.is_empty() { continue; }
                        let update = {
                            let mut txn = doc.transact_mut();
                            let end = text.len(&txn);
                            text.insert(&mut txn, end, &format!("{line}\n"));
                            txn.encode_update_v1()
                        };
                        if let Err(e) = writer.lock().await.send(Message::Binary(update.into())).await {
                            tracing::error!("Failed to send update: {}", e);
                            let _ = shutdown_tx.send(true);
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Stdin closed.");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading from stdin: {}", e);
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Merges remote updates into the local document and prints the result.
async fn receiver_task(
    mut reader: WsReader,
    doc: Arc<Doc>,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) {
    let text = doc.get_or_insert_text(TEXT_NAME);
    loop {
        tokio::select! {
            message = reader.next() => {
                match message {
                    Some(Ok(Message::Binary(bytes))) => {
                        let applied = Update::decode_v1(&bytes)
                            .map_err(|e| e.to_string())
                            .and_then(|update| {
                                doc.transact_mut().apply_update(update).map_err(|e| e.to_string())
                            });
                        match applied {
                            Ok(()) => println!("---\n{}", text.get_string(&doc.transact())),
                            Err(e) => tracing::warn!("Ignoring malformed update: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Received Close frame: {:?}", frame);
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    Some(Ok(other)) => tracing::trace!("Ignoring frame: {:?}", other),
                    Some(Err(e)) => {
                        tracing::error!("Error receiving message: {}", e);
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream closed by peer.");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
