use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};

use crate::{
    error::AppError,
    room::{CloseReason, RoomHandle, SessionTicket},
    server::AppState,
};

/// Server-side ping schedule for upgraded sockets.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// GET /connect/{room_id}?sessionId=
pub async fn connect_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(session_id) = query.session_id.filter(|s| !s.is_empty()) else {
        return AppError::MissingParameter("sessionId").into_response();
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let (room, ticket) = match state.rooms.connect(&room_id, session_id).await {
        Ok(joined) => joined,
        Err(e) => {
            tracing::error!(%room_id, error = %e, "Failed to register session");
            return e.into_response();
        }
    };

    let connection = ticket.connection;
    let failed_room = room.clone();
    let keepalive = state.keepalive;
    upgrade
        .on_failed_upgrade(move |error| {
            tracing::warn!(%room_id, %connection, %error, "WebSocket upgrade failed");
            tokio::spawn(async move {
                failed_room
                    .socket_closed(connection, CloseReason::UpgradeFailed)
                    .await;
            });
        })
        .on_upgrade(move |socket| handle_socket(socket, room, ticket, keepalive))
}

/// Strips CORS headers from `101 Switching Protocols` responses. Every other
/// response of the connect route keeps the decoration added by the CORS layer.
pub async fn strip_cors_from_upgrade(mut response: Response) -> Response {
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let headers = response.headers_mut();
        let cors: Vec<_> = headers
            .keys()
            .filter(|name| name.as_str().starts_with("access-control-"))
            .cloned()
            .collect();
        for name in cors {
            headers.remove(name);
        }
    }
    response
}

/// Pumps frames between one socket and its room until either side stops,
/// then reports the close to the room exactly once.
async fn handle_socket(
    socket: WebSocket,
    room: RoomHandle,
    ticket: SessionTicket,
    keepalive: Keepalive,
) {
    let SessionTicket {
        session_id,
        room_id,
        connection,
        mut outbound,
    } = ticket;
    tracing::info!(%room_id, %session_id, %connection, "WebSocket connection established");

    let (ws_sender, mut ws_receiver) = socket.split();
    let ws_sender = Arc::new(Mutex::new(ws_sender));
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    // Room -> socket. Ends when the engine drops this session's queue.
    let out_sender = Arc::clone(&ws_sender);
    let mut outbound_task: JoinHandle<()> = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let mut sender = out_sender.lock().await;
            if sender.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Socket -> room.
    let in_room = room.clone();
    let in_pong = Arc::clone(&last_pong);
    let in_room_id = room_id.clone();
    let mut inbound_task: JoinHandle<CloseReason> = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Binary(bytes)) => {
                    if in_room.send_update(connection, bytes.to_vec()).await.is_err() {
                        return CloseReason::Error;
                    }
                }
                Ok(Message::Text(text)) => {
                    tracing::warn!(room_id = %in_room_id, %connection, len = text.len(), "Ignoring text frame");
                }
                Ok(Message::Ping(_)) => {}
                Ok(Message::Pong(_)) => *in_pong.lock().await = Instant::now(),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(room_id = %in_room_id, %connection, ?frame, "Received close frame");
                    return CloseReason::Closed;
                }
                Err(e) => {
                    tracing::warn!(room_id = %in_room_id, %connection, error = %e, "WebSocket receive error");
                    return CloseReason::Error;
                }
            }
        }
        CloseReason::Closed
    });

    let ping_sender = Arc::clone(&ws_sender);
    let ping_pong = Arc::clone(&last_pong);
    let mut heartbeat_task: JoinHandle<&'static str> = tokio::spawn(async move {
        let mut interval = tokio::time::interval(keepalive.interval);
        loop {
            interval.tick().await;
            if ping_pong.lock().await.elapsed() > keepalive.timeout {
                return "pong timeout";
            }
            let mut sender = ping_sender.lock().await;
            if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                return "failed to send ping";
            }
        }
    });

    let reason = tokio::select! {
        res = &mut outbound_task => {
            if let Err(e) = res {
                tracing::error!(%room_id, %connection, "Outbound task panicked: {}", e);
            }
            inbound_task.abort();
            heartbeat_task.abort();
            CloseReason::Closed
        },
        res = &mut inbound_task => {
            outbound_task.abort();
            heartbeat_task.abort();
            res.unwrap_or(CloseReason::Error)
        },
        res = &mut heartbeat_task => {
            match res {
                Ok(why) => tracing::info!(%room_id, %connection, "Keepalive stopped: {}", why),
                Err(e) => tracing::error!(%room_id, %connection, "Keepalive task panicked: {}", e),
            }
            outbound_task.abort();
            inbound_task.abort();
            CloseReason::Error
        }
    };

    if let Err(e) = ws_sender.lock().await.close().await {
        tracing::debug!(%room_id, %connection, "Ignoring error closing WebSocket: {}", e);
    }
    room.socket_closed(connection, reason).await;
    tracing::info!(%room_id, %session_id, %connection, ?reason, "WebSocket connection finished");
}
