pub mod directory;
pub mod engine;
pub mod error;
pub mod session;

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::{
    error::{AppError, AppResult},
    identity::InstanceId,
    stats::{PresenceAction, StatsHandle},
    store::{Blob, BlobStore, DEFAULT_CONTENT_TYPE, snapshot_key},
};
pub use directory::RoomDirectory;
use engine::{EngineSettings, SyncEngine};
use session::ConnectionId;

const DEFAULT_MAILBOX_CAPACITY: usize = 256;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub max_connections: usize,
    pub snapshot_interval: Duration,
    pub outbound_capacity: usize,
    pub mailbox_capacity: usize,
    /// How long a room with no sessions stays resident before its actor
    /// retires. Unsaved changes keep it alive.
    pub idle_timeout: Duration,
}

impl Default for RoomSettings {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            max_connections: engine.max_connections,
            snapshot_interval: engine.snapshot_interval,
            outbound_capacity: engine.outbound_capacity,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl RoomSettings {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_connections: self.max_connections,
            snapshot_interval: self.snapshot_interval,
            outbound_capacity: self.outbound_capacity,
        }
    }
}

/// Parameters of a connect as forwarded by the router.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub session_id: Option<String>,
    /// Injected by the router; the actor falls back to its instance id.
    pub room_id: Option<String>,
}

/// Everything the socket pump needs once the actor accepted a session.
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: String,
    pub room_id: String,
    pub connection: ConnectionId,
    pub outbound: mpsc::Receiver<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Closed,
    Error,
    UpgradeFailed,
}

#[derive(Debug)]
enum RoomCommand {
    Connect {
        request: ConnectRequest,
        reply: oneshot::Sender<AppResult<SessionTicket>>,
    },
    Update {
        connection: ConnectionId,
        payload: Vec<u8>,
    },
    SocketClosed {
        connection: ConnectionId,
        reason: CloseReason,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
}

/// A socket the actor has accepted and not yet seen close.
#[derive(Debug)]
struct LiveConnection {
    session_id: String,
    room_id: String,
}

struct RoomActor<E: SyncEngine> {
    instance: InstanceId,
    engine: E,
    blobs: Arc<dyn BlobStore>,
    stats: StatsHandle,
    live: HashMap<ConnectionId, LiveConnection>,
    next_connection: u64,
    idle_timeout: Duration,
    receiver: mpsc::Receiver<RoomCommand>,
}

impl<E: SyncEngine> RoomActor<E> {
    async fn run(mut self) {
        loop {
            let command = if self.is_idle() {
                match tokio::time::timeout(self.idle_timeout, self.receiver.recv()).await {
                    Ok(command) => command,
                    Err(_) => {
                        if self.flush().await {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                self.receiver.recv().await
            };
            let Some(command) = command else {
                self.flush().await;
                tracing::debug!(instance = %self.instance, "Room actor mailbox closed");
                return;
            };
            self.handle(command).await;
        }
        self.retire().await;
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Connect { request, reply } => {
                let result = self.handle_connect(request).await;
                if let Err(Ok(ticket)) = reply.send(result) {
                    // Caller went away before the upgrade; undo the connect.
                    self.handle_socket_closed(ticket.connection, CloseReason::UpgradeFailed)
                        .await;
                }
            }
            RoomCommand::Update {
                connection,
                payload,
            } => self.handle_update(connection, payload).await,
            RoomCommand::SocketClosed { connection, reason } => {
                self.handle_socket_closed(connection, reason).await
            }
            RoomCommand::SessionCount { reply } => {
                let _ = reply.send(self.engine.session_count());
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.live.is_empty() && self.engine.session_count() == 0
    }

    /// Closes the mailbox and answers what is already queued. Queued connects
    /// are dropped; the directory retries them on a fresh actor.
    async fn retire(mut self) {
        self.receiver.close();
        while let Some(command) = self.receiver.recv().await {
            if let RoomCommand::SessionCount { reply } = command {
                let _ = reply.send(0);
            }
        }
        tracing::info!(instance = %self.instance, "Idle room actor retired");
    }

    /// Forces out any unsaved changes. Returns `false` if they are still
    /// unsaved.
    async fn flush(&mut self) -> bool {
        match self.engine.take_pending_save(Instant::now(), true) {
            Some(snapshot) => self.save(snapshot).await,
            None => true,
        }
    }

    async fn save(&mut self, snapshot: Vec<u8>) -> bool {
        let saved = persist_snapshot(self.blobs.as_ref(), &self.instance, snapshot).await;
        if !saved {
            self.engine.save_failed();
        }
        saved
    }

    async fn handle_connect(&mut self, request: ConnectRequest) -> AppResult<SessionTicket> {
        let session_id = request
            .session_id
            .filter(|s| !s.is_empty())
            .ok_or(AppError::MissingParameter("sessionId"))?;
        let room_id = request
            .room_id
            .unwrap_or_else(|| self.instance.to_string());

        // Unsaved changes are newer than anything in the blob store.
        if self.engine.session_count() == 0 && !self.engine.has_unsaved_changes() {
            self.recover_snapshot(&room_id).await;
        }

        self.stats.notify_best_effort(PresenceAction::Connect, &room_id);

        let connection = ConnectionId(self.next_connection);
        self.next_connection += 1;

        match self.engine.connect(&session_id, connection) {
            Ok(outbound) => {
                tracing::info!(
                    %room_id,
                    %session_id,
                    %connection,
                    sessions = self.engine.session_count(),
                    "Session connected"
                );
                self.live.insert(
                    connection,
                    LiveConnection {
                        session_id: session_id.clone(),
                        room_id: room_id.clone(),
                    },
                );
                Ok(SessionTicket {
                    session_id,
                    room_id,
                    connection,
                    outbound,
                })
            }
            Err(e) => {
                tracing::error!(%room_id, %session_id, error = %e, "Sync engine rejected connection");
                self.stats
                    .notify_best_effort(PresenceAction::Disconnect, &room_id);
                Err(AppError::Internal(e.to_string()))
            }
        }
    }

    /// Loads the last saved snapshot into the engine. Never fatal: a missing
    /// or unreadable snapshot leaves the current document in place.
    async fn recover_snapshot(&mut self, room_id: &str) {
        let key = snapshot_key(&self.instance);
        match self.blobs.get(&key).await {
            Ok(Some(blob)) => match self.engine.load_snapshot(&blob.data) {
                Ok(()) => {
                    tracing::info!(%room_id, bytes = blob.data.len(), "Recovered room snapshot")
                }
                Err(e) => tracing::warn!(%room_id, error = %e, "Failed to parse room snapshot"),
            },
            Ok(None) => tracing::info!(%room_id, "No saved snapshot, starting empty"),
            Err(e) => tracing::warn!(%room_id, error = %e, "Failed to recover room state"),
        }
    }

    async fn handle_update(&mut self, connection: ConnectionId, payload: Vec<u8>) {
        let Some(live) = self.live.get(&connection) else {
            tracing::trace!(%connection, "Dropping update from closed connection");
            return;
        };
        if let Err(e) = self
            .engine
            .apply_update(&live.session_id, connection, &payload)
        {
            tracing::warn!(
                room_id = %live.room_id,
                session_id = %live.session_id,
                error = %e,
                "Rejected document update"
            );
            return;
        }
        if let Some(snapshot) = self.engine.take_pending_save(Instant::now(), false) {
            self.save(snapshot).await;
        }
    }

    async fn handle_socket_closed(&mut self, connection: ConnectionId, reason: CloseReason) {
        // close and error can both fire for one socket; only the first counts.
        let Some(live) = self.live.remove(&connection) else {
            return;
        };
        self.engine.disconnect(&live.session_id, connection);
        tracing::info!(
            room_id = %live.room_id,
            session_id = %live.session_id,
            %connection,
            ?reason,
            sessions = self.engine.session_count(),
            "Session disconnected"
        );
        self.stats
            .notify_best_effort(PresenceAction::Disconnect, &live.room_id);

        if self.engine.session_count() == 0 {
            self.flush().await;
        }
    }
}

/// Writes a room snapshot under the room's identity key.
async fn persist_snapshot(
    blobs: &dyn BlobStore,
    instance: &InstanceId,
    snapshot: Vec<u8>,
) -> bool {
    let key = snapshot_key(instance);
    let bytes = snapshot.len();
    match blobs
        .put(&key, Blob::new(snapshot, DEFAULT_CONTENT_TYPE))
        .await
    {
        Ok(()) => {
            tracing::debug!(%instance, bytes, "Saved room snapshot");
            true
        }
        Err(e) => {
            tracing::warn!(%instance, error = %e, "Failed to save room snapshot");
            false
        }
    }
}

/// Mailbox address of one room actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    instance: InstanceId,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn spawn<E: SyncEngine>(
        instance: InstanceId,
        engine: E,
        blobs: Arc<dyn BlobStore>,
        stats: StatsHandle,
        settings: &RoomSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.mailbox_capacity.max(1));
        let actor = RoomActor {
            instance: instance.clone(),
            engine,
            blobs,
            stats,
            live: HashMap::new(),
            next_connection: 0,
            idle_timeout: settings.idle_timeout,
            receiver,
        };
        tokio::spawn(actor.run());
        Self { instance, sender }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    pub async fn connect(&self, request: ConnectRequest) -> AppResult<SessionTicket> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(RoomCommand::Connect { request, reply })
            .await
            .map_err(|_| AppError::actor_gone("room"))?;
        response.await.map_err(|_| AppError::actor_gone("room"))?
    }

    pub async fn send_update(&self, connection: ConnectionId, payload: Vec<u8>) -> AppResult<()> {
        self.sender
            .send(RoomCommand::Update {
                connection,
                payload,
            })
            .await
            .map_err(|_| AppError::actor_gone("room"))
    }

    pub async fn socket_closed(&self, connection: ConnectionId, reason: CloseReason) {
        if self
            .sender
            .send(RoomCommand::SocketClosed { connection, reason })
            .await
            .is_err()
        {
            tracing::warn!(instance = %self.instance, %connection, "Room actor gone before close");
        }
    }

    pub async fn session_count(&self) -> AppResult<usize> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(RoomCommand::SessionCount { reply })
            .await
            .map_err(|_| AppError::actor_gone("room"))?;
        response.await.map_err(|_| AppError::actor_gone("room"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        room::engine::{
            YrsEngine,
            tests::{read_text, text_update},
        },
        stats::StatsSettings,
        store::{KvStore, MemoryBlobStore, MemoryKvStore, StoreError},
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingBlobs;

    #[async_trait]
    impl BlobStore for FailingBlobs {
        async fn get(&self, _: &str) -> Result<Option<Blob>, StoreError> {
            Err(StoreError::Unavailable("blob store down".into()))
        }

        async fn put(&self, _: &str, _: Blob) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("blob store down".into()))
        }
    }

    /// Fails the `fail_on`-th write (1-based), stores every other one.
    struct FlakyBlobs {
        inner: MemoryBlobStore,
        writes: AtomicUsize,
        fail_on: usize,
    }

    impl FlakyBlobs {
        fn failing_write(fail_on: usize) -> Self {
            Self {
                inner: MemoryBlobStore::new(),
                writes: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl BlobStore for FlakyBlobs {
        async fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, blob: Blob) -> Result<(), StoreError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StoreError::Unavailable("transient".into()));
            }
            self.inner.put(key, blob).await
        }
    }

    async fn stats() -> StatsHandle {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        StatsHandle::spawn(kv, StatsSettings::default()).await.unwrap()
    }

    fn spawn_room(blobs: Arc<dyn BlobStore>, stats: StatsHandle, max: usize) -> RoomHandle {
        let settings = RoomSettings {
            max_connections: max,
            ..RoomSettings::default()
        };
        RoomHandle::spawn(
            InstanceId::room("roomA"),
            YrsEngine::new(settings.engine_settings()),
            blobs,
            stats,
            &settings,
        )
    }

    fn request(session_id: &str) -> ConnectRequest {
        ConnectRequest {
            session_id: Some(session_id.to_string()),
            room_id: Some("roomA".to_string()),
        }
    }

    #[tokio::test]
    async fn missing_session_id_is_rejected_before_registration() {
        let stats = stats().await;
        let room = spawn_room(Arc::new(MemoryBlobStore::new()), stats.clone(), 10);

        let result = room
            .connect(ConnectRequest {
                session_id: None,
                room_id: Some("roomA".into()),
            })
            .await;
        assert!(matches!(result, Err(AppError::MissingParameter("sessionId"))));
        assert_eq!(room.session_count().await.unwrap(), 0);
        assert_eq!(stats.room_count("roomA").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connect_and_close_notify_stats_once_each() {
        let stats = stats().await;
        let room = spawn_room(Arc::new(MemoryBlobStore::new()), stats.clone(), 10);

        let ticket = room.connect(request("s1")).await.unwrap();
        assert_eq!(ticket.room_id, "roomA");
        assert_eq!(room.session_count().await.unwrap(), 1);
        assert_eq!(stats.room_count("roomA").await.unwrap(), 1);

        room.socket_closed(ticket.connection, CloseReason::Closed).await;
        room.socket_closed(ticket.connection, CloseReason::Error).await;
        assert_eq!(room.session_count().await.unwrap(), 0);
        assert_eq!(stats.room_count("roomA").await.unwrap(), 0);
        assert_eq!(stats.connected_total().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn engine_failure_undoes_connect_notification() {
        let stats = stats().await;
        let room = spawn_room(Arc::new(MemoryBlobStore::new()), stats.clone(), 1);

        let _first = room.connect(request("s1")).await.unwrap();
        let second = room.connect(request("s2")).await;
        assert!(matches!(second, Err(AppError::Internal(_))));

        assert_eq!(room.session_count().await.unwrap(), 1);
        assert_eq!(stats.room_count("roomA").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blob_failures_never_block_sessions() {
        let stats = stats().await;
        let room = spawn_room(Arc::new(FailingBlobs), stats.clone(), 10);

        let ticket = room.connect(request("s1")).await.unwrap();
        room.send_update(ticket.connection, text_update("x"))
            .await
            .unwrap();
        room.socket_closed(ticket.connection, CloseReason::Closed).await;

        let again = room.connect(request("s2")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn saved_snapshot_is_recovered_after_cold_restart() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let stats = stats().await;

        let room = spawn_room(blobs.clone(), stats.clone(), 10);
        let ticket = room.connect(request("s1")).await.unwrap();
        room.send_update(ticket.connection, text_update("sketch"))
            .await
            .unwrap();
        room.socket_closed(ticket.connection, CloseReason::Closed).await;
        // Mailbox is FIFO: once this answers, the close (and its save) ran.
        assert_eq!(room.session_count().await.unwrap(), 0);
        drop(room);

        let restarted = spawn_room(blobs, stats, 10);
        let mut ticket = restarted.connect(request("s2")).await.unwrap();
        let initial = ticket.outbound.recv().await.unwrap();
        assert_eq!(read_text(&initial), "sketch");
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .put(
                &snapshot_key(&InstanceId::room("roomA")),
                Blob::new(vec![0xFF, 0xFF, 0xFF], DEFAULT_CONTENT_TYPE),
            )
            .await
            .unwrap();

        let room = spawn_room(blobs, stats().await, 10);
        let mut ticket = room.connect(request("s1")).await.unwrap();
        let initial = ticket.outbound.recv().await.unwrap();
        assert_eq!(read_text(&initial), "");
    }

    #[tokio::test]
    async fn room_id_falls_back_to_instance_identity() {
        let room = spawn_room(Arc::new(MemoryBlobStore::new()), stats().await, 10);
        let ticket = room
            .connect(ConnectRequest {
                session_id: Some("s1".into()),
                room_id: None,
            })
            .await
            .unwrap();
        assert_eq!(ticket.room_id, InstanceId::room("roomA").to_string());
    }

    #[tokio::test]
    async fn failed_final_save_keeps_newer_state_in_memory() {
        let blobs = Arc::new(FlakyBlobs::failing_write(2));
        let room = spawn_room(blobs.clone(), stats().await, 10);

        let ticket = room.connect(request("s1")).await.unwrap();
        // First write goes through, the second update is throttled.
        room.send_update(ticket.connection, text_update("alpha"))
            .await
            .unwrap();
        room.send_update(ticket.connection, text_update("beta"))
            .await
            .unwrap();
        // Forced save on last close is the failing second write.
        room.socket_closed(ticket.connection, CloseReason::Closed).await;

        let mut ticket = room.connect(request("s2")).await.unwrap();
        let initial = read_text(&ticket.outbound.recv().await.unwrap());
        assert!(initial.contains("alpha") && initial.contains("beta"), "{initial}");

        // The retry on the next close persists what was lost.
        room.socket_closed(ticket.connection, CloseReason::Closed).await;
        assert_eq!(room.session_count().await.unwrap(), 0);
        let saved = blobs
            .get(&snapshot_key(&InstanceId::room("roomA")))
            .await
            .unwrap()
            .unwrap();
        assert!(read_text(&saved.data).contains("beta"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_room_retires_after_timeout() {
        let settings = RoomSettings {
            idle_timeout: Duration::from_secs(1),
            ..RoomSettings::default()
        };
        let room = RoomHandle::spawn(
            InstanceId::room("roomA"),
            YrsEngine::new(settings.engine_settings()),
            Arc::new(MemoryBlobStore::new()),
            stats().await,
            &settings,
        );

        let ticket = room.connect(request("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(room.is_running(), "rooms with sessions stay resident");

        room.socket_closed(ticket.connection, CloseReason::Closed).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!room.is_running());
        assert!(room.connect(request("s2")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unsaved_room_is_not_retired() {
        let settings = RoomSettings {
            idle_timeout: Duration::from_secs(1),
            ..RoomSettings::default()
        };
        let room = RoomHandle::spawn(
            InstanceId::room("roomA"),
            YrsEngine::new(settings.engine_settings()),
            Arc::new(FailingBlobs),
            stats().await,
            &settings,
        );

        let ticket = room.connect(request("s1")).await.unwrap();
        room.send_update(ticket.connection, text_update("x"))
            .await
            .unwrap();
        room.socket_closed(ticket.connection, CloseReason::Closed).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(room.is_running());
    }
}
