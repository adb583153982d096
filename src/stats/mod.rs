//! Process-wide presence authority.
//!
//! One [`StatsActor`] runs per process under the well-known `global`
//! identity. It owns two counters with different durability classes:
//!
//! - the heartbeat table ([`visitors`]), in memory only, which backs the
//!   reported online total;
//! - room occupancy plus the connect/disconnect total ([`occupancy`]),
//!   written to the key/value store before a notification is acknowledged.
//!
//! The two totals are deliberately kept apart.

pub mod occupancy;
pub mod visitors;

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::{
    error::{AppError, AppResult},
    identity::InstanceId,
    store::{KvStore, StoreError},
};
use occupancy::Occupancy;
use visitors::VisitorTable;

const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct StatsSettings {
    pub heartbeat_ttl: Duration,
    pub notify_timeout: Duration,
    pub mailbox_capacity: usize,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(5),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Connect,
    Disconnect,
}

#[derive(Debug)]
enum StatsCommand {
    RecordHeartbeat {
        visitor_id: String,
        reply: oneshot::Sender<u64>,
    },
    GetTotal {
        reply: oneshot::Sender<u64>,
    },
    GetConnectedTotal {
        reply: oneshot::Sender<u64>,
    },
    GetRoomCount {
        room_id: String,
        reply: oneshot::Sender<u64>,
    },
    Notify {
        action: PresenceAction,
        room_id: Option<String>,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
}

struct StatsActor {
    kv: Arc<dyn KvStore>,
    visitors: VisitorTable,
    occupancy: Occupancy,
    receiver: mpsc::Receiver<StatsCommand>,
}

impl StatsActor {
    async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            self.handle(command).await;
        }
        tracing::debug!("Stats actor mailbox closed");
    }

    async fn handle(&mut self, command: StatsCommand) {
        match command {
            StatsCommand::RecordHeartbeat { visitor_id, reply } => {
                let now = Instant::now();
                self.visitors.record(&visitor_id, now);
                let total = self.visitors.active_count(now) as u64;
                tracing::trace!(%visitor_id, total, "Heartbeat recorded");
                let _ = reply.send(total);
            }
            StatsCommand::GetTotal { reply } => {
                let _ = reply.send(self.visitors.active_count(Instant::now()) as u64);
            }
            StatsCommand::GetConnectedTotal { reply } => {
                let _ = reply.send(self.occupancy.connected_total());
            }
            StatsCommand::GetRoomCount { room_id, reply } => {
                let _ = reply.send(self.occupancy.room_count(&room_id));
            }
            StatsCommand::Notify {
                action,
                room_id,
                reply,
            } => {
                let result = self.notify(action, room_id.as_deref()).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn notify(&mut self, action: PresenceAction, room_id: Option<&str>) -> AppResult<()> {
        match action {
            PresenceAction::Connect => self.occupancy.connect(room_id),
            PresenceAction::Disconnect => self.occupancy.disconnect(room_id),
        }
        tracing::debug!(
            ?action,
            room_id = room_id.unwrap_or("-"),
            room_count = room_id.map(|r| self.occupancy.room_count(r)),
            connected = self.occupancy.connected_total(),
            "Occupancy updated"
        );
        // In-memory counters stay applied even if the write fails.
        self.occupancy.persist(self.kv.as_ref()).await.map_err(|e| {
            tracing::warn!(?action, error = %e, "Failed to persist occupancy");
            AppError::Persistence(e)
        })
    }
}

/// Mailbox address of the stats singleton.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    sender: mpsc::Sender<StatsCommand>,
    notify_timeout: Duration,
}

impl StatsHandle {
    /// Loads persisted occupancy, then starts the actor. The heartbeat
    /// table always starts empty.
    pub async fn spawn(kv: Arc<dyn KvStore>, settings: StatsSettings) -> Result<Self, StoreError> {
        let occupancy = Occupancy::load(kv.as_ref()).await?;
        let instance = InstanceId::global_stats();
        tracing::info!(
            %instance,
            connected = occupancy.connected_total(),
            "Stats actor starting"
        );

        let (sender, receiver) = mpsc::channel(settings.mailbox_capacity.max(1));
        let actor = StatsActor {
            kv,
            visitors: VisitorTable::new(settings.heartbeat_ttl),
            occupancy,
            receiver,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            sender,
            notify_timeout: settings.notify_timeout,
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StatsCommand,
    ) -> AppResult<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| AppError::actor_gone("stats"))?;
        response.await.map_err(|_| AppError::actor_gone("stats"))
    }

    pub async fn record_heartbeat(&self, visitor_id: &str) -> AppResult<u64> {
        if visitor_id.is_empty() {
            return Err(AppError::MissingParameter("visitorId"));
        }
        let visitor_id = visitor_id.to_string();
        self.request(|reply| StatsCommand::RecordHeartbeat { visitor_id, reply })
            .await
    }

    /// Number of visitors with a heartbeat inside the TTL.
    pub async fn total(&self) -> AppResult<u64> {
        self.request(|reply| StatsCommand::GetTotal { reply }).await
    }

    /// Persisted connect/disconnect total.
    pub async fn connected_total(&self) -> AppResult<u64> {
        self.request(|reply| StatsCommand::GetConnectedTotal { reply })
            .await
    }

    pub async fn room_count(&self, room_id: &str) -> AppResult<u64> {
        if room_id.is_empty() {
            return Err(AppError::MissingParameter("roomId"));
        }
        let room_id = room_id.to_string();
        self.request(|reply| StatsCommand::GetRoomCount { room_id, reply })
            .await
    }

    /// Applies and persists a notification, acknowledging after the write.
    pub async fn notify(&self, action: PresenceAction, room_id: Option<String>) -> AppResult<()> {
        self.request(|reply| StatsCommand::Notify {
            action,
            room_id,
            reply,
        })
        .await?
    }

    pub async fn notify_connect(&self, room_id: Option<String>) -> AppResult<()> {
        self.notify(PresenceAction::Connect, room_id).await
    }

    pub async fn notify_disconnect(&self, room_id: Option<String>) -> AppResult<()> {
        self.notify(PresenceAction::Disconnect, room_id).await
    }

    /// Fire-and-forget notification used by room actors.
    ///
    /// The command is enqueued before returning, so notifications from one
    /// caller reach the stats mailbox in call order. The outcome is awaited on
    /// a detached task and only logged.
    pub fn notify_best_effort(&self, action: PresenceAction, room_id: &str) {
        let (reply, response) = oneshot::channel();
        let command = StatsCommand::Notify {
            action,
            room_id: Some(room_id.to_string()),
            reply,
        };
        if let Err(e) = self.sender.try_send(command) {
            let error = AppError::Notification(e.to_string());
            tracing::warn!(%room_id, ?action, error = %error, "Dropped stats notification");
            return;
        }

        let timeout = self.notify_timeout;
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            let error = match tokio::time::timeout(timeout, response).await {
                Ok(Ok(Ok(()))) => {
                    tracing::trace!(%room_id, ?action, "Stats notification delivered");
                    return;
                }
                Ok(Ok(Err(e))) => AppError::Notification(e.to_string()),
                Ok(Err(_)) => AppError::Notification("stats actor dropped the reply".into()),
                Err(_) => AppError::Notification(format!("timed out after {timeout:?}")),
            };
            tracing::warn!(%room_id, ?action, error = %error, "Stats notification failed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use async_trait::async_trait;

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

    async fn spawn_stats(kv: Arc<dyn KvStore>) -> StatsHandle {
        StatsHandle::spawn(kv, StatsSettings::default()).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_expires_after_ttl() {
        let stats = spawn_stats(Arc::new(MemoryKvStore::new())).await;
        assert_eq!(stats.record_heartbeat("v1").await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(stats.total().await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(stats.total().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_heartbeats_count_one_visitor() {
        let stats = spawn_stats(Arc::new(MemoryKvStore::new())).await;
        for _ in 0..5 {
            assert_eq!(stats.record_heartbeat("v1").await.unwrap(), 1);
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert_eq!(stats.record_heartbeat("v2").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_parameters_are_rejected() {
        let stats = spawn_stats(Arc::new(MemoryKvStore::new())).await;
        assert!(matches!(
            stats.record_heartbeat("").await,
            Err(AppError::MissingParameter("visitorId"))
        ));
        assert!(matches!(
            stats.room_count("").await,
            Err(AppError::MissingParameter("roomId"))
        ));
        assert_eq!(stats.total().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connects_and_disconnects_update_room_counts() {
        let stats = spawn_stats(Arc::new(MemoryKvStore::new())).await;
        for _ in 0..3 {
            stats.notify_connect(Some("roomA".into())).await.unwrap();
        }
        stats.notify_disconnect(Some("roomA".into())).await.unwrap();

        assert_eq!(stats.room_count("roomA").await.unwrap(), 2);
        assert_eq!(stats.room_count("unknownRoom").await.unwrap(), 0);
        assert_eq!(stats.connected_total().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn occupancy_survives_restart_but_heartbeats_do_not() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let stats = spawn_stats(kv.clone()).await;
        stats.notify_connect(Some("roomA".into())).await.unwrap();
        stats.record_heartbeat("v1").await.unwrap();
        drop(stats);

        let restarted = spawn_stats(kv).await;
        assert_eq!(restarted.room_count("roomA").await.unwrap(), 1);
        assert_eq!(restarted.connected_total().await.unwrap(), 1);
        assert_eq!(restarted.total().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_in_memory_counters() {
        let stats = spawn_stats(Arc::new(ReadOnlyKv::default())).await;
        let result = stats.notify_connect(Some("roomA".into())).await;
        assert!(matches!(result, Err(AppError::Persistence(_))));
        assert_eq!(stats.room_count("roomA").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn best_effort_notifications_apply_in_order() {
        let stats = spawn_stats(Arc::new(MemoryKvStore::new())).await;
        stats.notify_best_effort(PresenceAction::Connect, "roomA");
        stats.notify_best_effort(PresenceAction::Connect, "roomA");
        stats.notify_best_effort(PresenceAction::Disconnect, "roomA");

        // FIFO mailbox: this read is queued behind the three notifications.
        assert_eq!(stats.room_count("roomA").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn best_effort_notification_swallows_persistence_failure() {
        let stats = spawn_stats(Arc::new(ReadOnlyKv::default())).await;
        stats.notify_best_effort(PresenceAction::Connect, "roomA");
        assert_eq!(stats.room_count("roomA").await.unwrap(), 1);
    }
}
