use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use super::{ConnectRequest, RoomHandle, RoomSettings, SessionTicket, engine::YrsEngine};
use crate::{error::AppResult, identity::InstanceId, stats::StatsHandle, store::BlobStore};

/// Attempts after the first when a connect lands on an actor that retired.
const RETIRED_ROOM_RETRIES: usize = 2;

/// Maps room ids to their single live actor, spawning on first use.
pub struct RoomDirectory {
    rooms: Mutex<HashMap<InstanceId, RoomHandle>>,
    blobs: Arc<dyn BlobStore>,
    stats: StatsHandle,
    settings: RoomSettings,
}

impl RoomDirectory {
    pub fn new(blobs: Arc<dyn BlobStore>, stats: StatsHandle, settings: RoomSettings) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            blobs,
            stats,
            settings,
        }
    }

    /// Returns the actor for `room_id`. Retired actors are dropped from the
    /// map; a fresh one recovers from the last saved snapshot.
    pub async fn resolve(&self, room_id: &str) -> RoomHandle {
        let instance = InstanceId::room(room_id);
        let mut rooms = self.rooms.lock().await;
        rooms.retain(|_, handle| handle.is_running());
        if let Some(handle) = rooms.get(&instance) {
            return handle.clone();
        }

        tracing::debug!(%room_id, %instance, "Spawning room actor");
        let handle = RoomHandle::spawn(
            instance.clone(),
            YrsEngine::new(self.settings.engine_settings()),
            Arc::clone(&self.blobs),
            self.stats.clone(),
            &self.settings,
        );
        rooms.insert(instance, handle.clone());
        handle
    }

    /// Registers a session in `room_id`, returning the room it joined.
    pub async fn connect(
        &self,
        room_id: &str,
        session_id: String,
    ) -> AppResult<(RoomHandle, SessionTicket)> {
        let request = ConnectRequest {
            session_id: Some(session_id),
            room_id: Some(room_id.to_string()),
        };
        let mut attempt = 0;
        loop {
            let room = self.resolve(room_id).await;
            match room.connect(request.clone()).await {
                Ok(ticket) => return Ok((room, ticket)),
                // The actor retired between resolve and connect.
                Err(_) if !room.is_running() && attempt < RETIRED_ROOM_RETRIES => {
                    attempt += 1;
                    tracing::debug!(
                        %room_id,
                        instance = %room.instance(),
                        "Room retired, retrying connect"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Number of rooms with a running actor.
    pub async fn len(&self) -> usize {
        let mut rooms = self.rooms.lock().await;
        rooms.retain(|_, handle| handle.is_running());
        rooms.len()
    }
}
