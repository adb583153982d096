use std::collections::HashMap;

use crate::store::{KvStore, StoreError, get_typed};

pub const TOTAL_USERS_KEY: &str = "totalUsers";
pub const ROOM_USERS_KEY: &str = "roomUsers";

/// Connection-driven counters owned by the stats actor.
///
/// Lifecycle: loaded once on actor start, mutated in place by
/// connect/disconnect notifications, written back after every mutation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Occupancy {
    connected_total: u64,
    rooms: HashMap<String, u64>,
}

impl Occupancy {
    pub async fn load(kv: &dyn KvStore) -> Result<Self, StoreError> {
        let connected_total = get_typed::<u64>(kv, TOTAL_USERS_KEY).await?.unwrap_or(0);
        let mut rooms: HashMap<String, u64> =
            get_typed(kv, ROOM_USERS_KEY).await?.unwrap_or_default();
        rooms.retain(|_, count| *count > 0);
        Ok(Self {
            connected_total,
            rooms,
        })
    }

    pub async fn persist(&self, kv: &dyn KvStore) -> Result<(), StoreError> {
        kv.put_all(vec![
            (TOTAL_USERS_KEY.to_string(), serde_json::to_value(self.connected_total)?),
            (ROOM_USERS_KEY.to_string(), serde_json::to_value(&self.rooms)?),
        ])
        .await
    }

    pub fn connect(&mut self, room_id: Option<&str>) {
        self.connected_total += 1;
        if let Some(room_id) = room_id {
            *self.rooms.entry(room_id.to_string()).or_insert(0) += 1;
        }
    }

    /// Floors at zero: a disconnect with nothing recorded is a no-op for that counter.
    pub fn disconnect(&mut self, room_id: Option<&str>) {
        self.connected_total = self.connected_total.saturating_sub(1);
        if let Some(room_id) = room_id {
            if let Some(count) = self.rooms.get_mut(room_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.rooms.remove(room_id);
                }
            }
        }
    }

    pub fn room_count(&self, room_id: &str) -> u64 {
        self.rooms.get(room_id).copied().unwrap_or(0)
    }

    pub fn connected_total(&self) -> u64 {
        self.connected_total
    }
}
