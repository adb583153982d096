use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const ROOM_NAMESPACE: &str = "room";
pub const STATS_NAMESPACE: &str = "stats";
/// Well-known name of the stats singleton.
pub const GLOBAL_STATS_NAME: &str = "global";

/// Stable identity of an actor instance.
///
/// Derived from a namespace and a name, so the same room id always resolves
/// to the same instance (and the same persisted keys) across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn from_name(namespace: &str, name: &str) -> Self {
        let digest = Sha256::new()
            .chain_update(namespace.as_bytes())
            .chain_update([0u8])
            .chain_update(name.as_bytes())
            .finalize();
        Self(hex::encode(digest))
    }

    pub fn room(room_id: &str) -> Self {
        Self::from_name(ROOM_NAMESPACE, room_id)
    }

    pub fn global_stats() -> Self {
        Self::from_name(STATS_NAMESPACE, GLOBAL_STATS_NAME)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
