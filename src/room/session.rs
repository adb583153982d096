use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Identifies one socket. A session id can be reused across reconnects;
/// a connection id never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered session as the sync engine sees it.
#[derive(Debug)]
pub struct SessionState {
    connection: ConnectionId,
    outbound: mpsc::Sender<Vec<u8>>,
    connected_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(connection: ConnectionId, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            connection,
            outbound,
            connected_at: Utc::now(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn outbound(&self) -> &mpsc::Sender<Vec<u8>> {
        &self.outbound
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}
