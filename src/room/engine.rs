//! Document synchronization behind a room actor.
//!
//! The room actor treats the engine as opaque: it hands over sessions and
//! raw client frames, loads snapshots into it on cold start and persists
//! whatever the engine's save hook hands back. The engine owns fan-out.

use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use tokio::{sync::mpsc, time::Instant};
use yrs::{Doc, ReadTxn, StateVector, Transact, Update, updates::decoder::Decode};

use super::{
    error::SyncError,
    session::{ConnectionId, SessionState},
};

pub trait SyncEngine: Send + 'static {
    fn session_count(&self) -> usize;

    /// Replaces the document with a previously saved snapshot. On error the
    /// current document is left untouched.
    fn load_snapshot(&mut self, snapshot: &[u8]) -> Result<(), SyncError>;

    fn snapshot(&self) -> Vec<u8>;

    /// Registers a session and returns the stream of frames to write to its
    /// socket. The first frame is the full document state.
    fn connect(
        &mut self,
        session_id: &str,
        connection: ConnectionId,
    ) -> Result<mpsc::Receiver<Vec<u8>>, SyncError>;

    /// Returns `false` if `connection` no longer owns the session.
    fn disconnect(&mut self, session_id: &str, connection: ConnectionId) -> bool;

    fn apply_update(
        &mut self,
        session_id: &str,
        connection: ConnectionId,
        update: &[u8],
    ) -> Result<(), SyncError>;

    /// Save hook. Returns a snapshot when unsaved changes should be persisted
    /// now; `force` skips the throttle.
    fn take_pending_save(&mut self, now: Instant, force: bool) -> Option<Vec<u8>>;

    /// Re-arms the save hook after a snapshot it handed out could not be
    /// written.
    fn save_failed(&mut self);

    /// True while the document holds changes no successful save has seen.
    fn has_unsaved_changes(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_connections: usize,
    pub snapshot_interval: Duration,
    pub outbound_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            snapshot_interval: Duration::from_secs(10),
            outbound_capacity: 256,
        }
    }
}

/// Yjs-compatible engine: clients exchange v1 updates as binary frames.
pub struct YrsEngine {
    doc: Doc,
    sessions: HashMap<String, SessionState>,
    settings: EngineSettings,
    dirty: bool,
    last_saved: Option<Instant>,
}

impl YrsEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            doc: Doc::new(),
            sessions: HashMap::new(),
            settings,
            dirty: false,
            last_saved: None,
        }
    }

    fn is_current(&self, session_id: &str, connection: ConnectionId) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.connection() == connection)
    }

    /// Sends `frame` to every session but `origin`. Sessions that cannot keep
    /// up are dropped; their sockets close once the queue drains.
    fn fan_out(&mut self, origin: &str, frame: &[u8]) {
        let mut evicted = Vec::new();
        for (session_id, state) in &self.sessions {
            if session_id == origin {
                continue;
            }
            match state.outbound().try_send(frame.to_vec()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%session_id, "Outbound queue full, evicting session");
                    evicted.push(session_id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(session_id.clone()),
            }
        }
        for session_id in evicted {
            self.sessions.remove(&session_id);
        }
    }
}

impl Default for YrsEngine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl SyncEngine for YrsEngine {
    fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn load_snapshot(&mut self, snapshot: &[u8]) -> Result<(), SyncError> {
        let update =
            Update::decode_v1(snapshot).map_err(|e| SyncError::InvalidSnapshot(e.to_string()))?;
        let doc = Doc::new();
        doc.transact_mut()
            .apply_update(update)
            .map_err(|e| SyncError::InvalidSnapshot(e.to_string()))?;
        self.doc = doc;
        self.dirty = false;
        Ok(())
    }

    fn snapshot(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn connect(
        &mut self,
        session_id: &str,
        connection: ConnectionId,
    ) -> Result<mpsc::Receiver<Vec<u8>>, SyncError> {
        let replacing = self.sessions.contains_key(session_id);
        if !replacing && self.sessions.len() >= self.settings.max_connections {
            return Err(SyncError::RoomFull(self.settings.max_connections));
        }

        let (outbound, receiver) = mpsc::channel(self.settings.outbound_capacity.max(1));
        // Fresh channel, so the initial state always fits.
        let _ = outbound.try_send(self.snapshot());

        if let Some(previous) = self
            .sessions
            .insert(session_id.to_string(), SessionState::new(connection, outbound))
        {
            tracing::info!(
                %session_id,
                previous = %previous.connection(),
                %connection,
                "Session replaced by a new connection"
            );
        }
        Ok(receiver)
    }

    fn disconnect(&mut self, session_id: &str, connection: ConnectionId) -> bool {
        if !self.is_current(session_id, connection) {
            return false;
        }
        if let Some(state) = self.sessions.remove(session_id) {
            tracing::debug!(
                %session_id,
                %connection,
                connected_for = ?(Utc::now() - state.connected_at()),
                "Session removed"
            );
        }
        true
    }

    fn apply_update(
        &mut self,
        session_id: &str,
        connection: ConnectionId,
        update: &[u8],
    ) -> Result<(), SyncError> {
        if !self.is_current(session_id, connection) {
            return Err(SyncError::StaleConnection(session_id.to_string()));
        }
        let decoded =
            Update::decode_v1(update).map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(decoded)
            .map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;
        self.dirty = true;
        self.fan_out(session_id, update);
        Ok(())
    }

    fn take_pending_save(&mut self, now: Instant, force: bool) -> Option<Vec<u8>> {
        if !self.dirty {
            return None;
        }
        let due = force
            || self
                .last_saved
                .is_none_or(|saved| now.duration_since(saved) >= self.settings.snapshot_interval);
        if !due {
            return None;
        }
        self.dirty = false;
        self.last_saved = Some(now);
        Some(self.snapshot())
    }

    fn save_failed(&mut self) {
        self.dirty = true;
        self.last_saved = None;
    }

    fn has_unsaved_changes(&self) -> bool {
        self.dirty
    }
}
