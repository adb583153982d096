/// Errors raised by a room's sync engine. They never leave the room actor;
/// the actor logs them and carries on.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// A client frame that is not a valid v1 update.
    #[error("Failed to apply update: {0}")]
    InvalidUpdate(String),
    /// A stored snapshot that could not be decoded or applied.
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("Room is full ({0} sessions)")]
    RoomFull(usize),
    /// An update from a connection whose session was replaced or closed.
    #[error("Connection for session '{0}' is no longer current")]
    StaleConnection(String),
}
