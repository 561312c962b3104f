//! Synchronization module for CRDT-based real-time collaboration.
//!
//! This module implements the core synchronization logic using Automerge CRDTs.
//! It provides:
//! - A replicated text document per session file
//! - Binary WebSocket protocol with state-vector catch-up
//! - The session hub that relays updates between replicas
//! - A reconnecting client transport
//! - Presence and cursor broadcast on a separate channel

pub mod document;
pub mod presence;
pub mod presence_client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use document::{
    Anchor, ChangeOrigin, DocumentChanged, ReplicatedDocument, SharedDocument, StateVector,
    SyncUpdate, TextDelta,
};
pub use server::{SyncServer, SyncServerConfig};
pub use transport::{ConnectionHandle, ConnectionStatus, SyncTransport, TransportConfig};

use serde::{Deserialize, Serialize};

/// Unique identifier for a collaboration session
pub type SessionId = String;

/// Unique identifier for a connected peer
pub type PeerId = String;

/// Identifier handed out for listener registrations
pub type ListenerId = u64;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncError {
    /// Session not found
    SessionNotFound(SessionId),
    /// Peer not registered with the hub
    PeerNotFound(PeerId),
    /// Frame could not be decoded or addressed the wrong session
    InvalidMessage(String),
    /// Update failed integrity validation and was dropped
    MergeRejected(String),
    /// Connection error
    ConnectionError(String),
    /// Session already holds the maximum number of replicas
    SessionFull(SessionId),
    /// Internal server error
    Internal(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            SyncError::PeerNotFound(id) => write!(f, "Peer not found: {}", id),
            SyncError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            SyncError::MergeRejected(msg) => write!(f, "Update rejected: {}", msg),
            SyncError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            SyncError::SessionFull(id) => write!(f, "Session is full: {}", id),
            SyncError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<protocol::ProtocolError> for SyncError {
    fn from(err: protocol::ProtocolError) -> Self {
        SyncError::InvalidMessage(err.to_string())
    }
}

impl From<document::DocumentError> for SyncError {
    fn from(err: document::DocumentError) -> Self {
        SyncError::MergeRejected(err.to_string())
    }
}

/// Milliseconds since the Unix epoch, used for latest-value-wins comparisons
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
