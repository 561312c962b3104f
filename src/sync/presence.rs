//! Presence and cursor state for real-time collaboration.
//!
//! Presence is ephemeral and never touches a document:
//! - JSON wire messages (`join`, `leave`, `cursor`)
//! - Latest-value-wins participant records per session
//! - Idle/away status derived from inactivity
//! - The server-side hub that relays accepted messages

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{now_millis, PeerId, SessionId};

/// How long before a participant is considered idle (no activity)
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long before a participant is considered away
const AWAY_TIMEOUT: Duration = Duration::from_secs(300);

/// Cursor position in a file (both 1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl Default for CursorPosition {
    fn default() -> Self {
        Self { line: 1, column: 1 }
    }
}

/// Presence message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Join,
    Leave,
    Cursor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Sender clock in milliseconds since the epoch
    #[serde(default)]
    pub timestamp: i64,
}

/// A fire-and-forget presence message as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    #[serde(rename = "type")]
    pub kind: PresenceKind,
    pub session_id: SessionId,
    pub participant_id: PeerId,
    #[serde(default)]
    pub payload: PresencePayload,
}

impl PresenceMessage {
    pub fn join(session_id: impl Into<String>, participant: &Participant, timestamp: i64) -> Self {
        Self {
            kind: PresenceKind::Join,
            session_id: session_id.into(),
            participant_id: participant.id.clone(),
            payload: PresencePayload {
                name: Some(participant.name.clone()),
                color: participant.color.clone(),
                timestamp,
                ..Default::default()
            },
        }
    }

    pub fn leave(session_id: impl Into<String>, participant_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: PresenceKind::Leave,
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            payload: PresencePayload {
                timestamp,
                ..Default::default()
            },
        }
    }

    pub fn cursor(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        position: CursorPosition,
        file_name: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: PresenceKind::Cursor,
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            payload: PresencePayload {
                cursor: Some(position),
                file_name,
                timestamp,
                ..Default::default()
            },
        }
    }

    pub fn to_json(&self) -> Result<String, PresenceError> {
        serde_json::to_string(self).map_err(|e| PresenceError::InvalidMessage(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, PresenceError> {
        serde_json::from_str(text).map_err(|e| PresenceError::InvalidMessage(e.to_string()))
    }
}

/// Identity a client announces when joining
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: PeerId,
    pub name: String,
    /// Assigned by the hub if absent
    pub color: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// Presence status for a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Actively editing
    #[default]
    Active,
    /// No recent activity
    Idle,
    /// Extended inactivity
    Away,
}

/// Last known state of a participant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: PeerId,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub file_name: Option<String>,
    pub status: PresenceStatus,
    /// Timestamp of the last accepted message
    pub last_update_ms: i64,
    /// Runtime-only last activity instant (not serialized)
    #[serde(skip)]
    last_active_instant: Option<Instant>,
}

impl Collaborator {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
            cursor: None,
            file_name: None,
            status: PresenceStatus::Active,
            last_update_ms: 0,
            last_active_instant: Some(Instant::now()),
        }
    }

    /// Update the last activity instant and set status to active
    pub fn touch(&mut self) {
        self.last_active_instant = Some(Instant::now());
        self.status = PresenceStatus::Active;
    }

    /// Get the last active instant (for runtime use)
    pub fn last_active(&self) -> Instant {
        self.last_active_instant.unwrap_or_else(Instant::now)
    }

    /// Update status based on inactivity
    pub fn update_status(&mut self) {
        let elapsed = self.last_active().elapsed();
        if elapsed > AWAY_TIMEOUT {
            self.status = PresenceStatus::Away;
        } else if elapsed > IDLE_TIMEOUT {
            self.status = PresenceStatus::Idle;
        }
    }
}

/// Result of applying a presence message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    /// State changed and the message should be relayed
    Applied,
    /// Older than (or as old as) what is already known; discarded
    Stale,
    /// Nothing to do, e.g. leave for someone absent
    Ignored,
}

/// Errors related to presence operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PresenceError {
    #[error("Participant not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Message for session {found} sent to {expected}")]
    WrongSession { expected: SessionId, found: SessionId },

    #[error("Invalid presence message: {0}")]
    InvalidMessage(String),

    #[error("Not joined to a session")]
    NotJoined,
}

/// Participants of one session, latest value wins per participant
#[derive(Debug, Clone)]
pub struct PresenceRoom {
    session_id: SessionId,
    participants: HashMap<PeerId, Collaborator>,
}

impl PresenceRoom {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            participants: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn apply(&mut self, message: &PresenceMessage) -> Result<PresenceOutcome, PresenceError> {
        if message.session_id != self.session_id {
            return Err(PresenceError::WrongSession {
                expected: self.session_id.clone(),
                found: message.session_id.clone(),
            });
        }

        let timestamp = message.payload.timestamp;
        match message.kind {
            PresenceKind::Join => {
                let entry = self
                    .participants
                    .entry(message.participant_id.clone())
                    .or_insert_with(|| {
                        Collaborator::new(message.participant_id.clone(), "", generate_peer_color())
                    });
                if entry.last_update_ms > timestamp {
                    return Ok(PresenceOutcome::Stale);
                }
                if let Some(name) = &message.payload.name {
                    entry.name = name.clone();
                }
                if let Some(color) = &message.payload.color {
                    entry.color = color.clone();
                }
                if message.payload.cursor.is_some() {
                    entry.cursor = message.payload.cursor;
                    entry.file_name = message.payload.file_name.clone();
                }
                entry.last_update_ms = timestamp;
                entry.touch();
                Ok(PresenceOutcome::Applied)
            }
            PresenceKind::Leave => match self.participants.remove(&message.participant_id) {
                Some(_) => Ok(PresenceOutcome::Applied),
                None => Ok(PresenceOutcome::Ignored),
            },
            PresenceKind::Cursor => {
                let entry = self
                    .participants
                    .get_mut(&message.participant_id)
                    .ok_or_else(|| PresenceError::PeerNotFound(message.participant_id.clone()))?;
                if timestamp <= entry.last_update_ms {
                    return Ok(PresenceOutcome::Stale);
                }
                entry.cursor = message.payload.cursor;
                if message.payload.file_name.is_some() {
                    entry.file_name = message.payload.file_name.clone();
                }
                entry.last_update_ms = timestamp;
                entry.touch();
                Ok(PresenceOutcome::Applied)
            }
        }
    }

    pub fn get(&self, participant_id: &str) -> Option<&Collaborator> {
        self.participants.get(participant_id)
    }

    /// All participants ordered by id
    pub fn participants(&self) -> Vec<Collaborator> {
        let mut all: Vec<Collaborator> = self.participants.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    /// Join messages describing everyone currently present, cursors included
    pub fn snapshot(&self) -> Vec<PresenceMessage> {
        self.participants()
            .into_iter()
            .map(|collaborator| {
                let participant = Participant {
                    id: collaborator.id.clone(),
                    name: collaborator.name.clone(),
                    color: Some(collaborator.color.clone()),
                };
                let mut join = PresenceMessage::join(
                    self.session_id.clone(),
                    &participant,
                    collaborator.last_update_ms,
                );
                join.payload.cursor = collaborator.cursor;
                join.payload.file_name = collaborator.file_name;
                join
            })
            .collect()
    }

    /// Update all statuses based on activity; returns whether any changed
    pub fn update_all_statuses(&mut self) -> bool {
        let mut changed = false;
        for collaborator in self.participants.values_mut() {
            let old_status = collaborator.status;
            collaborator.update_status();
            changed |= collaborator.status != old_status;
        }
        changed
    }
}

/// Identifier of one presence socket on the hub
pub type ConnectionId = String;

struct PresenceConnection {
    participant_id: Option<PeerId>,
    sender: mpsc::UnboundedSender<String>,
}

struct HubSession {
    room: PresenceRoom,
    connections: HashMap<ConnectionId, PresenceConnection>,
}

/// Server-side presence relay, one room per session
pub struct PresenceHub {
    sessions: DashMap<SessionId, HubSession>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a socket; the receiver yields JSON text to forward to it.
    ///
    /// The current participants are queued for the newcomer right away.
    pub fn connect(&self, session_id: &str) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = uuid::Uuid::new_v4().to_string();

        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| HubSession {
                room: PresenceRoom::new(session_id),
                connections: HashMap::new(),
            });

        for message in session.room.snapshot() {
            if let Ok(json) = message.to_json() {
                let _ = tx.send(json);
            }
        }
        session.connections.insert(
            connection_id.clone(),
            PresenceConnection {
                participant_id: None,
                sender: tx,
            },
        );

        debug!("Presence connection {} opened for session {}", connection_id, session_id);
        (connection_id, rx)
    }

    /// Apply a message received on `connection_id` and relay it if accepted
    pub fn handle_message(
        &self,
        session_id: &str,
        connection_id: &str,
        text: &str,
    ) -> Result<PresenceOutcome, PresenceError> {
        let mut message = PresenceMessage::from_json(text)?;

        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PresenceError::InvalidMessage(format!("Unknown session {}", session_id)))?;

        if message.kind == PresenceKind::Join && message.payload.color.is_none() {
            let existing = session
                .room
                .get(&message.participant_id)
                .map(|collaborator| collaborator.color.clone());
            message.payload.color = Some(existing.unwrap_or_else(generate_peer_color));
        }

        let outcome = session.room.apply(&message)?;
        if outcome != PresenceOutcome::Applied {
            return Ok(outcome);
        }

        match message.kind {
            PresenceKind::Join => {
                if let Some(connection) = session.connections.get_mut(connection_id) {
                    connection.participant_id = Some(message.participant_id.clone());
                }
            }
            PresenceKind::Leave => {
                if let Some(connection) = session.connections.get_mut(connection_id) {
                    connection.participant_id = None;
                }
            }
            PresenceKind::Cursor => {}
        }

        // Joins echo back so the sender learns its assigned color
        let echo = message.kind == PresenceKind::Join;
        let json = message.to_json()?;
        for (id, connection) in session.connections.iter() {
            if echo || id != connection_id {
                let _ = connection.sender.send(json.clone());
            }
        }

        Ok(outcome)
    }

    /// Drop a socket; its participant leaves and the others are told.
    ///
    /// A participant still claimed by another socket (a client that
    /// reconnected before its old socket was noticed closing) stays.
    pub fn disconnect(&self, session_id: &str, connection_id: &str) {
        let remove_session = match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                if let Some(connection) = session.connections.remove(connection_id) {
                    let departed = connection.participant_id.filter(|id| {
                        !session
                            .connections
                            .values()
                            .any(|other| other.participant_id.as_ref() == Some(id))
                    });
                    if let Some(participant_id) = departed {
                        let leave = PresenceMessage::leave(session_id, participant_id.clone(), now_millis());
                        if matches!(session.room.apply(&leave), Ok(PresenceOutcome::Applied)) {
                            info!("Participant {} left session {}", participant_id, session_id);
                            if let Ok(json) = leave.to_json() {
                                for connection in session.connections.values() {
                                    let _ = connection.sender.send(json.clone());
                                }
                            }
                        }
                    }
                }
                session.connections.is_empty()
            }
            None => false,
        };

        if remove_session {
            self.sessions.remove(session_id);
        }
    }

    /// Current participants of a session
    pub fn participants(&self, session_id: &str) -> Vec<Collaborator> {
        self.sessions
            .get(session_id)
            .map(|session| session.room.participants())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total participants across all sessions
    pub fn participant_count(&self) -> usize {
        self.sessions.iter().map(|session| session.room.len()).sum()
    }

    /// Update statuses for all sessions
    pub fn update_all_statuses(&self) {
        for mut session in self.sessions.iter_mut() {
            session.room.update_all_statuses();
        }
    }
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper to generate a random color for a participant
pub fn generate_peer_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#a855f7", // purple
        "#84cc16", // lime
        "#6366f1", // indigo
        "#d946ef", // fuchsia
        "#0ea5e9", // sky
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}
