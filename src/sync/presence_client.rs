//! Client side of the presence socket.
//!
//! Presence is fire-and-forget: nothing is queued while disconnected. On every
//! (re)connect the channel announces itself with a fresh join that carries the
//! last cursor, so the hub always ends up with the latest state.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::presence::{
    Collaborator, CursorPosition, Participant, PresenceError, PresenceKind, PresenceMessage,
    PresenceOutcome, PresenceRoom,
};
use super::transport::{backoff_delay, ConnectionStatus, TransportConfig, TransportResult};
use super::{now_millis, ListenerId, SessionId};

type ParticipantsCallback = Arc<dyn Fn(&[Collaborator]) + Send + Sync>;

/// State of the session the channel is currently joined to
struct Membership {
    session_id: SessionId,
    participant: Participant,
    room: PresenceRoom,
    cursor: Option<CursorPosition>,
    active_file: Option<String>,
    last_timestamp: i64,
    outgoing: mpsc::UnboundedSender<String>,
    status: Arc<Mutex<ConnectionStatus>>,
    task: Option<JoinHandle<()>>,
}

impl Membership {
    /// Wall clock, but strictly increasing for this participant
    fn next_timestamp(&mut self) -> i64 {
        let timestamp = now_millis().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        timestamp
    }

    fn join_message(&mut self) -> PresenceMessage {
        let timestamp = self.next_timestamp();
        let mut join = PresenceMessage::join(self.session_id.clone(), &self.participant, timestamp);
        join.payload.cursor = self.cursor;
        join.payload.file_name = self.active_file.clone();
        join
    }

    fn send(&self, message: &PresenceMessage) {
        match message.to_json() {
            Ok(json) => {
                let _ = self.outgoing.send(json);
            }
            Err(e) => warn!("Cannot encode presence message: {}", e),
        }
    }
}

struct ChannelShared {
    config: TransportConfig,
    membership: Mutex<Option<Membership>>,
    listeners: Mutex<Vec<(ListenerId, ParticipantsCallback)>>,
    next_listener: AtomicU64,
}

impl ChannelShared {
    fn notify(&self, participants: &[Collaborator]) {
        let listeners: Vec<ParticipantsCallback> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for listener in listeners {
            listener(participants);
        }
    }

    /// First message after connecting, if still joined to `session_id`.
    ///
    /// The room is rebuilt from the hub's snapshot, so everyone but ourselves
    /// is forgotten here; peers that left while we were offline go with them.
    fn hello(&self, session_id: &str) -> Option<String> {
        let (hello, participants) = {
            let mut guard = self.membership.lock();
            let membership = guard.as_mut().filter(|m| m.session_id == session_id)?;
            let join = membership.join_message();
            membership.room.clear();
            if let Err(e) = membership.room.apply(&join) {
                warn!("Cannot apply own presence join: {}", e);
            }
            (join.to_json().ok()?, membership.room.participants())
        };
        self.notify(&participants);
        Some(hello)
    }

    fn handle_incoming(&self, text: &str) -> Result<PresenceOutcome, PresenceError> {
        let message = PresenceMessage::from_json(text)?;

        let participants = {
            let mut guard = self.membership.lock();
            let membership = guard.as_mut().ok_or(PresenceError::NotJoined)?;
            let outcome = membership.room.apply(&message)?;
            if outcome != PresenceOutcome::Applied {
                return Ok(outcome);
            }

            // The hub echoes our join with the color it assigned
            if message.kind == PresenceKind::Join && message.participant_id == membership.participant.id {
                if let Some(color) = &message.payload.color {
                    membership.participant.color = Some(color.clone());
                }
            }
            membership.room.participants()
        };

        self.notify(&participants);
        Ok(PresenceOutcome::Applied)
    }
}

/// Presence connection of one local participant
#[derive(Clone)]
pub struct PresenceChannel {
    shared: Arc<ChannelShared>,
}

impl PresenceChannel {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                config,
                membership: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Join a session, leaving any other one first.
    ///
    /// Joining the session again updates the announced record. Must be called
    /// inside a tokio runtime.
    pub fn join(&self, session_id: impl Into<String>, participant: Participant) -> Result<(), PresenceError> {
        let session_id = session_id.into();

        let current = self.session_id();
        if let Some(current) = current.filter(|current| *current != session_id) {
            self.leave(&current);
        }

        let participants = {
            let mut guard = self.shared.membership.lock();
            if guard.is_none() {
                *guard = Some(self.spawn(session_id.clone(), participant.clone()));
            }
            let membership = guard.as_mut().ok_or(PresenceError::NotJoined)?;

            if membership.participant.id != participant.id {
                // Same session under another identity: retire the old one
                let leave = PresenceMessage::leave(
                    session_id.clone(),
                    membership.participant.id.clone(),
                    membership.next_timestamp(),
                );
                membership.room.apply(&leave)?;
                membership.send(&leave);
            }

            let color = participant.color.clone().or_else(|| membership.participant.color.clone());
            membership.participant = Participant { color, ..participant };
            let join = membership.join_message();
            membership.room.apply(&join)?;
            membership.send(&join);
            membership.room.participants()
        };

        info!("Joined presence for session {}", session_id);
        self.shared.notify(&participants);
        Ok(())
    }

    fn spawn(&self, session_id: SessionId, participant: Participant) -> Membership {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(ConnectionStatus::Disconnected));
        let task = tokio::spawn(run_presence(
            self.shared.clone(),
            session_id.clone(),
            status.clone(),
            rx,
        ));

        Membership {
            room: PresenceRoom::new(session_id.clone()),
            session_id,
            participant,
            cursor: None,
            active_file: None,
            last_timestamp: 0,
            outgoing,
            status,
            task: Some(task),
        }
    }

    /// Leave `session_id`; returns false if not joined to it.
    ///
    /// A live socket gets to send the leave before closing; pending retries
    /// are cancelled either way.
    pub fn leave(&self, session_id: &str) -> bool {
        let membership = {
            let mut guard = self.shared.membership.lock();
            let joined = guard.as_ref().map_or(false, |m| m.session_id == session_id);
            if joined {
                guard.take()
            } else {
                None
            }
        };
        let Some(mut membership) = membership else {
            return false;
        };

        let connected = *membership.status.lock() == ConnectionStatus::Connected;
        let leave = PresenceMessage::leave(
            session_id,
            membership.participant.id.clone(),
            membership.next_timestamp(),
        );
        membership.send(&leave);
        if let Some(task) = membership.task.take() {
            if !connected {
                task.abort();
            }
        }
        // Dropping the sender ends the socket task
        drop(membership);

        info!("Left presence for session {}", session_id);
        self.shared.notify(&[]);
        true
    }

    /// Announce a local cursor move with a fresh timestamp
    pub fn broadcast_cursor(&self, position: CursorPosition) -> Result<(), PresenceError> {
        let participants = {
            let mut guard = self.shared.membership.lock();
            let membership = guard.as_mut().ok_or(PresenceError::NotJoined)?;
            let timestamp = membership.next_timestamp();
            let message = PresenceMessage::cursor(
                membership.session_id.clone(),
                membership.participant.id.clone(),
                position,
                membership.active_file.clone(),
                timestamp,
            );
            membership.cursor = Some(position);
            membership.room.apply(&message)?;
            membership.send(&message);
            membership.room.participants()
        };

        self.shared.notify(&participants);
        Ok(())
    }

    /// File named in subsequent cursor messages
    pub fn set_active_file(&self, file_name: Option<String>) {
        if let Some(membership) = self.shared.membership.lock().as_mut() {
            membership.active_file = file_name;
        }
    }

    /// Called with the full participant list after every accepted change
    pub fn on_participants_changed<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&[Collaborator]) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() < before
    }

    /// Participants of the joined session, including ourselves
    pub fn participants(&self) -> Vec<Collaborator> {
        self.shared
            .membership
            .lock()
            .as_ref()
            .map(|m| m.room.participants())
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.membership.lock().as_ref().map(|m| m.session_id.clone())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared
            .membership
            .lock()
            .as_ref()
            .map(|m| *m.status.lock())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Apply one message as received from the hub
    pub fn handle_incoming(&self, text: &str) -> Result<PresenceOutcome, PresenceError> {
        self.shared.handle_incoming(text)
    }
}

async fn run_presence(
    shared: Arc<ChannelShared>,
    session_id: SessionId,
    status: Arc<Mutex<ConnectionStatus>>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let url = shared.config.presence_url(&session_id);
    let mut attempt: u32 = 0;

    *status.lock() = ConnectionStatus::Connecting;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Connected to {}", url);
                attempt = 0;
                *status.lock() = ConnectionStatus::Connected;
                match drive(&shared, &session_id, ws, &mut rx).await {
                    Ok(true) => break,
                    Ok(false) => info!("Server closed presence connection for {}", session_id),
                    Err(e) => warn!("Presence connection for {} dropped: {}", session_id, e),
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", url, e),
        }

        *status.lock() = ConnectionStatus::Reconnecting;
        let delay = backoff_delay(attempt, shared.config.backoff_base, shared.config.backoff_cap);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting presence for {} in {:?}", session_id, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_closed(&mut rx) => break,
        }
    }

    *status.lock() = ConnectionStatus::Disconnected;
    debug!("Presence task for {} finished", session_id);
}

/// Completes once the channel's sender is gone; discards anything queued
async fn wait_closed(rx: &mut mpsc::UnboundedReceiver<String>) {
    while rx.recv().await.is_some() {}
}

/// Returns `Ok(true)` when the channel left the session
async fn drive<S>(
    shared: &ChannelShared,
    session_id: &str,
    ws: tokio_tungstenite::WebSocketStream<S>,
    rx: &mut mpsc::UnboundedReceiver<String>,
) -> TransportResult<bool>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    // Anything queued while offline is superseded by the hello
    while rx.try_recv().is_ok() {}
    match shared.hello(session_id) {
        Some(hello) => sink.send(Message::Text(hello)).await?,
        None => return Ok(true),
    }

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(text) => sink.send(Message::Text(text)).await?,
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(true);
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = shared.handle_incoming(&text) {
                        debug!("Ignoring presence message for {}: {}", session_id, e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(false),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
