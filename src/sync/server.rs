//! SyncServer hub relaying document updates between replicas.
//!
//! This module implements the server side of document sync using:
//! - DashMap for lock-free concurrent access to connected peers
//! - The session registry, which holds the authoritative replica of each file
//! - State-vector catch-up: a `SyncRequest` is answered with exactly what the
//!   requester lacks
//!
//! Concurrent edits from several replicas are merged by the CRDT; the hub only
//! applies, validates and relays.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::presence::PresenceHub;
use super::protocol::{SyncFrame, SyncProtocol};
use super::{PeerId, SessionId, SyncError, SyncResult};
use crate::session::{SessionError, SessionRegistry};

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Maximum replicas per session
    pub max_peers_per_session: usize,
    /// Cleanup interval for idle sessions
    pub cleanup_interval: Duration,
    /// How long a session with no replicas is kept
    pub session_grace: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            max_peers_per_session: 50,
            cleanup_interval: Duration::from_secs(60),
            session_grace: Duration::from_secs(300),
        }
    }
}

impl From<SessionError> for SyncError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => SyncError::SessionNotFound(id),
            SessionError::SessionFull { id, .. } => SyncError::SessionFull(id),
            SessionError::Document(e) => SyncError::MergeRejected(e.to_string()),
            other => SyncError::Internal(other.to_string()),
        }
    }
}

/// A single replica connected to the hub
pub struct PeerConnection {
    /// Unique peer identifier
    pub peer_id: PeerId,
    /// Session the socket was opened for
    pub session_id: SessionId,
    /// Channel to send frames to this peer
    tx: mpsc::UnboundedSender<SyncFrame>,
    /// Last activity timestamp
    last_active: Instant,
}

impl PeerConnection {
    pub fn new(
        peer_id: impl Into<String>,
        session_id: impl Into<String>,
        tx: mpsc::UnboundedSender<SyncFrame>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            session_id: session_id.into(),
            tx,
            last_active: Instant::now(),
        }
    }

    /// Send a frame to this peer
    pub fn send(&self, frame: SyncFrame) -> SyncResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| SyncError::ConnectionError("Channel closed".to_string()))
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}

/// The sync hub
pub struct SyncServer {
    /// Server configuration
    config: SyncServerConfig,
    /// Sessions and their documents
    registry: Arc<SessionRegistry>,
    /// Presence relay, served on its own endpoint
    presence: Arc<PresenceHub>,
    /// Connected peers (global)
    peers: DashMap<PeerId, Arc<RwLock<PeerConnection>>>,
    /// Server start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create a new sync server
    pub fn new(registry: Arc<SessionRegistry>, presence: Arc<PresenceHub>, config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            presence,
            peers: DashMap::new(),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Create with a fresh registry and presence hub
    pub fn with_config(config: SyncServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_peers_per_session));
        Self::new(registry, Arc::new(PresenceHub::new()), config)
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceHub> {
        &self.presence
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Register a replica socket for a session, creating the session on demand
    pub fn register_peer(
        &self,
        session_id: &str,
        tx: mpsc::UnboundedSender<SyncFrame>,
    ) -> SyncResult<PeerId> {
        self.registry.attach_replica(session_id)?;

        let peer_id = uuid::Uuid::new_v4().to_string();
        let connection = PeerConnection::new(&peer_id, session_id, tx);
        self.peers
            .insert(peer_id.clone(), Arc::new(RwLock::new(connection)));

        info!("Peer registered: {} in session {}", peer_id, session_id);
        Ok(peer_id)
    }

    /// Unregister a replica socket
    pub fn unregister_peer(&self, peer_id: &str) {
        if let Some((_, peer)) = self.peers.remove(peer_id) {
            let session_id = peer.read().session_id.clone();
            let remaining = self.registry.detach_replica(&session_id);
            info!(
                "Peer unregistered: {} ({} replicas left in {})",
                peer_id, remaining, session_id
            );
        }
    }

    /// Get a peer connection
    pub fn get_peer(&self, peer_id: &str) -> Option<Arc<RwLock<PeerConnection>>> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    /// Handle a binary frame from a peer; returns the direct answer, if any
    pub fn handle_frame(&self, peer_id: &str, data: &[u8]) -> SyncResult<Option<SyncFrame>> {
        let frame = SyncProtocol::decode(data)?;
        self.handle_decoded(peer_id, frame)
    }

    pub fn handle_decoded(&self, peer_id: &str, frame: SyncFrame) -> SyncResult<Option<SyncFrame>> {
        let session_id = {
            let peer = self
                .peers
                .get(peer_id)
                .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?;
            let mut peer = peer.write();
            peer.touch();
            peer.session_id.clone()
        };

        if frame.session_id() != session_id {
            return Err(SyncError::InvalidMessage(format!(
                "Frame for session {} on a socket for {}",
                frame.session_id(),
                session_id
            )));
        }

        let session = self
            .registry
            .get(&session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.clone()))?;

        match frame {
            SyncFrame::SyncRequest(request) => {
                let doc = session.document(&request.file_name)?;
                let reply = doc.lock().updates_since(&request.state_vector);
                debug!(
                    "Answering sync request for {}/{} with {} ops",
                    session_id,
                    request.file_name,
                    reply.operation_count()
                );
                Ok(Some(SyncFrame::SyncReply(reply)))
            }
            SyncFrame::Update(update) | SyncFrame::SyncReply(update) => {
                if update.is_empty() {
                    return Ok(None);
                }
                let doc = session.document(&update.file_name)?;
                let applied = doc.lock().apply_remote_update(&update);
                if let Err(e) = applied {
                    warn!("Rejected update from {} for {}: {}", peer_id, update.file_name, e);
                    return Err(e.into());
                }
                debug!(
                    "Relaying {} ops ({} bytes) for {}/{} from {}",
                    update.operation_count(),
                    update.byte_len(),
                    session_id,
                    update.file_name,
                    peer_id
                );
                self.broadcast_to_session(&session_id, peer_id, SyncFrame::Update(update));
                Ok(None)
            }
            SyncFrame::Error { message, .. } => {
                debug!("Peer {} reported: {}", peer_id, message);
                Ok(None)
            }
        }
    }

    /// Send a frame to every peer of a session except `exclude_peer`
    pub fn broadcast_to_session(&self, session_id: &str, exclude_peer: &str, frame: SyncFrame) {
        for entry in self.peers.iter() {
            if entry.key() == exclude_peer {
                continue;
            }
            let peer = entry.value().read();
            if peer.session_id == session_id {
                let _ = peer.send(frame.clone());
            }
        }
    }

    /// Peers connected to a session
    pub fn session_peer_count(&self, session_id: &str) -> usize {
        self.peers
            .iter()
            .filter(|entry| entry.value().read().session_id == session_id)
            .count()
    }

    /// Evict idle sessions and refresh presence statuses
    pub fn cleanup(&self) -> Vec<SessionId> {
        let evicted = self.registry.collect_garbage(self.config.session_grace);
        self.presence.update_all_statuses();
        evicted
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.registry.session_count(),
            active_peers: self.peers.len(),
            presence_participants: self.presence.participant_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Start the cleanup loop
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let cleanup_interval = server.config.cleanup_interval;
        let mut shutdown = server.shutdown_receiver();

        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = server.cleanup();
                        if !evicted.is_empty() {
                            debug!("Evicted {} idle sessions", evicted.len());
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            cleanup_task: cleanup_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub active_sessions: usize,
    pub active_peers: usize,
    pub presence_participants: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.cleanup_task.await;
    }
}
