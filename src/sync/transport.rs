//! Client side of the sync socket.
//!
//! A [`ConnectionHandle`] owns one background task per session. On every
//! (re)connect it sends a state-vector-only `SyncRequest` for each tracked
//! document, flushes updates queued while offline, and then streams updates in
//! both directions. Unexpected disconnects are retried with exponential backoff.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::document::{SharedDocument, SyncUpdate};
use super::protocol::{ProtocolError, SyncFrame, SyncProtocol};
use super::{ListenerId, SessionId};

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Errors surfaced to callers of the transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::Connection(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Client transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the server, e.g. `ws://127.0.0.1:5000`
    pub server_url: String,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Upper bound for reconnect delays
    pub backoff_cap: Duration,
    /// Updates kept while offline; the oldest are dropped beyond this
    pub offline_queue_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5000".to_string(),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            offline_queue_limit: 1024,
        }
    }
}

impl TransportConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_offline_queue_limit(mut self, limit: usize) -> Self {
        self.offline_queue_limit = limit;
        self
    }

    pub fn sync_url(&self, session_id: &str) -> String {
        format!("{}/ws/{}", self.server_url.trim_end_matches('/'), session_id)
    }

    pub fn presence_url(&self, session_id: &str) -> String {
        format!("{}/presence/{}", self.server_url.trim_end_matches('/'), session_id)
    }
}

/// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`, capped
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(cap)
}

/// Bounded FIFO of updates produced while disconnected
#[derive(Debug)]
pub struct OfflineQueue {
    items: VecDeque<SyncUpdate>,
    limit: usize,
}

impl OfflineQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Queue an update; returns false if the oldest entry had to be dropped
    pub fn push(&mut self, update: SyncUpdate) -> bool {
        let mut kept_all = true;
        if self.items.len() >= self.limit {
            self.items.pop_front();
            kept_all = false;
        }
        self.items.push_back(update);
        kept_all
    }

    pub fn drain(&mut self) -> Vec<SyncUpdate> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

type ReceiveCallback = Arc<dyn Fn(&SyncUpdate) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

struct ConnectionShared {
    session_id: SessionId,
    config: TransportConfig,
    status: Mutex<ConnectionStatus>,
    outgoing: mpsc::UnboundedSender<SyncFrame>,
    queue: Mutex<OfflineQueue>,
    documents: Mutex<HashMap<String, SharedDocument>>,
    receive_listeners: Mutex<Vec<(ListenerId, ReceiveCallback)>>,
    status_listeners: Mutex<Vec<(ListenerId, StatusCallback)>>,
    next_listener: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            if self.is_closed() && status != ConnectionStatus::Disconnected {
                return;
            }
            *current = status;
        }
        debug!("Sync connection for {} is now {:?}", self.session_id, status);

        let listeners: Vec<StatusCallback> = self
            .status_listeners
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for listener in listeners {
            listener(status);
        }
    }

    fn enqueue(&self, update: SyncUpdate) {
        if !self.queue.lock().push(update) {
            warn!(
                "Offline queue for {} is full, dropped the oldest update",
                self.session_id
            );
        }
    }

    fn tracked(&self) -> Vec<(String, SharedDocument)> {
        self.documents
            .lock()
            .iter()
            .map(|(name, doc)| (name.clone(), doc.clone()))
            .collect()
    }

    fn sync_request(&self, file_name: &str, doc: &SharedDocument) -> SyncFrame {
        let state_vector = doc.lock().state_vector();
        SyncFrame::SyncRequest(SyncUpdate::state_only(
            self.session_id.clone(),
            file_name,
            state_vector,
        ))
    }

    /// Apply an incoming frame; returns the frame to answer with, if any
    fn handle_incoming(&self, data: &[u8]) -> Option<SyncFrame> {
        let frame = match SyncProtocol::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping undecodable sync frame for {}: {}", self.session_id, e);
                return None;
            }
        };

        if frame.session_id() != self.session_id {
            warn!(
                "Dropping frame for session {} on connection {}",
                frame.session_id(),
                self.session_id
            );
            return None;
        }

        let (update, reply) = match frame {
            SyncFrame::Error { message, .. } => {
                warn!("Server rejected a frame for {}: {}", self.session_id, message);
                return None;
            }
            SyncFrame::SyncRequest(request) => {
                let doc = self.documents.lock().get(&request.file_name).cloned();
                return doc.map(|doc| {
                    let reply = doc.lock().updates_since(&request.state_vector);
                    SyncFrame::SyncReply(reply)
                });
            }
            SyncFrame::SyncReply(update) => {
                let doc = self.documents.lock().get(&update.file_name).cloned();
                let reply = match doc {
                    Some(doc) => {
                        let mut replica = doc.lock();
                        if let Err(e) = replica.apply_remote_update(&update) {
                            warn!("Rejected sync reply for {}: {}", update.file_name, e);
                        }
                        // Push what the server lacks
                        let missing = replica.updates_since(&update.state_vector);
                        (!missing.is_empty()).then_some(SyncFrame::Update(missing))
                    }
                    None => None,
                };
                (update, reply)
            }
            SyncFrame::Update(update) => {
                let doc = self.documents.lock().get(&update.file_name).cloned();
                if let Some(doc) = doc {
                    if let Err(e) = doc.lock().apply_remote_update(&update) {
                        warn!("Rejected update for {}: {}", update.file_name, e);
                    }
                }
                (update, None)
            }
        };

        if !update.is_empty() {
            let listeners: Vec<ReceiveCallback> = self
                .receive_listeners
                .lock()
                .iter()
                .map(|(_, callback)| callback.clone())
                .collect();
            for listener in listeners {
                listener(&update);
            }
        }

        reply
    }
}

/// Factory for sync connections
#[derive(Debug, Clone, Default)]
pub struct SyncTransport {
    config: TransportConfig,
}

impl SyncTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open a connection for a session. Must be called inside a tokio runtime.
    pub fn connect(&self, session_id: impl Into<String>) -> ConnectionHandle {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared {
            session_id: session_id.into(),
            queue: Mutex::new(OfflineQueue::new(self.config.offline_queue_limit)),
            config: self.config.clone(),
            status: Mutex::new(ConnectionStatus::Disconnected),
            outgoing,
            documents: Mutex::new(HashMap::new()),
            receive_listeners: Mutex::new(Vec::new()),
            status_listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(run_connection(shared.clone(), rx));
        *shared.task.lock() = Some(task);

        ConnectionHandle { shared }
    }
}

/// Handle to one session's sync connection; clones share the connection
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    /// Ship an update; queued while not connected
    pub fn send(&self, update: SyncUpdate) -> TransportResult<()> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        if update.is_empty() {
            return Ok(());
        }

        if self.status() == ConnectionStatus::Connected {
            if let Err(mpsc::error::SendError(frame)) =
                self.shared.outgoing.send(SyncFrame::Update(update))
            {
                if let SyncFrame::Update(update) = frame {
                    self.shared.enqueue(update);
                }
            }
        } else {
            self.shared.enqueue(update);
        }
        Ok(())
    }

    /// Wire a document into the connection so it is kept in sync
    pub fn track(&self, file_name: impl Into<String>, document: SharedDocument) {
        let file_name = file_name.into();
        let request = self.shared.sync_request(&file_name, &document);
        self.shared.documents.lock().insert(file_name, document);

        if self.status() == ConnectionStatus::Connected {
            let _ = self.shared.outgoing.send(request);
        }
    }

    pub fn untrack(&self, file_name: &str) -> bool {
        self.shared.documents.lock().remove(file_name).is_some()
    }

    /// Called with every non-empty update received from the server
    pub fn on_receive<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SyncUpdate) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::SeqCst);
        self.shared.receive_listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Called on every status transition
    pub fn on_status_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::SeqCst);
        self.shared.status_listeners.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.receive_listeners.lock().retain(|(listener, _)| *listener != id);
        self.shared.status_listeners.lock().retain(|(listener, _)| *listener != id);
    }

    pub fn pending_updates(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Cancel the connection task and pending retries, drop all listeners
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }
        self.shared.set_status(ConnectionStatus::Disconnected);

        self.shared.receive_listeners.lock().clear();
        self.shared.status_listeners.lock().clear();
        self.shared.documents.lock().clear();
        self.shared.queue.lock().clear();
        info!("Sync connection for {} closed", self.shared.session_id);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

async fn run_connection(shared: Arc<ConnectionShared>, mut rx: mpsc::UnboundedReceiver<SyncFrame>) {
    let url = shared.config.sync_url(&shared.session_id);
    let mut attempt: u32 = 0;

    shared.set_status(ConnectionStatus::Connecting);
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Connected to {}", url);
                attempt = 0;
                shared.set_status(ConnectionStatus::Connected);
                match drive(&shared, ws, &mut rx).await {
                    Ok(()) => info!("Server closed sync connection for {}", shared.session_id),
                    Err(e) => warn!("Sync connection for {} dropped: {}", shared.session_id, e),
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", url, e),
        }

        if shared.is_closed() {
            break;
        }

        shared.set_status(ConnectionStatus::Reconnecting);
        while let Ok(frame) = rx.try_recv() {
            if let SyncFrame::Update(update) = frame {
                shared.enqueue(update);
            }
        }

        let delay = backoff_delay(attempt, shared.config.backoff_base, shared.config.backoff_cap);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting {} in {:?}", shared.session_id, delay);
        tokio::time::sleep(delay).await;
    }
}

async fn drive<S>(
    shared: &ConnectionShared,
    ws: tokio_tungstenite::WebSocketStream<S>,
    rx: &mut mpsc::UnboundedReceiver<SyncFrame>,
) -> TransportResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    // State-vector exchange for everything tracked, then whatever piled up offline
    for (file_name, doc) in shared.tracked() {
        let request = shared.sync_request(&file_name, &doc);
        sink.send(Message::Binary(SyncProtocol::encode(&request)?.to_vec()))
            .await?;
    }

    let mut pending = shared.queue.lock().drain().into_iter();
    while let Some(update) = pending.next() {
        let bytes = SyncProtocol::encode(&SyncFrame::Update(update.clone()))?;
        if let Err(e) = sink.send(Message::Binary(bytes.to_vec())).await {
            shared.enqueue(update);
            pending.for_each(|rest| shared.enqueue(rest));
            return Err(e.into());
        }
    }

    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                let bytes = SyncProtocol::encode(&frame)?;
                if let Err(e) = sink.send(Message::Binary(bytes.to_vec())).await {
                    if let SyncFrame::Update(update) = frame {
                        shared.enqueue(update);
                    }
                    return Err(e.into());
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if let Some(reply) = shared.handle_incoming(&data) {
                        let bytes = SyncProtocol::encode(&reply)?;
                        sink.send(Message::Binary(bytes.to_vec())).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
