//! HTTP and WebSocket surface of the collaboration server.
//!
//! Routes:
//! - `GET /health`
//! - `GET|POST /api/sessions`, `GET /api/sessions/:id`
//! - `GET|PUT /api/sessions/:id/files/*path`
//! - `GET /api/sessions/:id/git/status`, `GET /api/sessions/:id/git/log`
//! - `POST /api/sessions/:id/git/stage`, `POST /api/sessions/:id/git/commit`
//! - `POST /api/sessions/:id/git/branches`, `POST /api/sessions/:id/git/checkout`
//! - `GET /ws/:session_id` binary document sync
//! - `GET /presence/:session_id` JSON presence

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::session::{Session, SessionError, SessionSummary};
use crate::sync::presence::Collaborator;
use crate::sync::protocol::{SyncFrame, SyncProtocol, PROTOCOL_VERSION};
use crate::sync::SyncServer;
use crate::vcs::{GitCommit, GitStatus, VcsError};

type ApiError = (StatusCode, String);

/// Shared application state
pub struct AppState {
    server: Arc<SyncServer>,
}

impl AppState {
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(Arc::new(SyncServer::with_config(config.sync_server_config())))
    }

    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    fn session(&self, id: &str) -> Result<Arc<Session>, ApiError> {
        self.server
            .registry()
            .get(id)
            .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Session not found: {}", id)))
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_sessions: usize,
    active_peers: usize,
    presence_participants: usize,
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    id: Option<String>,
    name: Option<String>,
    /// Generated source to seed, keyed by file name
    #[serde(default)]
    files: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
    name: String,
    ws_url: String,
    presence_url: String,
    files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionSummary>,
    total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDetailResponse {
    #[serde(flatten)]
    summary: SessionSummary,
    connected_peers: usize,
    participants: Vec<Collaborator>,
}

#[derive(Debug, Serialize)]
struct SeedResponse {
    seeded: bool,
}

#[derive(Debug, Default, Deserialize)]
struct StageRequest {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Deserialize)]
struct BranchRequest {
    name: String,
    #[serde(default)]
    checkout: bool,
}

#[derive(Debug, Deserialize)]
struct CommitRequest {
    message: String,
    author: Option<String>,
}

fn session_error(err: SessionError) -> ApiError {
    let status = match &err {
        SessionError::NotFound(_) | SessionError::FileNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::AlreadyExists(_) => StatusCode::CONFLICT,
        SessionError::SessionFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::Document(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SessionError::Vcs(e) => return vcs_error(e.clone()),
    };
    (status, err.to_string())
}

fn vcs_error(err: VcsError) -> ApiError {
    let status = match err {
        VcsError::BranchNotFound(_) => StatusCode::NOT_FOUND,
        VcsError::BranchExists(_) | VcsError::NothingToCommit => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string())
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: stats.uptime_seconds,
        active_sessions: stats.active_sessions,
        active_peers: stats.active_peers,
        presence_participants: stats.presence_participants,
    })
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.server.registry().list();
    let total = sessions.len();
    Json(SessionListResponse { sessions, total })
}

/// Create a session, optionally seeded with generated files
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let session_id = payload.id.unwrap_or_else(|| {
        let full_uuid = uuid::Uuid::new_v4().to_string();
        full_uuid.chars().take(8).collect()
    });
    let name = payload
        .name
        .unwrap_or_else(|| format!("Session {}", session_id));

    let session = state
        .server
        .registry()
        .create(&session_id, &name)
        .map_err(session_error)?;

    for (file_name, text) in &payload.files {
        session
            .seed_file(file_name, text)
            .map_err(|e| session_error(e.into()))?;
    }

    info!(
        "Created session {} ({}) with {} files",
        name,
        session_id,
        payload.files.len()
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            ws_url: format!("/ws/{}", session_id),
            presence_url: format!("/presence/{}", session_id),
            files: session.files(),
            session_id,
            name,
        }),
    ))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let session = state.session(&session_id)?;
    Ok(Json(SessionDetailResponse {
        summary: session.summary(),
        connected_peers: state.server.session_peer_count(&session_id),
        participants: state.server.presence().participants(&session_id),
    }))
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    Path((session_id, path)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let session = state.session(&session_id)?;
    session
        .file_text(path.trim_start_matches('/'))
        .map_err(session_error)
}

/// Seed a file with generated source; existing content is left alone
async fn seed_file(
    State(state): State<Arc<AppState>>,
    Path((session_id, path)): Path<(String, String)>,
    body: String,
) -> Result<Json<SeedResponse>, ApiError> {
    let session = state.session(&session_id)?;
    let update = session
        .seed_file(path.trim_start_matches('/'), &body)
        .map_err(|e| session_error(e.into()))?;

    if let Some(update) = &update {
        state
            .server
            .broadcast_to_session(&session_id, "", SyncFrame::Update(update.clone()));
    }
    Ok(Json(SeedResponse {
        seeded: update.is_some(),
    }))
}

async fn git_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<GitStatus>, ApiError> {
    let session = state.session(&session_id)?;
    let status = session.vcs().lock().get_status();
    Ok(Json(status))
}

async fn git_log(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<GitCommit>>, ApiError> {
    let session = state.session(&session_id)?;
    let log = session.vcs().lock().get_commit_log();
    Ok(Json(log))
}

async fn git_stage(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<StageRequest>,
) -> Result<Json<GitStatus>, ApiError> {
    let session = state.session(&session_id)?;
    let mut vcs = session.vcs().lock();

    vcs.stage_files(&payload.files).map_err(vcs_error)?;
    if payload.all {
        vcs.stage_all();
    }
    Ok(Json(vcs.get_status()))
}

async fn git_create_branch(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<BranchRequest>,
) -> Result<(StatusCode, Json<GitStatus>), ApiError> {
    let session = state.session(&session_id)?;
    let mut vcs = session.vcs().lock();

    vcs.create_branch(&payload.name).map_err(vcs_error)?;
    if payload.checkout {
        vcs.checkout_branch(payload.name.trim()).map_err(vcs_error)?;
    }
    info!("Created branch {} in session {}", payload.name.trim(), session_id);
    Ok((StatusCode::CREATED, Json(vcs.get_status())))
}

async fn git_checkout(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<BranchRequest>,
) -> Result<Json<GitStatus>, ApiError> {
    let session = state.session(&session_id)?;
    let mut vcs = session.vcs().lock();
    vcs.checkout_branch(&payload.name).map_err(vcs_error)?;
    Ok(Json(vcs.get_status()))
}

async fn git_commit(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<CommitRequest>,
) -> Result<(StatusCode, Json<GitCommit>), ApiError> {
    let session = state.session(&session_id)?;
    let author = payload.author.as_deref().unwrap_or("anonymous");
    let commit = session
        .vcs()
        .lock()
        .commit(&payload.message, author)
        .map_err(vcs_error)?;
    Ok((StatusCode::CREATED, Json(commit)))
}

// ============================================================================
// WEBSOCKET HANDLERS
// ============================================================================

async fn sync_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("Sync socket upgrade for session: {}", session_id);
    ws.on_upgrade(move |socket| handle_sync_socket(socket, session_id, state))
}

/// One replica's document sync socket
async fn handle_sync_socket(socket: WebSocket, session_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SyncFrame>();

    let peer_id = match state.server.register_peer(&session_id, tx.clone()) {
        Ok(peer_id) => peer_id,
        Err(e) => {
            warn!("Refusing sync socket for {}: {}", session_id, e);
            if let Ok(bytes) = SyncProtocol::encode(&SyncProtocol::error_frame(&session_id, e.to_string())) {
                let _ = ws_sender.send(Message::Binary(bytes.to_vec())).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let peer_id_send = peer_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match SyncProtocol::encode(&frame) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode frame: {}", e),
            }
        }
        debug!("Send task ended for peer {}", peer_id_send);
    });

    let peer_id_recv = peer_id.clone();
    let session_id_recv = session_id.clone();
    let state_recv = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match state_recv.server.handle_frame(&peer_id_recv, &data) {
                    Ok(Some(reply)) => {
                        let _ = tx.send(reply);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Frame from {} rejected: {}", peer_id_recv, e);
                        let _ = tx.send(SyncProtocol::error_frame(&session_id_recv, e.to_string()));
                    }
                },
                Message::Close(_) => {
                    info!("Sync socket closed by client: {}", peer_id_recv);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for peer {}", peer_id_recv);
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.server.unregister_peer(&peer_id);
    info!("Peer {} disconnected from session {}", peer_id, session_id);
}

async fn presence_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_presence_socket(socket, session_id, state))
}

/// One participant's presence socket
async fn handle_presence_socket(socket: WebSocket, session_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let presence = state.server.presence().clone();
    let (connection_id, mut rx) = presence.connect(&session_id);

    let mut send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let hub = presence.clone();
    let session_id_recv = session_id.clone();
    let connection_id_recv = connection_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match hub.handle_message(&session_id_recv, &connection_id_recv, &text) {
                        Ok(outcome) => debug!("Presence message on {}: {:?}", connection_id_recv, outcome),
                        Err(e) => debug!("Presence message on {} dropped: {}", connection_id_recv, e),
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    presence.disconnect(&session_id, &connection_id);
    debug!("Presence connection {} closed", connection_id);
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:session_id", get(get_session))
        .route(
            "/api/sessions/:session_id/files/*path",
            get(get_file).put(seed_file),
        )
        .route("/api/sessions/:session_id/git/status", get(git_status))
        .route("/api/sessions/:session_id/git/log", get(git_log))
        .route("/api/sessions/:session_id/git/stage", post(git_stage))
        .route("/api/sessions/:session_id/git/commit", post(git_commit))
        .route("/api/sessions/:session_id/git/branches", post(git_create_branch))
        .route("/api/sessions/:session_id/git/checkout", post(git_checkout))
        .route("/ws/:session_id", get(sync_ws_handler))
        .route("/presence/:session_id", get(presence_ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            session_error(SessionError::NotFound("x".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            session_error(SessionError::AlreadyExists("x".into())).0,
            StatusCode::CONFLICT
        );
        assert_eq!(vcs_error(VcsError::NothingToCommit).0, StatusCode::CONFLICT);
        assert_eq!(vcs_error(VcsError::EmptyMessage).0, StatusCode::BAD_REQUEST);
        assert_eq!(
            session_error(SessionError::Vcs(VcsError::BranchNotFound("dev".into()))).0,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(request.id.is_none());
        assert!(request.files.is_empty());

        let request: CreateSessionRequest =
            serde_json::from_str(r#"{"name":"Demo","files":{"app.tsx":"export {}"}}"#).unwrap();
        assert_eq!(request.files["app.tsx"], "export {}");
    }

    #[tokio::test]
    async fn test_stage_and_commit_handlers() {
        let state = Arc::new(AppState::from_config(&ServerConfig::default()));
        let session = state.server.registry().create("demo", "Demo").unwrap();
        session.seed_file("app.tsx", "export {}").unwrap();

        let Json(status) = git_stage(
            State(state.clone()),
            Path("demo".to_string()),
            Json(StageRequest {
                files: vec!["app.tsx".to_string()],
                all: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status.staged, vec!["app.tsx"]);

        let (code, Json(commit)) = git_commit(
            State(state.clone()),
            Path("demo".to_string()),
            Json(CommitRequest {
                message: "Initial commit".to_string(),
                author: Some("alice".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(commit.files().to_vec(), vec!["app.tsx".to_string()]);

        let err = git_commit(
            State(state),
            Path("demo".to_string()),
            Json(CommitRequest {
                message: "Again".to_string(),
                author: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_failed_stage_request_stages_nothing() {
        let state = Arc::new(AppState::from_config(&ServerConfig::default()));
        let session = state.server.registry().create("demo", "Demo").unwrap();
        session.seed_file("app.tsx", "export {}").unwrap();

        let err = git_stage(
            State(state.clone()),
            Path("demo".to_string()),
            Json(StageRequest {
                files: vec!["app.tsx".to_string(), "missing.tsx".to_string()],
                all: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let status = session.vcs().lock().get_status();
        assert!(status.staged.is_empty());
        assert_eq!(status.untracked, vec!["app.tsx"]);
    }

    #[tokio::test]
    async fn test_branch_handlers() {
        let state = Arc::new(AppState::from_config(&ServerConfig::default()));
        state.server.registry().create("demo", "Demo").unwrap();
        let request = |name: &str, checkout| {
            Json(BranchRequest {
                name: name.to_string(),
                checkout,
            })
        };

        let (code, Json(status)) =
            git_create_branch(State(state.clone()), Path("demo".to_string()), request("feature", false))
                .await
                .unwrap();
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(status.branches, vec!["main", "feature"]);
        assert_eq!(status.current_branch, "main");

        let err = git_create_branch(State(state.clone()), Path("demo".to_string()), request("feature", true))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);

        let Json(status) = git_checkout(State(state.clone()), Path("demo".to_string()), request("feature", false))
            .await
            .unwrap();
        assert_eq!(status.current_branch, "feature");

        let err = git_checkout(State(state), Path("demo".to_string()), request("nope", false))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }
}
