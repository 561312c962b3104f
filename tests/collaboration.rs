use codecollab::app::{router, AppState};
use codecollab::editor::{EditorWidget, RemoteCursor, SharedWidget};
use codecollab::sync::presence::{CursorPosition, Participant};
use codecollab::sync::{ConnectionStatus, SharedDocument};
use codecollab::vcs::VcsError;
use codecollab::{
    Binder, PresenceChannel, ReplicatedDocument, ServerConfig, Session, SyncTransport,
    TransportConfig,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[test]
fn demo_replicas_converge() {
    let mut a = ReplicatedDocument::new("demo", "main.rs").unwrap();
    let mut b = ReplicatedDocument::new("demo", "main.rs").unwrap();

    let from_a = a.apply_local_edit(0..0, "hello").unwrap();
    let from_b = b.apply_local_edit(0..0, "world").unwrap();

    a.apply_remote_update(&from_b).unwrap();
    b.apply_remote_update(&from_a).unwrap();

    let text_a = a.current_text().unwrap();
    let text_b = b.current_text().unwrap();
    assert_eq!(text_a, text_b);
    assert!(text_a.contains("hello"));
    assert!(text_a.contains("world"));
}

#[test]
fn stage_then_commit() {
    let session = Session::new("demo", "Demo");
    session.seed_file("app.tsx", "export default App;").unwrap();
    let doc = session.document("app.tsx").unwrap();
    doc.lock().apply_local_edit(0..0, "// generated\n").unwrap();
    assert_eq!(session.vcs().lock().get_status().unstaged, vec!["app.tsx"]);

    let mut vcs = session.vcs().lock();
    vcs.stage("app.tsx").unwrap();
    let commit = vcs.commit("init", "alice").unwrap();

    let status = vcs.get_status();
    assert!(status.staged.is_empty());
    assert_eq!(status.commits[0].files().to_vec(), vec!["app.tsx".to_string()]);
    assert_eq!(status.commits[0].message(), "init");
    assert_eq!(status.commits[0].id(), commit.id());
}

#[test]
fn empty_commit_is_rejected() {
    let session = Session::new("demo", "Demo");
    let mut vcs = session.vcs().lock();
    assert!(vcs.get_status().staged.is_empty());

    assert_eq!(vcs.commit("empty", "bob"), Err(VcsError::NothingToCommit));
    assert!(vcs.get_commit_log().is_empty());
}

#[test]
fn commits_are_immutable() {
    let session = Session::new("demo", "Demo");
    session.seed_file("app.tsx", "a").unwrap();
    let doc = session.document("app.tsx").unwrap();

    session.vcs().lock().stage("app.tsx").unwrap();
    let first = session.vcs().lock().commit("first", "alice").unwrap();

    doc.lock().apply_local_edit(1..1, "b").unwrap();
    session.vcs().lock().stage("app.tsx").unwrap();
    session.vcs().lock().commit("second", "alice").unwrap();

    let log = session.vcs().lock().get_commit_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1], first);
    assert_eq!(log[1].message(), "first");
    assert_eq!(log[1].files().to_vec(), vec!["app.tsx".to_string()]);
}

/// Plain text widget without its own change events
#[derive(Default)]
struct TextWidget {
    chars: Vec<char>,
    cursors: Vec<RemoteCursor>,
}

impl EditorWidget for TextWidget {
    fn text(&self) -> String {
        self.chars.iter().collect()
    }

    fn splice(&mut self, position: usize, deleted: usize, inserted: &str) {
        self.chars.splice(position..position + deleted, inserted.chars());
    }

    fn render_remote_cursors(&mut self, cursors: &[RemoteCursor]) {
        self.cursors = cursors.to_vec();
    }
}

async fn serve() -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::from_config(&ServerConfig::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn start_server() -> (String, Arc<AppState>) {
    let (addr, state) = serve().await;
    (format!("ws://{}", addr), state)
}

/// TCP relay in front of the server whose links can be cut
struct FlakyLink {
    addr: SocketAddr,
    online: Arc<AtomicBool>,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FlakyLink {
    async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let online = Arc::new(AtomicBool::new(true));
        let links = Arc::new(Mutex::new(Vec::new()));

        let accept_online = online.clone();
        let accept_links = links.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                // Refused while offline: the handshake fails on the client
                if !accept_online.load(Ordering::SeqCst) {
                    continue;
                }
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                accept_links.lock().push(link);
            }
        });

        Self { addr, online, links }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn cut(&self) {
        self.online.store(false, Ordering::SeqCst);
        for link in self.links.lock().drain(..) {
            link.abort();
        }
    }

    fn restore(&self) {
        self.online.store(true, Ordering::SeqCst);
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn client_config(url: &str) -> TransportConfig {
    TransportConfig::new(url).with_backoff(Duration::from_millis(50), Duration::from_millis(500))
}

fn text_of(doc: &SharedDocument) -> String {
    doc.lock().current_text().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loopback_sync_converges() {
    let (url, state) = start_server().await;
    let transport = SyncTransport::new(client_config(&url));

    let doc_a = ReplicatedDocument::new("demo", "main.rs").unwrap().into_shared();
    let doc_b = ReplicatedDocument::new("demo", "main.rs").unwrap().into_shared();

    let conn_a = transport.connect("demo");
    let conn_b = transport.connect("demo");
    conn_a.track("main.rs", doc_a.clone());
    conn_b.track("main.rs", doc_b.clone());

    // A ships through its update sink, B sends by hand
    let widget_a = Arc::new(Mutex::new(TextWidget::default()));
    let widget_b = Arc::new(Mutex::new(TextWidget::default()));
    let binder = Binder::new();
    let shared_a: SharedWidget = widget_a.clone();
    let shared_b: SharedWidget = widget_b.clone();
    let binding_a = binder.bind(shared_a, doc_a.clone());
    let binding_b = binder.bind(shared_b, doc_b.clone());

    let sender = conn_a.clone();
    binding_a.set_update_sink(move |update| {
        let _ = sender.send(update);
    });

    eventually("both replicas connected", || {
        conn_a.status() == ConnectionStatus::Connected && conn_b.status() == ConnectionStatus::Connected
    })
    .await;

    widget_a.lock().splice(0, 0, "hello");
    binding_a.handle_local_edit(0..0, "hello").unwrap();

    eventually("hello reaches B", || widget_b.lock().text() == "hello").await;
    widget_b.lock().splice(0, 0, "world");
    let from_b = binding_b.handle_local_edit(0..0, "world").unwrap().unwrap();
    conn_b.send(from_b).unwrap();

    eventually("replicas converge", || {
        text_of(&doc_a) == "worldhello" && text_of(&doc_b) == "worldhello"
    })
    .await;

    // Remote changes reached both widgets
    assert_eq!(widget_a.lock().text(), text_of(&doc_a));
    assert_eq!(widget_b.lock().text(), text_of(&doc_b));

    let session = state.server().registry().get("demo").unwrap();
    eventually("hub replica converges", || {
        session.file_text("main.rs").map(|t| t == text_of(&doc_a)).unwrap_or(false)
    })
    .await;
    assert_eq!(
        session.vcs().lock().get_status().unstaged,
        vec!["main.rs".to_string()]
    );

    conn_a.close();
    conn_b.close();
    binder.unbind(&binding_a);
    binder.unbind(&binding_b);
    assert!(binder.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_catches_up() {
    let (url, state) = start_server().await;
    let session = state.server().registry().create("demo", "Demo").unwrap();
    session.seed_file("app.tsx", "export default App;").unwrap();

    let transport = SyncTransport::new(client_config(&url));
    let doc = ReplicatedDocument::new("demo", "app.tsx").unwrap().into_shared();
    let conn = transport.connect("demo");
    conn.track("app.tsx", doc.clone());

    eventually("seeded text arrives", || text_of(&doc) == "export default App;").await;
    conn.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_edits_resync_after_reconnect() {
    let (addr, state) = serve().await;
    let link = FlakyLink::start(addr).await;
    let transport = SyncTransport::new(client_config(&link.url()));

    let doc = ReplicatedDocument::new("demo", "main.rs").unwrap().into_shared();
    let conn = transport.connect("demo");
    conn.track("main.rs", doc.clone());
    eventually("connected", || conn.status() == ConnectionStatus::Connected).await;

    let hub_text = || {
        state
            .server()
            .registry()
            .get("demo")
            .and_then(|session| session.file_text("main.rs").ok())
    };

    let first = doc.lock().apply_local_edit(0..0, "hello").unwrap();
    conn.send(first).unwrap();
    eventually("hub has hello", || hub_text().as_deref() == Some("hello")).await;

    link.cut();
    eventually("connection dropped", || conn.status() == ConnectionStatus::Reconnecting).await;

    let offline = doc.lock().apply_local_edit(5..5, " world").unwrap();
    conn.send(offline).unwrap();
    assert_eq!(conn.pending_updates(), 1);
    assert_eq!(hub_text().as_deref(), Some("hello"));

    link.restore();
    eventually("reconnected", || conn.status() == ConnectionStatus::Connected).await;
    eventually("hub catches up", || hub_text().as_deref() == Some("hello world")).await;
    assert_eq!(conn.pending_updates(), 0);
    assert_eq!(text_of(&doc), "hello world");

    conn.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn presence_is_relayed() {
    let (url, state) = start_server().await;

    let alice = PresenceChannel::new(client_config(&url));
    let bob = PresenceChannel::new(client_config(&url));
    alice.join("demo", Participant::new("alice", "Alice")).unwrap();
    bob.join("demo", Participant::new("bob", "Bob")).unwrap();

    eventually("both see each other", || {
        alice.participants().len() == 2 && bob.participants().len() == 2
    })
    .await;

    // The hub assigned a color and echoed it back, so both agree on it
    let color_of = |channel: &PresenceChannel| {
        channel
            .participants()
            .into_iter()
            .find(|p| p.id == "alice")
            .map(|p| p.color)
    };
    eventually("alice's color agrees", || {
        color_of(&alice).is_some() && color_of(&alice) == color_of(&bob)
    })
    .await;

    alice.set_active_file(Some("app.tsx".to_string()));
    alice.broadcast_cursor(CursorPosition::new(4, 2)).unwrap();

    eventually("bob sees alice's cursor", || {
        bob.participants().iter().any(|p| {
            p.id == "alice"
                && p.cursor == Some(CursorPosition::new(4, 2))
                && p.file_name.as_deref() == Some("app.tsx")
        })
    })
    .await;
    assert_eq!(state.server().presence().participants("demo").len(), 2);

    assert!(bob.leave("demo"));
    eventually("alice sees bob leave", || alice.participants().len() == 1).await;

    alice.leave("demo");
    eventually("hub is empty", || state.server().presence().participant_count() == 0).await;
}
