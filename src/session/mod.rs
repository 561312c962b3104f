//! Collaboration sessions.
//!
//! A session owns the replicated documents of its files and one version
//! control state machine. Every document is subscribed to at creation so that
//! each change marks its file in the session's VCS.

mod registry;

pub use registry::SessionRegistry;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::sync::document::{DocumentError, DocumentResult, ReplicatedDocument, SharedDocument, SyncUpdate};
use crate::sync::SessionId;
use crate::vcs::{VcsError, VersionControl};

/// Errors that can occur during session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("Session {id} already has {max} replicas")]
    SessionFull { id: SessionId, max: usize },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Version control error: {0}")]
    Vcs(#[from] VcsError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// One collaboration session
pub struct Session {
    id: SessionId,
    name: String,
    documents: DashMap<String, SharedDocument>,
    vcs: Arc<Mutex<VersionControl>>,
    replicas: AtomicUsize,
    /// Set while no replica is attached
    idle_since: Mutex<Option<Instant>>,
    created_at: i64,
}

impl Session {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            documents: DashMap::new(),
            vcs: Arc::new(Mutex::new(VersionControl::new())),
            replicas: AtomicUsize::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version control of this session.
    ///
    /// Lock order is document before VCS; never lock a document while holding this.
    pub fn vcs(&self) -> &Arc<Mutex<VersionControl>> {
        &self.vcs
    }

    /// The authoritative replica of `file_name`, created on first use
    pub fn document(&self, file_name: &str) -> DocumentResult<SharedDocument> {
        if let Some(doc) = self.documents.get(file_name) {
            return Ok(doc.clone());
        }
        let doc = self.create_document(file_name, None)?;
        Ok(self.documents.entry(file_name.to_string()).or_insert(doc).clone())
    }

    /// Load generated source into a file.
    ///
    /// New files start untracked; returns `None` if the file already had content.
    pub fn seed_file(&self, file_name: &str, text: &str) -> DocumentResult<Option<SyncUpdate>> {
        if let Some(doc) = self.documents.get(file_name).map(|doc| doc.clone()) {
            let seeded = doc.lock().seed(text);
            return seeded;
        }

        let doc = self.create_document(file_name, Some(text))?;
        let update = doc.lock().full_update();
        self.documents.entry(file_name.to_string()).or_insert(doc);
        Ok(Some(update))
    }

    fn create_document(&self, file_name: &str, initial: Option<&str>) -> DocumentResult<SharedDocument> {
        let mut doc = ReplicatedDocument::new(self.id.clone(), file_name)?;
        if let Some(text) = initial {
            doc.seed(text)?;
        }

        let vcs = self.vcs.clone();
        doc.subscribe(move |_, event| {
            vcs.lock().on_document_changed(&event.file_name);
        });
        self.vcs.lock().track_new_file(file_name);

        debug!("Created document {}/{}", self.id, file_name);
        Ok(doc.into_shared())
    }

    pub fn has_file(&self, file_name: &str) -> bool {
        self.documents.contains_key(file_name)
    }

    /// Current text of a file, if it exists
    pub fn file_text(&self, file_name: &str) -> SessionResult<String> {
        let doc = self
            .documents
            .get(file_name)
            .map(|doc| doc.clone())
            .ok_or_else(|| SessionError::FileNotFound(file_name.to_string()))?;
        let text = doc.lock().current_text()?;
        Ok(text)
    }

    /// File names, sorted
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.documents.iter().map(|e| e.key().clone()).collect();
        files.sort();
        files
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.load(Ordering::SeqCst)
    }

    fn attach(&self) -> usize {
        *self.idle_since.lock() = None;
        self.replicas.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn detach(&self) -> usize {
        let remaining = self
            .replicas
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0);
        if remaining == 0 {
            *self.idle_since.lock() = Some(Instant::now());
        }
        remaining
    }

    /// How long the session has had no replicas, if it has none
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        if self.replica_count() > 0 {
            return None;
        }
        self.idle_since.lock().map(|since| since.elapsed())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            files: self.files(),
            replicas: self.replica_count(),
            created_at: self.created_at,
        }
    }
}

/// Listing entry for a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub files: Vec<String>,
    pub replicas: usize,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::FileStatus;

    #[test]
    fn test_seeded_file_is_untracked() {
        let session = Session::new("demo", "Demo");
        let update = session.seed_file("app.tsx", "export default App;").unwrap();
        assert!(update.is_some());

        assert_eq!(session.file_text("app.tsx").unwrap(), "export default App;");
        assert_eq!(
            session.vcs().lock().file_status("app.tsx"),
            Some(FileStatus::Untracked)
        );
    }

    #[test]
    fn test_edits_mark_file_unstaged() {
        let session = Session::new("demo", "Demo");
        session.seed_file("app.tsx", "hello").unwrap();

        let doc = session.document("app.tsx").unwrap();
        doc.lock().apply_local_edit(5..5, " world").unwrap();

        let status = session.vcs().lock().get_status();
        assert_eq!(status.unstaged, vec!["app.tsx"]);
        assert!(status.untracked.is_empty());
    }

    #[test]
    fn test_remote_updates_reach_vcs() {
        let session = Session::new("demo", "Demo");
        let doc = session.document("main.rs").unwrap();

        let mut client = ReplicatedDocument::new("demo", "main.rs").unwrap();
        let update = client.apply_local_edit(0..0, "fn main() {}").unwrap();
        doc.lock().apply_remote_update(&update).unwrap();

        assert_eq!(session.file_text("main.rs").unwrap(), "fn main() {}");
        assert_eq!(
            session.vcs().lock().file_status("main.rs"),
            Some(FileStatus::Unstaged)
        );
    }

    #[test]
    fn test_missing_file() {
        let session = Session::new("demo", "Demo");
        assert!(matches!(
            session.file_text("nope.rs"),
            Err(SessionError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_replica_accounting() {
        let session = Session::new("demo", "Demo");
        assert!(session.idle_for().is_some());
        assert_eq!(session.attach(), 1);
        assert_eq!(session.attach(), 2);
        assert!(session.idle_for().is_none());
        assert_eq!(session.detach(), 1);
        assert_eq!(session.detach(), 0);
        assert_eq!(session.detach(), 0);
        assert!(session.idle_for().is_some());
    }
}
