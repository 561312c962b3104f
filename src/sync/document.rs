//! Automerge-backed text replica for one file of a collaboration session.
//!
//! Every replica of a file starts from the same deterministic genesis change,
//! so all of them address the same Automerge text object. Local edits are
//! spliced synchronously and returned as a [`SyncUpdate`] for the transport to
//! ship; remote updates are decoded in full before anything is applied.

use automerge::{
    transaction::{CommitOptions, Transactable},
    ActorId, AutoCommit, Change, ChangeHash, ObjId, ObjType, ReadDoc, ROOT,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::{ListenerId, SessionId};

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Edit range {start}..{end} is out of bounds for text of length {len}")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Update addressed {found} but this replica holds {expected}")]
    WrongDocument { expected: String, found: String },
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// A document shared between the editor thread and the network tasks
pub type SharedDocument = Arc<Mutex<ReplicatedDocument>>;

/// Keys used in the Automerge document structure
mod keys {
    pub const CONTENT: &str = "content";
}

/// Actor that authors the genesis change on every replica
const GENESIS_ACTOR: &[u8] = b"codecollab-genesis";

/// Compact summary of the changes a replica has integrated (its Automerge heads)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(Vec<[u8; 32]>);

impl StateVector {
    pub fn from_heads(heads: &[ChangeHash]) -> Self {
        let mut hashes: Vec<[u8; 32]> = heads.iter().map(|h| h.0).collect();
        hashes.sort_unstable();
        Self(hashes)
    }

    pub fn heads(&self) -> Vec<ChangeHash> {
        self.0.iter().map(|bytes| ChangeHash(*bytes)).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A batch of encoded CRDT changes plus the sender's state vector.
///
/// Applying an update is idempotent and order-insensitive: changes already
/// integrated are skipped, changes with missing dependencies wait in the
/// document until their dependencies arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUpdate {
    pub session_id: SessionId,
    pub file_name: String,
    pub state_vector: StateVector,
    /// Raw Automerge change chunks
    pub operations: Vec<Vec<u8>>,
}

impl SyncUpdate {
    pub fn new(
        session_id: impl Into<String>,
        file_name: impl Into<String>,
        state_vector: StateVector,
        operations: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            file_name: file_name.into(),
            state_vector,
            operations,
        }
    }

    /// An update carrying only the state vector
    pub fn state_only(
        session_id: impl Into<String>,
        file_name: impl Into<String>,
        state_vector: StateVector,
    ) -> Self {
        Self::new(session_id, file_name, state_vector, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn byte_len(&self) -> usize {
        self.operations.iter().map(Vec::len).sum()
    }
}

/// Where a mutation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// A single splice in char offsets: `deleted` chars at `position` replaced by `inserted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    pub position: usize,
    pub deleted: usize,
    pub inserted: String,
}

impl TextDelta {
    pub fn inserted_len(&self) -> usize {
        self.inserted.chars().count()
    }

    /// Map an offset from before this splice to after it.
    ///
    /// Offsets before the splice stay put, offsets at or after its end shift by
    /// the length delta, offsets inside the deleted span collapse to its start.
    pub fn transform_offset(&self, offset: usize) -> usize {
        if offset < self.position {
            offset
        } else if offset >= self.position + self.deleted {
            offset + self.inserted_len() - self.deleted
        } else {
            self.position
        }
    }
}

/// The "document-changed" event raised after every mutation that altered the text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChanged {
    pub session_id: SessionId,
    pub file_name: String,
    pub origin: ChangeOrigin,
    pub delta: TextDelta,
}

/// Stable position in the text that survives concurrent edits
#[derive(Debug, Clone)]
pub enum Anchor {
    /// Immediately before the character the cursor was created on
    Before(automerge::Cursor),
    /// After the last character
    End,
}

type Listener = Arc<dyn Fn(&ReplicatedDocument, &DocumentChanged) + Send + Sync>;

/// One replica of a session file
pub struct ReplicatedDocument {
    /// The underlying Automerge document
    doc: AutoCommit,
    /// The text object holding the file content
    text_id: ObjId,
    session_id: SessionId,
    file_name: String,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: ListenerId,
}

impl ReplicatedDocument {
    /// Create a fresh replica with a random actor
    pub fn new(session_id: impl Into<String>, file_name: impl Into<String>) -> DocumentResult<Self> {
        Self::with_actor(session_id, file_name, ActorId::random())
    }

    /// Create a replica with a specific actor ID
    pub fn with_actor(
        session_id: impl Into<String>,
        file_name: impl Into<String>,
        actor: ActorId,
    ) -> DocumentResult<Self> {
        let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR));
        let text_id = doc.put_object(ROOT, keys::CONTENT, ObjType::Text)?;
        // Fixed timestamp keeps the genesis change byte-identical on every replica
        doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(actor);

        Ok(Self {
            doc,
            text_id,
            session_id: session_id.into(),
            file_name: file_name.into(),
            listeners: Vec::new(),
            next_listener: 1,
        })
    }

    /// Wrap the replica for sharing with the transport and editor binding
    pub fn into_shared(self) -> SharedDocument {
        Arc::new(Mutex::new(self))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Hex encoding of this replica's actor
    pub fn replica_id(&self) -> String {
        self.doc.get_actor().to_string()
    }

    /// Current text content
    pub fn current_text(&self) -> DocumentResult<String> {
        Ok(self.doc.text(&self.text_id)?)
    }

    /// Length of the text in chars
    pub fn len(&self) -> usize {
        self.doc.length(&self.text_id)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_vector(&mut self) -> StateVector {
        StateVector::from_heads(&self.doc.get_heads())
    }

    /// Replace the chars in `range` with `new_text`.
    ///
    /// Mutates local state synchronously and returns the update to ship.
    pub fn apply_local_edit(&mut self, range: Range<usize>, new_text: &str) -> DocumentResult<SyncUpdate> {
        let len = self.len();
        if range.start > range.end || range.end > len {
            return Err(DocumentError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                len,
            });
        }

        let before = self.doc.get_heads();
        if range.is_empty() && new_text.is_empty() {
            return Ok(SyncUpdate::state_only(
                self.session_id.clone(),
                self.file_name.clone(),
                StateVector::from_heads(&before),
            ));
        }

        let deleted = range.end - range.start;
        self.doc
            .splice_text(&self.text_id, range.start, deleted as isize, new_text)?;

        let operations = self.encoded_changes_since(&before);
        let update = SyncUpdate::new(
            self.session_id.clone(),
            self.file_name.clone(),
            self.state_vector(),
            operations,
        );

        self.emit(&DocumentChanged {
            session_id: self.session_id.clone(),
            file_name: self.file_name.clone(),
            origin: ChangeOrigin::Local,
            delta: TextDelta {
                position: range.start,
                deleted,
                inserted: new_text.to_string(),
            },
        });

        Ok(update)
    }

    /// Integrate an update from another replica.
    ///
    /// Every operation is decoded and checksum-validated before any is applied,
    /// so a corrupt batch leaves the document untouched. Returns whether the
    /// visible text changed.
    pub fn apply_remote_update(&mut self, update: &SyncUpdate) -> DocumentResult<bool> {
        if update.session_id != self.session_id || update.file_name != self.file_name {
            return Err(DocumentError::WrongDocument {
                expected: format!("{}/{}", self.session_id, self.file_name),
                found: format!("{}/{}", update.session_id, update.file_name),
            });
        }

        let mut changes = Vec::with_capacity(update.operations.len());
        for (index, raw) in update.operations.iter().enumerate() {
            let change = Change::from_bytes(raw.clone()).map_err(|e| {
                warn!(
                    "Dropping update for {}/{}: operation {} is corrupt: {}",
                    self.session_id, self.file_name, index, e
                );
                DocumentError::MalformedUpdate(format!("operation {}: {}", index, e))
            })?;
            changes.push(change);
        }

        if changes.is_empty() {
            return Ok(false);
        }

        let before = self.current_text()?;
        self.doc.apply_changes(changes)?;
        let after = self.current_text()?;

        match diff_text(&before, &after) {
            Some(delta) => {
                debug!(
                    "Applied remote update to {}/{}: {} ops",
                    self.session_id,
                    self.file_name,
                    update.operation_count()
                );
                self.emit(&DocumentChanged {
                    session_id: self.session_id.clone(),
                    file_name: self.file_name.clone(),
                    origin: ChangeOrigin::Remote,
                    delta,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The changes a replica with `state_vector` is missing.
    ///
    /// Heads this replica has never seen are ignored, which can only widen the
    /// result; resending known changes is harmless.
    pub fn updates_since(&mut self, state_vector: &StateVector) -> SyncUpdate {
        let known: Vec<ChangeHash> = state_vector
            .heads()
            .into_iter()
            .filter(|hash| self.doc.get_change_by_hash(hash).is_some())
            .collect();

        let operations = self.encoded_changes_since(&known);
        SyncUpdate::new(
            self.session_id.clone(),
            self.file_name.clone(),
            self.state_vector(),
            operations,
        )
    }

    /// Every change this replica holds
    pub fn full_update(&mut self) -> SyncUpdate {
        self.updates_since(&StateVector::default())
    }

    /// One-shot initialization with generated source text.
    ///
    /// Only seeds an empty document; returns `None` if it already has content.
    pub fn seed(&mut self, text: &str) -> DocumentResult<Option<SyncUpdate>> {
        if !self.is_empty() {
            return Ok(None);
        }
        self.apply_local_edit(0..0, text).map(Some)
    }

    /// Anchor a char offset so it can be re-resolved after further edits
    pub fn anchor(&self, position: usize) -> DocumentResult<Anchor> {
        if position >= self.len() {
            return Ok(Anchor::End);
        }
        let cursor = self.doc.get_cursor(&self.text_id, position, None)?;
        Ok(Anchor::Before(cursor))
    }

    /// Current char offset of an anchor
    pub fn resolve_anchor(&self, anchor: &Anchor) -> DocumentResult<usize> {
        match anchor {
            Anchor::End => Ok(self.len()),
            Anchor::Before(cursor) => {
                let position = self.doc.get_cursor_position(&self.text_id, cursor, None)?;
                Ok(position.min(self.len()))
            }
        }
    }

    /// Register a document-changed listener.
    ///
    /// Listeners run synchronously after the mutation while the caller still
    /// holds the document, so they must not lock it again.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&ReplicatedDocument, &DocumentChanged) + Send + Sync + 'static,
    {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() < before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn encoded_changes_since(&mut self, heads: &[ChangeHash]) -> Vec<Vec<u8>> {
        self.doc
            .get_changes(heads)
            .into_iter()
            .map(|change| change.raw_bytes().to_vec())
            .collect()
    }

    fn emit(&self, event: &DocumentChanged) {
        for (_, listener) in &self.listeners {
            listener(self, event);
        }
    }
}

/// Minimal splice turning `before` into `after`, in char offsets
pub fn diff_text(before: &str, after: &str) -> Option<TextDelta> {
    if before == after {
        return None;
    }

    let old: Vec<char> = before.chars().collect();
    let new: Vec<char> = after.chars().collect();

    let prefix = old.iter().zip(new.iter()).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    Some(TextDelta {
        position: prefix,
        deleted: old.len() - prefix - suffix,
        inserted: new[prefix..new.len() - suffix].iter().collect(),
    })
}
