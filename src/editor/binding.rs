//! Two-way binding between an editor widget and a replicated document.
//!
//! Local edits flow widget -> document -> update sink. Remote changes flow
//! document -> widget under a per-thread guard so the widget's own change
//! event does not turn them back into local edits.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

use super::{offset_to_position, position_to_offset, RemoteCursor, SharedWidget};
use crate::sync::document::{
    Anchor, ChangeOrigin, DocumentChanged, DocumentResult, ReplicatedDocument, SharedDocument,
    SyncUpdate,
};
use crate::sync::presence::{Collaborator, CursorPosition};
use crate::sync::ListenerId;

/// Receives updates produced by local edits, normally the sync transport
pub type UpdateSink = Arc<dyn Fn(SyncUpdate) + Send + Sync>;

/// Receives local cursor moves, normally the presence channel
pub type CursorSink = Arc<dyn Fn(CursorPosition) + Send + Sync>;

struct TrackedCursor {
    name: String,
    color: String,
    anchor: Anchor,
}

struct BindingInner {
    document: SharedDocument,
    widget: SharedWidget,
    listener: Mutex<Option<ListenerId>>,
    /// Thread currently splicing a remote change into the widget
    applying_remote: Mutex<Option<ThreadId>>,
    update_sink: Mutex<Option<UpdateSink>>,
    cursor_sink: Mutex<Option<CursorSink>>,
    remote_cursors: Mutex<BTreeMap<String, TrackedCursor>>,
    released: AtomicBool,
}

impl BindingInner {
    fn is_applying_remote(&self) -> bool {
        *self.applying_remote.lock() == Some(thread::current().id())
    }

    fn resolve_cursors(&self, doc: &ReplicatedDocument) -> Vec<RemoteCursor> {
        let text = doc.current_text().unwrap_or_default();
        self.remote_cursors
            .lock()
            .iter()
            .filter_map(|(id, cursor)| {
                let offset = doc.resolve_anchor(&cursor.anchor).ok()?;
                Some(RemoteCursor {
                    participant_id: id.clone(),
                    name: cursor.name.clone(),
                    color: cursor.color.clone(),
                    offset,
                    position: offset_to_position(&text, offset),
                })
            })
            .collect()
    }

    /// Runs under the document lock
    fn on_document_changed(&self, doc: &ReplicatedDocument, event: &DocumentChanged) {
        if self.released.load(Ordering::SeqCst) || event.origin != ChangeOrigin::Remote {
            return;
        }

        let cursors = self.resolve_cursors(doc);
        let mut widget = self.widget.lock();
        *self.applying_remote.lock() = Some(thread::current().id());
        widget.splice(
            event.delta.position,
            event.delta.deleted,
            &event.delta.inserted,
        );
        *self.applying_remote.lock() = None;
        widget.render_remote_cursors(&cursors);
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.listener.lock().take() {
            self.document.lock().unsubscribe(id);
        }
        *self.update_sink.lock() = None;
        *self.cursor_sink.lock() = None;
        self.remote_cursors.lock().clear();
    }
}

/// A live widget/document binding; clones refer to the same binding
#[derive(Clone)]
pub struct BindingHandle {
    inner: Arc<BindingInner>,
}

impl BindingHandle {
    pub fn document(&self) -> &SharedDocument {
        &self.inner.document
    }

    pub fn is_bound(&self) -> bool {
        !self.inner.released.load(Ordering::SeqCst)
    }

    pub fn set_update_sink<F>(&self, sink: F)
    where
        F: Fn(SyncUpdate) + Send + Sync + 'static,
    {
        *self.inner.update_sink.lock() = Some(Arc::new(sink));
    }

    pub fn set_cursor_sink<F>(&self, sink: F)
    where
        F: Fn(CursorPosition) + Send + Sync + 'static,
    {
        *self.inner.cursor_sink.lock() = Some(Arc::new(sink));
    }

    /// Entry point for the widget's change event.
    ///
    /// Returns `None` for echoes of remote splices and for released bindings.
    pub fn handle_local_edit(
        &self,
        range: Range<usize>,
        new_text: &str,
    ) -> DocumentResult<Option<SyncUpdate>> {
        if !self.is_bound() || self.inner.is_applying_remote() {
            return Ok(None);
        }

        let (update, cursors) = {
            let mut doc = self.inner.document.lock();
            let update = doc.apply_local_edit(range, new_text)?;
            let cursors = if self.inner.remote_cursors.lock().is_empty() {
                None
            } else {
                Some(self.inner.resolve_cursors(&doc))
            };
            (update, cursors)
        };
        if update.is_empty() {
            return Ok(None);
        }

        // Anchors moved with the edit, the overlay has to follow
        if let Some(cursors) = cursors {
            self.inner.widget.lock().render_remote_cursors(&cursors);
        }

        let sink = self.inner.update_sink.lock().clone();
        if let Some(sink) = sink {
            sink(update.clone());
        }
        Ok(Some(update))
    }

    /// Entry point for the widget's cursor event; `offset` is in chars
    pub fn handle_cursor_moved(&self, offset: usize) -> Option<CursorPosition> {
        if !self.is_bound() {
            return None;
        }

        let text = match self.inner.document.lock().current_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot read document for cursor update: {}", e);
                return None;
            }
        };
        let position = offset_to_position(&text, offset);

        let sink = self.inner.cursor_sink.lock().clone();
        if let Some(sink) = sink {
            sink(position);
        }
        Some(position)
    }

    /// Place or move another participant's cursor
    pub fn set_remote_cursor(
        &self,
        participant_id: &str,
        name: &str,
        color: &str,
        position: CursorPosition,
    ) -> DocumentResult<()> {
        if !self.is_bound() {
            return Ok(());
        }

        let cursors = {
            let doc = self.inner.document.lock();
            let text = doc.current_text()?;
            let anchor = doc.anchor(position_to_offset(&text, position))?;
            self.inner.remote_cursors.lock().insert(
                participant_id.to_string(),
                TrackedCursor {
                    name: name.to_string(),
                    color: color.to_string(),
                    anchor,
                },
            );
            self.inner.resolve_cursors(&doc)
        };
        self.inner.widget.lock().render_remote_cursors(&cursors);
        Ok(())
    }

    pub fn remove_remote_cursor(&self, participant_id: &str) -> bool {
        let removed = self.inner.remote_cursors.lock().remove(participant_id).is_some();
        if removed {
            let cursors = self.remote_cursors();
            self.inner.widget.lock().render_remote_cursors(&cursors);
        }
        removed
    }

    /// Mirror a presence snapshot: place everyone with a cursor, drop the rest
    pub fn sync_participants(&self, participants: &[Collaborator], local_id: &str) -> DocumentResult<()> {
        if !self.is_bound() {
            return Ok(());
        }

        let present: HashMap<&str, &Collaborator> = participants
            .iter()
            .filter(|p| p.id != local_id && p.cursor.is_some())
            .map(|p| (p.id.as_str(), p))
            .collect();

        let cursors = {
            let doc = self.inner.document.lock();
            let text = doc.current_text()?;
            let mut tracked = self.inner.remote_cursors.lock();
            tracked.retain(|id, _| present.contains_key(id.as_str()));
            for (id, participant) in &present {
                if let Some(position) = participant.cursor {
                    let anchor = doc.anchor(position_to_offset(&text, position))?;
                    tracked.insert(
                        id.to_string(),
                        TrackedCursor {
                            name: participant.name.clone(),
                            color: participant.color.clone(),
                            anchor,
                        },
                    );
                }
            }
            drop(tracked);
            self.inner.resolve_cursors(&doc)
        };
        self.inner.widget.lock().render_remote_cursors(&cursors);
        Ok(())
    }

    /// Remote cursors resolved against the current text
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let doc = self.inner.document.lock();
        self.inner.resolve_cursors(&doc)
    }
}

/// Registry of live bindings so that binding the same pair twice is a no-op
#[derive(Default)]
pub struct Binder {
    bindings: Mutex<HashMap<(usize, usize), BindingHandle>>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(widget: &SharedWidget, document: &SharedDocument) -> (usize, usize) {
        (
            Arc::as_ptr(widget) as *const () as usize,
            Arc::as_ptr(document) as *const () as usize,
        )
    }

    /// Bind a widget to a document, bringing the widget up to the document text
    pub fn bind(&self, widget: SharedWidget, document: SharedDocument) -> BindingHandle {
        let key = Self::key(&widget, &document);
        let mut bindings = self.bindings.lock();
        if let Some(existing) = bindings.get(&key) {
            if existing.is_bound() {
                return existing.clone();
            }
        }

        let inner = Arc::new(BindingInner {
            document: document.clone(),
            widget: widget.clone(),
            listener: Mutex::new(None),
            applying_remote: Mutex::new(None),
            update_sink: Mutex::new(None),
            cursor_sink: Mutex::new(None),
            remote_cursors: Mutex::new(BTreeMap::new()),
            released: AtomicBool::new(false),
        });

        let (session_id, file_name, replica) = {
            let mut doc = document.lock();
            let weak: Weak<BindingInner> = Arc::downgrade(&inner);
            let id = doc.subscribe(move |doc, event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_document_changed(doc, event);
                }
            });
            *inner.listener.lock() = Some(id);

            let text = doc.current_text().unwrap_or_default();
            let mut widget = widget.lock();
            let current = widget.text();
            if current != text {
                *inner.applying_remote.lock() = Some(thread::current().id());
                widget.splice(0, current.chars().count(), &text);
                *inner.applying_remote.lock() = None;
            }
            (
                doc.session_id().to_string(),
                doc.file_name().to_string(),
                doc.replica_id(),
            )
        };

        debug!("Bound widget to {}/{} (replica {})", session_id, file_name, replica);
        let handle = BindingHandle { inner };
        bindings.insert(key, handle.clone());
        handle
    }

    /// Detach a binding; unknown or already released handles are ignored
    pub fn unbind(&self, handle: &BindingHandle) {
        self.bindings.lock().retain(|_, bound| !Arc::ptr_eq(&bound.inner, &handle.inner));
        handle.inner.release();
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::EditorWidget;
    use crate::sync::document::ReplicatedDocument;

    /// Widget that raises its change event from `splice`, like a real editor
    #[derive(Default)]
    struct MockWidget {
        chars: Vec<char>,
        binding: Option<BindingHandle>,
        echoed_updates: usize,
        rendered: Vec<RemoteCursor>,
    }

    impl MockWidget {
        fn type_text(widget: &Arc<Mutex<MockWidget>>, position: usize, text: &str) -> Option<SyncUpdate> {
            let binding = {
                let mut w = widget.lock();
                w.chars.splice(position..position, text.chars());
                w.binding.clone()
            };
            binding.and_then(|b| b.handle_local_edit(position..position, text).unwrap())
        }
    }

    impl EditorWidget for MockWidget {
        fn text(&self) -> String {
            self.chars.iter().collect()
        }

        fn splice(&mut self, position: usize, deleted: usize, inserted: &str) {
            self.chars.splice(position..position + deleted, inserted.chars());
            if let Some(binding) = &self.binding {
                let echoed = binding
                    .handle_local_edit(position..position + deleted, inserted)
                    .unwrap();
                if echoed.is_some() {
                    self.echoed_updates += 1;
                }
            }
        }

        fn render_remote_cursors(&mut self, cursors: &[RemoteCursor]) {
            self.rendered = cursors.to_vec();
        }
    }

    fn setup(text: &str) -> (Binder, Arc<Mutex<MockWidget>>, SharedDocument, BindingHandle) {
        let mut doc = ReplicatedDocument::new("demo", "app.tsx").unwrap();
        doc.seed(text).unwrap();
        let doc = doc.into_shared();
        let widget = Arc::new(Mutex::new(MockWidget::default()));
        let binder = Binder::new();
        let handle = binder.bind(widget.clone(), doc.clone());
        widget.lock().binding = Some(handle.clone());
        (binder, widget, doc, handle)
    }

    #[test]
    fn test_bind_loads_document_text() {
        let (_binder, widget, _doc, _handle) = setup("const x = 1;");
        assert_eq!(widget.lock().text(), "const x = 1;");
    }

    #[test]
    fn test_local_edit_reaches_document_and_sink() {
        let (_binder, widget, doc, handle) = setup("ab");
        let shipped = Arc::new(Mutex::new(Vec::new()));
        let sink = shipped.clone();
        handle.set_update_sink(move |update| sink.lock().push(update));

        let update = MockWidget::type_text(&widget, 1, "X").unwrap();
        assert!(!update.is_empty());
        assert_eq!(doc.lock().current_text().unwrap(), "aXb");
        assert_eq!(shipped.lock().len(), 1);
    }

    #[test]
    fn test_remote_update_is_spliced_without_echo() {
        let (_binder, widget, doc, handle) = setup("hello");
        let shipped = Arc::new(Mutex::new(0usize));
        let sink = shipped.clone();
        handle.set_update_sink(move |_| *sink.lock() += 1);

        let mut remote = ReplicatedDocument::new("demo", "app.tsx").unwrap();
        remote.apply_remote_update(&doc.lock().full_update()).unwrap();
        let update = remote.apply_local_edit(5..5, " world").unwrap();

        doc.lock().apply_remote_update(&update).unwrap();

        let w = widget.lock();
        assert_eq!(w.text(), "hello world");
        assert_eq!(w.echoed_updates, 0);
        assert_eq!(*shipped.lock(), 0);
    }

    #[test]
    fn test_remote_cursor_shifts_with_insert_before_it() {
        let (_binder, widget, doc, handle) = setup("line one\nline two");
        handle
            .set_remote_cursor("bob", "Bob", "#22c55e", CursorPosition::new(2, 6))
            .unwrap();
        let before = handle.remote_cursors()[0].offset;
        assert_eq!(before, 14);

        // Insert of length 4 at a position before the cursor
        MockWidget::type_text(&widget, 0, "new ");
        assert_eq!(handle.remote_cursors()[0].offset, before + 4);
        assert_eq!(widget.lock().rendered[0].offset, before + 4);

        // Insert after the cursor leaves it in place
        let len = doc.lock().len();
        MockWidget::type_text(&widget, len, "!");
        assert_eq!(handle.remote_cursors()[0].offset, before + 4);
        assert_eq!(handle.remote_cursors()[0].position, CursorPosition::new(2, 6));
        assert_eq!(widget.lock().rendered[0].offset, before + 4);
    }

    #[test]
    fn test_remote_cursor_moves_with_remote_insert() {
        let (_binder, widget, doc, handle) = setup("abcdef");
        handle
            .set_remote_cursor("bob", "Bob", "#22c55e", CursorPosition::new(1, 4))
            .unwrap();

        let mut remote = ReplicatedDocument::new("demo", "app.tsx").unwrap();
        remote.apply_remote_update(&doc.lock().full_update()).unwrap();
        let update = remote.apply_local_edit(0..0, "12").unwrap();
        doc.lock().apply_remote_update(&update).unwrap();

        let rendered = widget.lock().rendered.clone();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].offset, 5);
    }

    #[test]
    fn test_cursor_moves_reach_sink() {
        let (_binder, _widget, _doc, handle) = setup("ab\ncd");
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        handle.set_cursor_sink(move |position| *sink.lock() = Some(position));

        assert_eq!(handle.handle_cursor_moved(4), Some(CursorPosition::new(2, 2)));
        assert_eq!(*seen.lock(), Some(CursorPosition::new(2, 2)));
    }

    #[test]
    fn test_sync_participants_drops_departed() {
        let (_binder, widget, _doc, handle) = setup("abc");
        let mut bob = Collaborator::new("bob", "Bob", "#22c55e");
        bob.cursor = Some(CursorPosition::new(1, 2));
        let mut me = Collaborator::new("me", "Me", "#3b82f6");
        me.cursor = Some(CursorPosition::new(1, 1));

        handle.sync_participants(&[bob.clone(), me], "me").unwrap();
        assert_eq!(widget.lock().rendered.len(), 1);
        assert_eq!(widget.lock().rendered[0].participant_id, "bob");

        handle.sync_participants(&[], "me").unwrap();
        assert!(widget.lock().rendered.is_empty());
        assert!(!handle.remove_remote_cursor("bob"));
    }

    #[test]
    fn test_bind_is_idempotent_and_unbind_releases() {
        let (binder, widget, doc, handle) = setup("abc");
        let shared: SharedWidget = widget.clone();
        let again = binder.bind(shared, doc.clone());
        assert!(Arc::ptr_eq(&again.inner, &handle.inner));
        assert_eq!(binder.len(), 1);
        assert_eq!(doc.lock().listener_count(), 1);

        binder.unbind(&handle);
        binder.unbind(&handle);
        assert!(binder.is_empty());
        assert!(!handle.is_bound());
        assert_eq!(doc.lock().listener_count(), 0);

        // A released binding no longer forwards edits
        assert!(handle.handle_local_edit(0..0, "x").unwrap().is_none());
        assert_eq!(doc.lock().current_text().unwrap(), "abc");
    }
}
