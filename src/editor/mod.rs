//! Editor integration.
//!
//! A text widget is adapted to a replicated document through a
//! [`BindingHandle`]:
//! - local edits become CRDT operations shipped to an update sink
//! - remote changes are spliced into the widget without echoing back
//! - remote cursors are tracked as CRDT anchors
//! - the local cursor is reported to a cursor sink as line/column
//!
//! Threading: remote changes reach the widget while the document is locked
//! (document before widget). Callers of `handle_local_edit` and
//! `handle_cursor_moved` must not hold the widget lock.

pub mod binding;

pub use binding::{Binder, BindingHandle};

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::sync::presence::CursorPosition;

/// The text component a document is bound to. Offsets are in chars.
pub trait EditorWidget: Send {
    /// Full widget content
    fn text(&self) -> String;

    /// Replace `deleted` chars at `position` with `inserted`.
    ///
    /// Implementations usually raise their own change event from here, which
    /// feeds back into [`BindingHandle::handle_local_edit`].
    fn splice(&mut self, position: usize, deleted: usize, inserted: &str);

    /// Draw the cursors of other participants
    fn render_remote_cursors(&mut self, cursors: &[RemoteCursor]);
}

pub type SharedWidget = Arc<Mutex<dyn EditorWidget>>;

/// Another participant's cursor, resolved against the current text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub participant_id: String,
    pub name: String,
    pub color: String,
    /// Char offset in the document
    pub offset: usize,
    pub position: CursorPosition,
}

/// 1-based line/column of a char offset; offsets past the end clamp to it
pub fn offset_to_position(text: &str, offset: usize) -> CursorPosition {
    let mut line = 1;
    let mut column = 1;
    for ch in text.chars().take(offset) {
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    CursorPosition { line, column }
}

/// Char offset of a 1-based line/column, clamped to the line and the text
pub fn position_to_offset(text: &str, position: CursorPosition) -> usize {
    let mut chars = text.chars();
    let mut offset = 0;

    let mut line = 1;
    while line < position.line.max(1) {
        match chars.next() {
            Some('\n') => {
                offset += 1;
                line += 1;
            }
            Some(_) => offset += 1,
            None => return offset,
        }
    }

    let mut column = 1;
    while column < position.column.max(1) {
        match chars.next() {
            Some('\n') | None => break,
            Some(_) => {
                offset += 1;
                column += 1;
            }
        }
    }
    offset
}
