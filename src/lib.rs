//! CodeCollab - real-time collaborative code editing core.
//!
//! - [`sync`]: Automerge-backed replicated documents, the binary sync protocol,
//!   the relay hub, the reconnecting client transport and presence
//! - [`editor`]: binding a text widget to a replicated document
//! - [`vcs`]: staged/committed version history driven by document changes
//! - [`session`]: the registry of sessions owning documents and history
//! - [`app`]: HTTP and WebSocket routes of the server binary

pub mod app;
pub mod config;
pub mod editor;
pub mod session;
pub mod sync;
pub mod vcs;

pub use config::ServerConfig;
pub use editor::{Binder, BindingHandle, EditorWidget};
pub use session::{Session, SessionRegistry};
pub use sync::presence_client::PresenceChannel;
pub use sync::{ReplicatedDocument, SyncServer, SyncTransport, SyncUpdate, TransportConfig};
pub use vcs::VersionControl;
