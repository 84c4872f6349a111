//! Real-time object synchronization core for multi-user 2-D canvases.
//!
//! Each participant runs a full replica: a per-field last-writer-wins object
//! store, a change observer bridging a rendering toolkit, local undo history,
//! ephemeral cursor presence, debounced snapshot persistence, and p2p sync
//! over iroh. Replicas exchange ops and snapshots; any two that have seen the
//! same set of ops hold identical state, whatever the delivery order.
//!
//! [`session::CanvasSession`] ties the pieces together for embedders; the
//! individual modules are usable on their own.

pub mod document;
pub mod history;
pub mod observer;
pub mod persistence;
pub mod presence;
pub mod session;
pub mod sync;

pub use document::{
    AttrValue, ChangeAction, ChangeEvent, Document, ObjectId, ObjectView, Origin, ReplicaId,
    RoomId, StoreError, VersionStamp, WireOp,
};
pub use history::HistoryManager;
pub use observer::{CanvasBridge, ChangeObserver, LocalEdit};
pub use persistence::{
    FsSnapshotStore, MemorySnapshotStore, PersistError, PersistenceService, SnapshotStore,
};
pub use presence::{PresenceMessage, PresenceTracker, UserId, UserIdentity};
pub use session::{CanvasSession, ConnectionStatus};
pub use sync::{SyncConfig, SyncEvent, SyncHandle, SyncMode};
