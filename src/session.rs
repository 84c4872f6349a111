//! Per-replica session facade.
//!
//! One `CanvasSession` owns the full stack for one user in one room: the
//! document, the change observer, undo history, presence, persistence, and
//! the sync handle. The embedding application drives it from its UI loop:
//! local edits in, `poll` once per frame, remote changes out through the
//! [`CanvasBridge`].

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::document::{
    AttrValue, Document, ObjectId, Origin, ReplicaId, RoomId, StoreError, WireOp,
};
use crate::history::{self, HistoryManager};
use crate::observer::{CanvasBridge, ChangeObserver, LocalEdit};
use crate::persistence::{PersistError, PersistenceService};
use crate::presence::{MoveThrottle, PresenceMessage, PresenceTracker, UserId, UserIdentity};
use crate::sync::{start_sync_thread, SyncCommand, SyncConfig, SyncEvent, SyncHandle, SyncMode};

/// Connection state surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

/// Everything one replica needs to participate in a room.
pub struct CanvasSession {
    doc: Document,
    observer: ChangeObserver,
    history: HistoryManager,
    presence: PresenceTracker,
    move_throttle: MoveThrottle,
    persistence: PersistenceService,
    identity: UserIdentity,
    sync: Option<SyncHandle>,
    status: ConnectionStatus,
    ticket: Option<String>,
    /// Ops minted while the peer link was down, flushed on reconnect.
    offline_queue: Vec<WireOp>,
}

impl CanvasSession {
    /// Create a session and hydrate the document from storage if a snapshot
    /// exists. Corrupt storage is an error; missing storage is a fresh room.
    pub fn new(
        room: RoomId,
        identity: UserIdentity,
        persistence: PersistenceService,
    ) -> Result<Self, PersistError> {
        let mut doc = Document::new(room, ReplicaId::new());
        persistence.load(&mut doc)?;
        Ok(Self {
            doc,
            observer: ChangeObserver::new(),
            history: HistoryManager::default(),
            presence: PresenceTracker::new(UserId::new()),
            move_throttle: MoveThrottle::default(),
            persistence,
            identity,
            sync: None,
            status: ConnectionStatus::Disconnected,
            ticket: None,
            offline_queue: Vec::new(),
        })
    }

    // --- Networking lifecycle ---

    /// Start the sync thread, optionally joining a peer by ticket, and
    /// announce our presence.
    pub fn connect(&mut self, join_ticket: Option<String>) -> Result<()> {
        let handle = start_sync_thread(SyncConfig {
            room: self.doc.room(),
            replica: self.doc.replica(),
            user: self.presence.local_user(),
            mode: SyncMode::Active { join_ticket },
            initial_snapshot: Some(self.doc.snapshot()),
        })?;
        self.ticket = handle.ticket.clone();
        handle.send_command(SyncCommand::BroadcastPresence(PresenceMessage::Join {
            room: self.doc.room(),
            user: self.presence.local_user(),
            name: self.identity.name.clone(),
            color: self.identity.color.clone(),
        }))?;
        self.sync = Some(handle);
        self.status = ConnectionStatus::Connected;
        info!(room = %self.doc.room(), "session connected");
        Ok(())
    }

    /// Teardown: announce leave, save once best-effort, stop sync.
    pub fn close(&mut self) {
        if let Some(sync) = self.sync.take() {
            let _ = sync.send_command(SyncCommand::Shutdown);
        }
        self.persistence.save_on_teardown(&self.doc);
        self.status = ConnectionStatus::Disconnected;
    }

    // --- Local edits ---

    /// Create an object from toolkit attributes. Returns the new id, or None
    /// if the edit was deferred past an in-flight merge cycle.
    pub fn add_object(
        &mut self,
        attrs: BTreeMap<String, AttrValue>,
        now: Instant,
    ) -> Result<Option<ObjectId>, StoreError> {
        self.local_edit(LocalEdit::Add { attrs }, now)
    }

    /// Overwrite fields of an object. `continuous` marks drag-style updates
    /// for coalescing.
    pub fn modify_object(
        &mut self,
        id: ObjectId,
        changes: BTreeMap<String, AttrValue>,
        continuous: bool,
        now: Instant,
    ) -> Result<(), StoreError> {
        self.local_edit(
            LocalEdit::Modify {
                id,
                changes,
                continuous,
            },
            now,
        )?;
        Ok(())
    }

    pub fn remove_object(&mut self, id: ObjectId, now: Instant) -> Result<(), StoreError> {
        self.local_edit(LocalEdit::Remove { id }, now)?;
        Ok(())
    }

    /// Apply a batch of edits as one undoable transaction; a later single
    /// undo reverts all of them together.
    pub fn apply_batch(&mut self, edits: Vec<LocalEdit>, now: Instant) -> Result<(), StoreError> {
        if !self.observer.enter_cycle() {
            for edit in edits {
                self.observer.defer(edit);
            }
            return Ok(());
        }
        self.history.begin();
        let mut result = Ok(());
        for edit in edits {
            if let Err(e) = self.perform(edit, now) {
                result = Err(e);
                break;
            }
        }
        self.history.commit();
        self.observer.exit_cycle();
        self.process_deferred(now)?;
        result
    }

    fn local_edit(
        &mut self,
        edit: LocalEdit,
        now: Instant,
    ) -> Result<Option<ObjectId>, StoreError> {
        if !self.observer.enter_cycle() {
            self.observer.defer(edit);
            return Ok(None);
        }
        self.history.begin();
        let result = self.perform(edit, now);
        self.history.commit();
        self.observer.exit_cycle();
        self.process_deferred(now)?;
        result
    }

    /// Execute one edit inside an open cycle and history transaction.
    fn perform(&mut self, edit: LocalEdit, now: Instant) -> Result<Option<ObjectId>, StoreError> {
        match edit {
            LocalEdit::Add { attrs } => {
                let (op, _event) = self.doc.create_object(attrs.clone())?;
                let id = op.object;
                self.history.record_create(id, attrs);
                self.forward(op, false, now);
                Ok(Some(id))
            }
            LocalEdit::Modify {
                id,
                changes,
                continuous,
            } => {
                let Some(view) = self.doc.get(id) else {
                    warn!(object = %id, "modify for unknown object dropped");
                    return Ok(None);
                };
                let (op, _event) = self.doc.update_object(id, changes.clone())?;
                for (field, after) in changes {
                    let before = view.attrs.get(&field).cloned();
                    self.history.record_update(id, &field, before, after);
                }
                self.forward(op, continuous, now);
                Ok(None)
            }
            LocalEdit::Remove { id } => {
                let Some(view) = self.doc.get(id) else {
                    warn!(object = %id, "remove for unknown object dropped");
                    return Ok(None);
                };
                let (op, _event) = self.doc.delete_object(id)?;
                self.history.record_delete(id, view.attrs);
                self.forward(op, false, now);
                Ok(None)
            }
        }
    }

    fn forward(&mut self, op: WireOp, continuous: bool, now: Instant) {
        self.persistence.mark_dirty();
        if let Some(op) = self.observer.forward_local(op, continuous, now) {
            self.send_op(op);
        }
    }

    /// Replay edits the toolkit fired during a merge cycle.
    fn process_deferred(&mut self, now: Instant) -> Result<(), StoreError> {
        loop {
            let deferred = self.observer.drain_deferred();
            if deferred.is_empty() {
                return Ok(());
            }
            for edit in deferred {
                self.local_edit(edit, now)?;
            }
        }
    }

    /// Signal the end of a drag; the final coalesced value goes out now.
    pub fn end_drag(&mut self, id: ObjectId, now: Instant) {
        if let Some(op) = self.observer.flush(id, now) {
            self.send_op(op);
        }
    }

    // --- Undo / redo ---

    /// Revert the most recent local transaction. Returns whether anything
    /// was undone.
    pub fn undo(&mut self, now: Instant) -> Result<bool, StoreError> {
        let Some(entry) = self.history.undo() else {
            return Ok(false);
        };
        let ops = history::apply_inverse(&entry, &mut self.doc)?;
        for (op, _event) in ops {
            self.forward(op, false, now);
        }
        debug!("undid transaction");
        Ok(true)
    }

    /// Re-apply the most recently undone transaction.
    pub fn redo(&mut self, now: Instant) -> Result<bool, StoreError> {
        let Some(entry) = self.history.redo() else {
            return Ok(false);
        };
        let ops = history::apply_forward(&entry, &mut self.doc)?;
        for (op, _event) in ops {
            self.forward(op, false, now);
        }
        debug!("redid transaction");
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // --- Presence ---

    /// Broadcast the local cursor position, rate limited. Blocked moves are
    /// dropped silently.
    pub fn move_cursor(&mut self, x: f64, y: f64, now: Instant) {
        if !self.move_throttle.allow(now) {
            return;
        }
        if let Some(sync) = &self.sync {
            let _ = sync.send_command(SyncCommand::BroadcastPresence(PresenceMessage::Move {
                user: self.presence.local_user(),
                x,
                y,
            }));
        }
    }

    // --- Poll loop ---

    /// Drain sync events, sweep stale presence, release coalesced ops, and
    /// run the debounced save. Call once per UI frame. Returns users whose
    /// cursors went stale and should be removed from the canvas.
    pub fn poll(&mut self, bridge: &mut dyn CanvasBridge, now: Instant) -> Vec<UserId> {
        while let Some(event) = self.sync.as_ref().and_then(|s| s.poll_event()) {
            self.handle_sync_event(event, bridge, now);
        }

        for op in self.observer.poll_pending(now) {
            self.send_op(op);
        }

        let evicted = self.presence.sweep(now);
        self.persistence.tick(&self.doc, now);
        evicted
    }

    fn handle_sync_event(&mut self, event: SyncEvent, bridge: &mut dyn CanvasBridge, now: Instant) {
        match event {
            SyncEvent::Ready { ticket } => {
                self.ticket = Some(ticket);
            }
            SyncEvent::RemoteOp(op) => {
                // Toolkit callbacks fired while the bridge applies this are
                // deferred, not recursed.
                if self.observer.enter_cycle() {
                    match self.doc.apply(&op, Origin::Remote) {
                        Ok(Some(change)) => {
                            self.observer.dispatch(&self.doc, &change, bridge);
                            self.persistence.mark_dirty();
                        }
                        Ok(None) => {
                            self.persistence.mark_dirty();
                        }
                        Err(e) => warn!(error = %e, "remote op rejected"),
                    }
                    self.observer.exit_cycle();
                    if let Err(e) = self.process_deferred(now) {
                        warn!(error = %e, "deferred edit failed");
                    }
                }
            }
            SyncEvent::RemoteSnapshot(bytes) => {
                if self.observer.enter_cycle() {
                    match self.doc.merge_snapshot(&bytes) {
                        Ok(changes) => {
                            for change in &changes {
                                self.observer.dispatch(&self.doc, change, bridge);
                            }
                            if !changes.is_empty() {
                                self.persistence.mark_dirty();
                            }
                        }
                        Err(e) => warn!(error = %e, "remote snapshot rejected"),
                    }
                    self.observer.exit_cycle();
                    if let Err(e) = self.process_deferred(now) {
                        warn!(error = %e, "deferred edit failed");
                    }
                }
            }
            SyncEvent::Presence(msg) => {
                self.presence.apply(&msg, now);
            }
            SyncEvent::PeerStatus { connected } => {
                if connected {
                    self.status = ConnectionStatus::Connected;
                    self.flush_offline_queue();
                } else {
                    self.status = ConnectionStatus::Reconnecting;
                }
            }
            SyncEvent::Error(e) => {
                warn!(error = %e, "sync error");
            }
        }
    }

    fn send_op(&mut self, op: WireOp) {
        match (&self.sync, self.status) {
            (Some(sync), ConnectionStatus::Connected) => {
                if sync.send_command(SyncCommand::BroadcastOp(op)).is_err() {
                    warn!("sync thread gone, op dropped");
                }
            }
            (Some(_), _) => {
                // Link is down; hold the op until reconnect.
                self.offline_queue.push(op);
            }
            (None, _) => {}
        }
    }

    fn flush_offline_queue(&mut self) {
        if self.offline_queue.is_empty() {
            return;
        }
        info!(ops = self.offline_queue.len(), "flushing offline op queue");
        let queued = std::mem::take(&mut self.offline_queue);
        for op in queued {
            self.send_op(op);
        }
    }

    // --- Persistence ---

    /// Save immediately, outside the debounce window.
    pub fn save(&mut self, now: Instant) -> bool {
        self.persistence.save_now(&self.doc, now)
    }

    // --- Accessors ---

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Shareable ticket for other users to join this session.
    pub fn ticket(&self) -> Option<&str> {
        self.ticket.as_deref()
    }
}
