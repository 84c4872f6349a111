//! Change observation between the rendering toolkit, the document, and the
//! transport.
//!
//! Every mutation is classified by origin before it touches the document:
//! toolkit-sourced edits are stamped local, transport-delivered ops remote.
//! A remote change is applied to the toolkit but never re-forwarded to the
//! transport; a local change is forwarded to the transport but not echoed back
//! to the toolkit. This explicit tagging is what breaks the feedback loop.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::document::{
    AttrValue, ChangeAction, ChangeEvent, Document, ObjectId, Origin, WireOp,
};

/// Maximum rate at which coalesced drag updates go out (~10/s).
pub const DRAG_FORWARD_INTERVAL: Duration = Duration::from_millis(100);

/// Rendering toolkit boundary, outbound side. The toolkit pushes its own
/// edits in as [`LocalEdit`]s; remote changes come back through these calls.
pub trait CanvasBridge {
    fn apply_remote_added(&mut self, record: &crate::document::ObjectView);
    fn apply_remote_modified(&mut self, record: &crate::document::ObjectView);
    fn apply_remote_removed(&mut self, id: ObjectId);
}

/// One mutation request from the rendering toolkit (local origin).
#[derive(Debug, Clone)]
pub enum LocalEdit {
    Add {
        attrs: BTreeMap<String, AttrValue>,
    },
    Modify {
        id: ObjectId,
        changes: BTreeMap<String, AttrValue>,
        /// High-frequency drag-style update: eligible for coalescing.
        continuous: bool,
    },
    Remove {
        id: ObjectId,
    },
}

/// Origin classification, loop suppression, reentrancy guarding, and drag
/// coalescing. Owns no document state; the session drives it.
pub struct ChangeObserver {
    /// In-flight flag scoped to one merge cycle. Toolkit events arriving
    /// while set are queued instead of recursing into the merge path.
    in_cycle: bool,
    deferred: VecDeque<LocalEdit>,
    forward_interval: Duration,
    /// Latest coalesced op per object, waiting for its window.
    pending: HashMap<ObjectId, WireOp>,
    last_forward: HashMap<ObjectId, Instant>,
}

impl ChangeObserver {
    pub fn new() -> Self {
        Self::with_interval(DRAG_FORWARD_INTERVAL)
    }

    pub fn with_interval(forward_interval: Duration) -> Self {
        Self {
            in_cycle: false,
            deferred: VecDeque::new(),
            forward_interval,
            pending: HashMap::new(),
            last_forward: HashMap::new(),
        }
    }

    // --- Reentrancy guard ---

    /// Try to enter a merge cycle. Returns false if one is already running,
    /// in which case the caller must defer instead of mutating.
    pub fn enter_cycle(&mut self) -> bool {
        if self.in_cycle {
            return false;
        }
        self.in_cycle = true;
        true
    }

    pub fn exit_cycle(&mut self) {
        self.in_cycle = false;
    }

    pub fn in_cycle(&self) -> bool {
        self.in_cycle
    }

    /// Queue a toolkit event that arrived mid-cycle.
    pub fn defer(&mut self, edit: LocalEdit) {
        trace!("deferring reentrant toolkit edit");
        self.deferred.push_back(edit);
    }

    /// Drain the edits queued during the last cycle.
    pub fn drain_deferred(&mut self) -> Vec<LocalEdit> {
        self.deferred.drain(..).collect()
    }

    // --- Remote side: store event -> rendering toolkit ---

    /// Route one change event. Remote changes reach the toolkit bridge; local
    /// changes do not (the toolkit already reflects its own edit).
    pub fn dispatch(&self, doc: &Document, event: &ChangeEvent, bridge: &mut dyn CanvasBridge) {
        if event.origin == Origin::Local {
            return;
        }
        match event.action {
            ChangeAction::Added => {
                if let Some(view) = doc.get(event.object) {
                    bridge.apply_remote_added(&view);
                }
            }
            ChangeAction::Updated => {
                if let Some(view) = doc.get(event.object) {
                    bridge.apply_remote_modified(&view);
                }
            }
            ChangeAction::Removed => {
                bridge.apply_remote_removed(event.object);
            }
        }
    }

    // --- Local side: op -> transport, with drag coalescing ---

    /// Hand a local-origin op to the transport path. Discrete ops go out
    /// immediately; continuous (drag) ops are coalesced per object id and
    /// forwarded at most once per window, keeping only the most recent value.
    pub fn forward_local(&mut self, op: WireOp, continuous: bool, now: Instant) -> Option<WireOp> {
        if !continuous {
            // A discrete op supersedes anything still coalescing for the id.
            self.pending.remove(&op.object);
            self.last_forward.insert(op.object, now);
            return Some(op);
        }

        match self.last_forward.get(&op.object) {
            Some(last) if now.duration_since(*last) < self.forward_interval => {
                debug!(object = %op.object, "coalescing drag update");
                self.pending.insert(op.object, op);
                None
            }
            _ => {
                self.last_forward.insert(op.object, now);
                Some(op)
            }
        }
    }

    /// Flush the coalesced op for one object, regardless of the window. The
    /// final value of a drag always goes out through here on drag-end.
    pub fn flush(&mut self, id: ObjectId, now: Instant) -> Option<WireOp> {
        let op = self.pending.remove(&id)?;
        self.last_forward.insert(id, now);
        Some(op)
    }

    /// Release pending ops whose window has elapsed; called from the session
    /// poll loop so a stalled drag still propagates its latest value.
    pub fn poll_pending(&mut self, now: Instant) -> Vec<WireOp> {
        let interval = self.forward_interval;
        let ready: Vec<ObjectId> = self
            .pending
            .keys()
            .filter(|id| {
                self.last_forward
                    .get(id)
                    .is_none_or(|last| now.duration_since(*last) >= interval)
            })
            .copied()
            .collect();
        ready
            .into_iter()
            .filter_map(|id| self.flush(id, now))
            .collect()
    }

    /// Whether an object still has a coalesced update waiting.
    pub fn has_pending(&self, id: ObjectId) -> bool {
        self.pending.contains_key(&id)
    }
}

impl Default for ChangeObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ObjectView, ReplicaId, RoomId};

    #[derive(Default)]
    struct RecordingBridge {
        added: Vec<ObjectId>,
        modified: Vec<ObjectId>,
        removed: Vec<ObjectId>,
    }

    impl CanvasBridge for RecordingBridge {
        fn apply_remote_added(&mut self, record: &ObjectView) {
            self.added.push(record.id);
        }
        fn apply_remote_modified(&mut self, record: &ObjectView) {
            self.modified.push(record.id);
        }
        fn apply_remote_removed(&mut self, id: ObjectId) {
            self.removed.push(id);
        }
    }

    fn attrs(pairs: &[(&str, AttrValue)]) -> BTreeMap<String, AttrValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn remote_events_reach_bridge_local_events_do_not() {
        let room = RoomId::new();
        let mut a = Document::new(room, ReplicaId::new());
        let mut b = Document::new(room, ReplicaId::new());
        let observer = ChangeObserver::new();
        let mut bridge = RecordingBridge::default();

        let (op, local_event) = a
            .create_object(attrs(&[("x", AttrValue::Int(1))]))
            .unwrap();

        // Local event: toolkit already reflects it, bridge stays untouched.
        observer.dispatch(&a, &local_event, &mut bridge);
        assert!(bridge.added.is_empty());

        // The same op arriving remotely does reach the bridge.
        let remote_event = b.apply(&op, Origin::Remote).unwrap().unwrap();
        observer.dispatch(&b, &remote_event, &mut bridge);
        assert_eq!(bridge.added, vec![op.object]);
    }

    #[test]
    fn remote_remove_reaches_bridge() {
        let room = RoomId::new();
        let mut a = Document::new(room, ReplicaId::new());
        let mut b = Document::new(room, ReplicaId::new());
        let observer = ChangeObserver::new();
        let mut bridge = RecordingBridge::default();

        let (create, _) = a
            .create_object(attrs(&[("x", AttrValue::Int(1))]))
            .unwrap();
        b.apply(&create, Origin::Remote).unwrap();
        let (del, _) = a.delete_object(create.object).unwrap();

        let event = b.apply(&del, Origin::Remote).unwrap().unwrap();
        observer.dispatch(&b, &event, &mut bridge);
        assert_eq!(bridge.removed, vec![create.object]);
    }

    #[test]
    fn discrete_ops_forward_immediately() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        let mut observer = ChangeObserver::new();
        let (op, _) = doc.create_object(attrs(&[("x", AttrValue::Int(1))])).unwrap();

        let forwarded = observer.forward_local(op.clone(), false, Instant::now());
        assert_eq!(forwarded, Some(op));
    }

    #[test]
    fn drag_updates_coalesce_to_most_recent() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        let mut observer = ChangeObserver::with_interval(Duration::from_millis(100));
        let (create, _) = doc.create_object(attrs(&[("x", AttrValue::Int(0))])).unwrap();
        let id = create.object;
        let start = Instant::now();

        // First drag frame goes straight out.
        let (op1, _) = doc.update_object(id, attrs(&[("x", AttrValue::Int(1))])).unwrap();
        assert!(observer.forward_local(op1, true, start).is_some());

        // Frames inside the window are held, latest value kept.
        let (op2, _) = doc.update_object(id, attrs(&[("x", AttrValue::Int(2))])).unwrap();
        let (op3, _) = doc.update_object(id, attrs(&[("x", AttrValue::Int(3))])).unwrap();
        assert!(observer
            .forward_local(op2, true, start + Duration::from_millis(10))
            .is_none());
        assert!(observer
            .forward_local(op3.clone(), true, start + Duration::from_millis(20))
            .is_none());
        assert!(observer.has_pending(id));

        // Drag-end flush releases exactly the most recent op.
        let flushed = observer.flush(id, start + Duration::from_millis(30));
        assert_eq!(flushed, Some(op3));
        assert!(!observer.has_pending(id));
    }

    #[test]
    fn poll_pending_releases_after_window() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        let mut observer = ChangeObserver::with_interval(Duration::from_millis(100));
        let (create, _) = doc.create_object(attrs(&[("x", AttrValue::Int(0))])).unwrap();
        let id = create.object;
        let start = Instant::now();

        let (op1, _) = doc.update_object(id, attrs(&[("x", AttrValue::Int(1))])).unwrap();
        observer.forward_local(op1, true, start);
        let (op2, _) = doc.update_object(id, attrs(&[("x", AttrValue::Int(2))])).unwrap();
        observer.forward_local(op2.clone(), true, start + Duration::from_millis(10));

        // Inside the window nothing is released.
        assert!(observer.poll_pending(start + Duration::from_millis(50)).is_empty());

        let released = observer.poll_pending(start + Duration::from_millis(110));
        assert_eq!(released, vec![op2]);
    }

    #[test]
    fn reentrant_edits_are_deferred_not_recursed() {
        let mut observer = ChangeObserver::new();

        assert!(observer.enter_cycle());
        // A toolkit callback fires mid-cycle and tries to edit again.
        assert!(!observer.enter_cycle());
        observer.defer(LocalEdit::Remove { id: ObjectId::new() });
        observer.exit_cycle();

        let deferred = observer.drain_deferred();
        assert_eq!(deferred.len(), 1);
        assert!(observer.enter_cycle());
        observer.exit_cycle();
    }
}
