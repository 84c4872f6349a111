//! Local-first convergent document - THE source of truth for all object data.
//!
//! Every edit goes through this document. It handles:
//! - Object storage and mutation as a per-field last-writer-wins map
//! - Deterministic merge of remote ops (any order, with duplicates)
//! - Snapshot encode/decode for persistence and resync

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a collaboration room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomId(pub Uuid);

impl RoomId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object identifier - UUID for global uniqueness, assigned once by the creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one replica (one client's copy of the document).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub Uuid);

impl ReplicaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical version for merge arbitration: a Lamport counter paired with the
/// writing replica. Total order: counter first, replica id as the tie-break,
/// so concurrent writes resolve the same way on every replica.
///
/// Never derived from wall-clock time and never exposed through consumer views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl VersionStamp {
    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        Self { counter, replica }
    }

    /// The bottom element: older than every real stamp.
    fn zero() -> Self {
        Self {
            counter: 0,
            replica: ReplicaId::nil(),
        }
    }
}

/// Open attribute value: geometry, color, text, stacking order, flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<AttrValue>),
}

impl AttrValue {
    /// Floats must be finite so merged state stays comparable and serializable.
    fn is_well_formed(&self) -> bool {
        match self {
            AttrValue::Float(f) => f.is_finite(),
            AttrValue::List(items) => items.iter().all(AttrValue::is_well_formed),
            _ => true,
        }
    }
}

/// One field's value tagged with the version that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRegister {
    pub value: AttrValue,
    pub stamp: VersionStamp,
}

/// Kind of mutation carried by a wire op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpAction {
    Add,
    Update,
    Delete,
}

/// One field-level mutation as it travels between replicas. The transport
/// forwards these opaquely; all merge logic lives in [`Document::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOp {
    pub room: RoomId,
    pub object: ObjectId,
    pub action: OpAction,
    /// Stamp for the op as a whole: existence register for `Add`, tombstone
    /// for `Delete`, newest-writer arbitration for metadata.
    pub stamp: VersionStamp,
    pub fields: BTreeMap<String, FieldRegister>,
    /// Advisory wall-clock time of the edit, never used for merge decisions.
    pub wall_ms: u64,
}

/// Whether a change was produced here or received from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Visible effect of a merge, for downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
    Updated,
    Removed,
}

/// Change notification emitted per object id whenever a merge alters visible
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub object: ObjectId,
    pub action: ChangeAction,
    pub origin: Origin,
}

/// Consumer-facing view of one visible object. Carries plain attribute values
/// and advisory metadata only - version stamps stay internal.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectView {
    pub id: ObjectId,
    pub attrs: BTreeMap<String, AttrValue>,
    pub last_editor: ReplicaId,
    pub last_edited_ms: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed op: {0}")]
    MalformedOp(&'static str),
    #[error("op for room {got} does not belong to document for room {want}")]
    RoomMismatch { want: RoomId, got: RoomId },
    #[error("snapshot is corrupt: {0}")]
    CorruptSnapshot(String),
    #[error("cannot hydrate after live ops have been applied")]
    HydrateAfterEdit,
}

/// Internal per-object slot. Every register merges by max, so applying the
/// same ops in any order, any number of times, lands on the same slot.
///
/// Deletion never erases the slot: the tombstone register marks it invisible
/// while field state keeps merging underneath, which is what keeps replicas
/// convergent when deletes and edits race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RecordSlot {
    fields: BTreeMap<String, FieldRegister>,
    /// Max stamp of all `Add` ops seen for this id. Zero until the create
    /// arrives (out-of-order updates park their fields invisibly).
    created: VersionStamp,
    /// Max stamp of all `Delete` ops seen for this id.
    tombstone: Option<VersionStamp>,
    /// Max stamp across every op applied to this slot; arbitrates metadata.
    last_stamp: VersionStamp,
    last_editor: ReplicaId,
    last_edited_ms: u64,
}

impl RecordSlot {
    fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
            created: VersionStamp::zero(),
            tombstone: None,
            last_stamp: VersionStamp::zero(),
            last_editor: ReplicaId::nil(),
            last_edited_ms: 0,
        }
    }

    /// A slot is visible once its create has been seen and outranks any
    /// tombstone. Ties go to the delete.
    fn visible(&self) -> bool {
        self.created.counter > 0 && self.tombstone.is_none_or(|t| self.created > t)
    }

    fn view(&self, id: ObjectId) -> ObjectView {
        ObjectView {
            id,
            attrs: self
                .fields
                .iter()
                .map(|(k, reg)| (k.clone(), reg.value.clone()))
                .collect(),
            last_editor: self.last_editor,
            last_edited_ms: self.last_edited_ms,
        }
    }
}

/// Serialized form of the full document at one instant.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    room: RoomId,
    clock: u64,
    records: BTreeMap<ObjectId, RecordSlot>,
}

/// The convergent object store for one room.
pub struct Document {
    room: RoomId,
    replica: ReplicaId,
    /// Lamport clock: advanced past every observed stamp, incremented per
    /// local mutation, so local edits always outrank everything seen so far.
    clock: u64,
    records: BTreeMap<ObjectId, RecordSlot>,
    /// Set once any op has been applied; hydration is only legal before that.
    live: bool,
}

impl Document {
    pub fn new(room: RoomId, replica: ReplicaId) -> Self {
        Self {
            room,
            replica,
            clock: 0,
            records: BTreeMap::new(),
            live: false,
        }
    }

    pub fn room(&self) -> RoomId {
        self.room
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Mint a stamp for a local mutation.
    fn next_stamp(&mut self) -> VersionStamp {
        self.clock += 1;
        VersionStamp::new(self.clock, self.replica)
    }

    fn observe(&mut self, stamp: VersionStamp) {
        self.clock = self.clock.max(stamp.counter);
    }

    // --- Local mutation entry points ---

    /// Create a new object with the given attributes. Returns the op to
    /// broadcast and the resulting change event.
    pub fn create_object(
        &mut self,
        attrs: BTreeMap<String, AttrValue>,
    ) -> Result<(WireOp, ChangeEvent), StoreError> {
        let op = self.build_op(ObjectId::new(), OpAction::Add, attrs)?;
        let event = self
            .apply(&op, Origin::Local)?
            .expect("creating a fresh id always changes visible state");
        Ok((op, event))
    }

    /// Overwrite the given fields of an existing object.
    pub fn update_object(
        &mut self,
        id: ObjectId,
        changes: BTreeMap<String, AttrValue>,
    ) -> Result<(WireOp, Option<ChangeEvent>), StoreError> {
        let op = self.build_op(id, OpAction::Update, changes)?;
        let event = self.apply(&op, Origin::Local)?;
        Ok((op, event))
    }

    /// Delete an object. The whole record disappears from consumer view.
    pub fn delete_object(
        &mut self,
        id: ObjectId,
    ) -> Result<(WireOp, Option<ChangeEvent>), StoreError> {
        let op = self.build_op(id, OpAction::Delete, BTreeMap::new())?;
        let event = self.apply(&op, Origin::Local)?;
        Ok((op, event))
    }

    /// Re-create a deleted object under its original id, restoring the given
    /// attributes. Used by undo; the fresh stamp outranks the tombstone.
    pub fn restore_object(
        &mut self,
        id: ObjectId,
        attrs: BTreeMap<String, AttrValue>,
    ) -> Result<(WireOp, Option<ChangeEvent>), StoreError> {
        let op = self.build_op(id, OpAction::Add, attrs)?;
        let event = self.apply(&op, Origin::Local)?;
        Ok((op, event))
    }

    fn build_op(
        &mut self,
        id: ObjectId,
        action: OpAction,
        attrs: BTreeMap<String, AttrValue>,
    ) -> Result<WireOp, StoreError> {
        let stamp = self.next_stamp();
        let fields = attrs
            .into_iter()
            .map(|(name, value)| (name, FieldRegister { value, stamp }))
            .collect();
        let op = WireOp {
            room: self.room,
            object: id,
            action,
            stamp,
            fields,
            wall_ms: wall_clock_ms(),
        };
        validate_op(&op)?;
        Ok(op)
    }

    // --- Merge ---

    /// Merge one op into the document. Returns the visible change, if any.
    ///
    /// The merge is idempotent and commutative: re-delivered or reordered ops
    /// never diverge replica state. A malformed op is rejected without
    /// touching existing state.
    pub fn apply(&mut self, op: &WireOp, origin: Origin) -> Result<Option<ChangeEvent>, StoreError> {
        validate_op(op)?;
        if op.room != self.room {
            return Err(StoreError::RoomMismatch {
                want: self.room,
                got: op.room,
            });
        }

        self.live = true;
        self.observe(op.stamp);

        let slot = self
            .records
            .entry(op.object)
            .or_insert_with(RecordSlot::empty);
        let was_visible = slot.visible();
        let before_fields = slot.fields.clone();

        match op.action {
            OpAction::Add => {
                slot.created = slot.created.max(op.stamp);
                merge_fields(&mut slot.fields, &op.fields);
            }
            OpAction::Update => {
                merge_fields(&mut slot.fields, &op.fields);
            }
            OpAction::Delete => {
                slot.tombstone = Some(slot.tombstone.map_or(op.stamp, |t| t.max(op.stamp)));
            }
        }

        if op.stamp > slot.last_stamp {
            slot.last_stamp = op.stamp;
            slot.last_editor = op.stamp.replica;
            slot.last_edited_ms = op.wall_ms;
        }

        let now_visible = slot.visible();
        let fields_changed = slot.fields != before_fields;

        let action = match (was_visible, now_visible) {
            (false, true) => Some(ChangeAction::Added),
            (true, false) => Some(ChangeAction::Removed),
            (true, true) if fields_changed => Some(ChangeAction::Updated),
            _ => None,
        };

        Ok(action.map(|action| ChangeEvent {
            object: op.object,
            action,
            origin,
        }))
    }

    // --- Reads ---

    /// Look up one visible object.
    pub fn get(&self, id: ObjectId) -> Option<ObjectView> {
        self.records
            .get(&id)
            .filter(|slot| slot.visible())
            .map(|slot| slot.view(id))
    }

    /// Iterate all visible objects.
    pub fn objects(&self) -> impl Iterator<Item = ObjectView> + '_ {
        self.records
            .iter()
            .filter(|(_, slot)| slot.visible())
            .map(|(id, slot)| slot.view(*id))
    }

    /// Number of visible objects.
    pub fn len(&self) -> usize {
        self.records.values().filter(|s| s.visible()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Snapshots ---

    /// Encode the full document, internal registers included. Record order is
    /// canonical, so equal states produce equal bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        let data = SnapshotData {
            room: self.room,
            clock: self.clock,
            records: self.records.clone(),
        };
        rmp_serde::to_vec(&data).expect("document state is always serializable")
    }

    /// Replace state with a decoded snapshot. Only legal at session start,
    /// before any live op has been applied.
    pub fn hydrate(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if self.live {
            return Err(StoreError::HydrateAfterEdit);
        }
        let data: SnapshotData =
            rmp_serde::from_slice(bytes).map_err(|e| StoreError::CorruptSnapshot(e.to_string()))?;
        if data.room != self.room {
            return Err(StoreError::RoomMismatch {
                want: self.room,
                got: data.room,
            });
        }
        self.clock = self.clock.max(data.clock);
        self.records = data.records;
        Ok(())
    }

    /// Merge a remote snapshot record-wise (reconnect resync path). Emits one
    /// event per object whose visible state changed.
    pub fn merge_snapshot(&mut self, bytes: &[u8]) -> Result<Vec<ChangeEvent>, StoreError> {
        let data: SnapshotData =
            rmp_serde::from_slice(bytes).map_err(|e| StoreError::CorruptSnapshot(e.to_string()))?;
        if data.room != self.room {
            return Err(StoreError::RoomMismatch {
                want: self.room,
                got: data.room,
            });
        }

        self.live = true;
        self.clock = self.clock.max(data.clock);

        let mut events = Vec::new();
        for (id, incoming) in data.records {
            let slot = self.records.entry(id).or_insert_with(RecordSlot::empty);
            let was_visible = slot.visible();
            let before_fields = slot.fields.clone();

            slot.created = slot.created.max(incoming.created);
            slot.tombstone = match (slot.tombstone, incoming.tombstone) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            merge_fields(&mut slot.fields, &incoming.fields);
            if incoming.last_stamp > slot.last_stamp {
                slot.last_stamp = incoming.last_stamp;
                slot.last_editor = incoming.last_editor;
                slot.last_edited_ms = incoming.last_edited_ms;
            }

            let action = match (was_visible, slot.visible()) {
                (false, true) => Some(ChangeAction::Added),
                (true, false) => Some(ChangeAction::Removed),
                (true, true) if slot.fields != before_fields => Some(ChangeAction::Updated),
                _ => None,
            };
            if let Some(action) = action {
                events.push(ChangeEvent {
                    object: id,
                    action,
                    origin: Origin::Remote,
                });
            }
        }
        Ok(events)
    }
}

/// Per-field LWW: the greater stamp wins; equal stamps mean equal writes.
fn merge_fields(
    target: &mut BTreeMap<String, FieldRegister>,
    incoming: &BTreeMap<String, FieldRegister>,
) {
    for (name, reg) in incoming {
        match target.get(name) {
            Some(current) if current.stamp >= reg.stamp => {}
            _ => {
                target.insert(name.clone(), reg.clone());
            }
        }
    }
}

fn validate_op(op: &WireOp) -> Result<(), StoreError> {
    match op.action {
        OpAction::Add | OpAction::Update => {
            if op.fields.is_empty() {
                return Err(StoreError::MalformedOp("add/update op carries no fields"));
            }
        }
        OpAction::Delete => {
            if !op.fields.is_empty() {
                return Err(StoreError::MalformedOp("delete op carries fields"));
            }
        }
    }
    if op.fields.keys().any(|k| k.is_empty()) {
        return Err(StoreError::MalformedOp("empty field name"));
    }
    if !op.fields.values().all(|r| r.value.is_well_formed()) {
        return Err(StoreError::MalformedOp("non-finite float value"));
    }
    if op.stamp.counter == 0 {
        return Err(StoreError::MalformedOp("zero version stamp"));
    }
    Ok(())
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, AttrValue)]) -> BTreeMap<String, AttrValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn text(s: &str) -> AttrValue {
        AttrValue::Text(s.to_string())
    }

    #[test]
    fn create_and_read_back() {
        let room = RoomId::new();
        let mut doc = Document::new(room, ReplicaId::new());
        let (op, event) = doc
            .create_object(attrs(&[("type", text("circle")), ("color", text("red"))]))
            .unwrap();

        assert_eq!(event.action, ChangeAction::Added);
        assert_eq!(event.origin, Origin::Local);
        let view = doc.get(op.object).unwrap();
        assert_eq!(view.attrs.get("color"), Some(&text("red")));
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn higher_stamp_wins_regardless_of_arrival_order() {
        // Replica A creates o1; replica B (offline) sets color=blue with a
        // higher logical version. Blue must win on both, deterministically.
        let room = RoomId::new();
        let mut a = Document::new(room, ReplicaId::new());
        let mut b = Document::new(room, ReplicaId::new());

        let (create, _) = a
            .create_object(attrs(&[("type", text("circle")), ("color", text("red"))]))
            .unwrap();
        b.apply(&create, Origin::Remote).unwrap();

        let (edit, _) = b
            .update_object(create.object, attrs(&[("color", text("blue"))]))
            .unwrap();
        a.apply(&edit, Origin::Remote).unwrap();

        assert_eq!(a.get(create.object).unwrap().attrs["color"], text("blue"));
        assert_eq!(b.get(create.object).unwrap().attrs["color"], text("blue"));
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn concurrent_writes_tie_break_by_replica_id() {
        let room = RoomId::new();
        let r1 = ReplicaId(Uuid::from_u128(1));
        let r2 = ReplicaId(Uuid::from_u128(2));
        let mut d1 = Document::new(room, r1);
        let mut d2 = Document::new(room, r2);

        let (create, _) = d1.create_object(attrs(&[("color", text("red"))])).unwrap();
        d2.apply(&create, Origin::Remote).unwrap();

        // Both replicas write concurrently with the same counter value.
        let (e1, _) = d1
            .update_object(create.object, attrs(&[("color", text("green"))]))
            .unwrap();
        let (e2, _) = d2
            .update_object(create.object, attrs(&[("color", text("blue"))]))
            .unwrap();
        assert_eq!(e1.stamp.counter, e2.stamp.counter);

        d1.apply(&e2, Origin::Remote).unwrap();
        d2.apply(&e1, Origin::Remote).unwrap();

        // r2 > r1, so blue wins everywhere.
        assert_eq!(d1.get(create.object).unwrap().attrs["color"], text("blue"));
        assert_eq!(d1.snapshot(), d2.snapshot());
    }

    #[test]
    fn applying_an_op_twice_is_idempotent() {
        let room = RoomId::new();
        let mut a = Document::new(room, ReplicaId::new());
        let mut b = Document::new(room, ReplicaId::new());

        let (create, _) = a.create_object(attrs(&[("x", AttrValue::Int(4))])).unwrap();
        b.apply(&create, Origin::Remote).unwrap();
        let once = b.snapshot();

        let redelivered = b.apply(&create, Origin::Remote).unwrap();
        assert!(redelivered.is_none());
        assert_eq!(b.snapshot(), once);
    }

    #[test]
    fn delete_dominates_concurrent_edit_in_either_order() {
        let room = RoomId::new();
        let mut a = Document::new(room, ReplicaId::new());
        let mut b = Document::new(room, ReplicaId::new());

        let (create, _) = a.create_object(attrs(&[("color", text("red"))])).unwrap();
        b.apply(&create, Origin::Remote).unwrap();

        let (edit, _) = b
            .update_object(create.object, attrs(&[("color", text("blue"))]))
            .unwrap();
        let (del, _) = a.delete_object(create.object).unwrap();

        // a: delete then edit; b: edit then delete.
        a.apply(&edit, Origin::Remote).unwrap();
        b.apply(&del, Origin::Remote).unwrap();

        assert!(a.get(create.object).is_none());
        assert!(b.get(create.object).is_none());
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn delete_emits_removed_and_drops_from_view() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        let (create, _) = doc
            .create_object(attrs(&[("x", AttrValue::Int(1))]))
            .unwrap();

        let (_, event) = doc.delete_object(create.object).unwrap();
        assert_eq!(event.unwrap().action, ChangeAction::Removed);
        assert!(doc.get(create.object).is_none());
        assert!(doc.is_empty());

        // Deleting again changes nothing visible.
        let (_, event) = doc.delete_object(create.object).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn restore_after_delete_resurrects_under_same_id() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        let (create, _) = doc.create_object(attrs(&[("color", text("red"))])).unwrap();
        doc.delete_object(create.object).unwrap();

        let (_, event) = doc
            .restore_object(create.object, attrs(&[("color", text("red"))]))
            .unwrap();
        assert_eq!(event.unwrap().action, ChangeAction::Added);
        assert_eq!(doc.get(create.object).unwrap().attrs["color"], text("red"));
    }

    #[test]
    fn update_arriving_before_create_stays_invisible_until_create() {
        let room = RoomId::new();
        let mut a = Document::new(room, ReplicaId::new());
        let mut b = Document::new(room, ReplicaId::new());

        let (create, _) = a
            .create_object(attrs(&[("x", AttrValue::Int(1))]))
            .unwrap();
        let (edit, _) = a
            .update_object(create.object, attrs(&[("x", AttrValue::Int(2))]))
            .unwrap();

        // b receives the edit first - nothing visible yet.
        let event = b.apply(&edit, Origin::Remote).unwrap();
        assert!(event.is_none());
        assert!(b.get(create.object).is_none());

        // The create lands and the merged record appears, edit included.
        let event = b.apply(&create, Origin::Remote).unwrap();
        assert_eq!(event.unwrap().action, ChangeAction::Added);
        assert_eq!(b.get(create.object).unwrap().attrs["x"], AttrValue::Int(2));
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn hydrate_of_own_snapshot_is_a_noop() {
        let room = RoomId::new();
        let mut doc = Document::new(room, ReplicaId::new());
        doc.create_object(attrs(&[("a", AttrValue::Int(1))]))
            .unwrap();
        doc.create_object(attrs(&[("b", AttrValue::Bool(true))]))
            .unwrap();
        let snap = doc.snapshot();

        let mut fresh = Document::new(room, ReplicaId::new());
        fresh.hydrate(&snap).unwrap();
        assert_eq!(fresh.snapshot(), snap);
    }

    #[test]
    fn hydrate_rejected_after_live_edits() {
        let room = RoomId::new();
        let mut doc = Document::new(room, ReplicaId::new());
        let snap = doc.snapshot();
        doc.create_object(attrs(&[("a", AttrValue::Int(1))]))
            .unwrap();

        assert!(matches!(
            doc.hydrate(&snap),
            Err(StoreError::HydrateAfterEdit)
        ));
    }

    #[test]
    fn corrupt_snapshot_is_a_distinct_error() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        assert!(matches!(
            doc.hydrate(b"definitely not msgpack"),
            Err(StoreError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn malformed_ops_rejected_without_corrupting_state() {
        let room = RoomId::new();
        let replica = ReplicaId::new();
        let mut doc = Document::new(room, replica);
        let (create, _) = doc
            .create_object(attrs(&[("x", AttrValue::Int(1))]))
            .unwrap();
        let before = doc.snapshot();

        let empty_update = WireOp {
            room,
            object: create.object,
            action: OpAction::Update,
            stamp: VersionStamp::new(99, replica),
            fields: BTreeMap::new(),
            wall_ms: 0,
        };
        assert!(matches!(
            doc.apply(&empty_update, Origin::Remote),
            Err(StoreError::MalformedOp(_))
        ));

        let nan_update = WireOp {
            room,
            object: create.object,
            action: OpAction::Update,
            stamp: VersionStamp::new(99, replica),
            fields: [(
                "x".to_string(),
                FieldRegister {
                    value: AttrValue::Float(f64::NAN),
                    stamp: VersionStamp::new(99, replica),
                },
            )]
            .into(),
            wall_ms: 0,
        };
        assert!(matches!(
            doc.apply(&nan_update, Origin::Remote),
            Err(StoreError::MalformedOp(_))
        ));

        let wrong_room = WireOp {
            room: RoomId::new(),
            ..create.clone()
        };
        assert!(matches!(
            doc.apply(&wrong_room, Origin::Remote),
            Err(StoreError::RoomMismatch { .. })
        ));

        assert_eq!(doc.snapshot(), before);
    }

    #[test]
    fn merge_snapshot_converges_two_divergent_replicas() {
        let room = RoomId::new();
        let mut a = Document::new(room, ReplicaId::new());
        let mut b = Document::new(room, ReplicaId::new());

        let (create, _) = a.create_object(attrs(&[("color", text("red"))])).unwrap();
        b.apply(&create, Origin::Remote).unwrap();

        // Diverge while offline.
        a.update_object(create.object, attrs(&[("x", AttrValue::Int(10))]))
            .unwrap();
        b.create_object(attrs(&[("type", text("rect"))])).unwrap();

        // Full snapshot exchange in both directions.
        let snap_a = a.snapshot();
        let snap_b = b.snapshot();
        let events = b.merge_snapshot(&snap_a).unwrap();
        assert!(!events.is_empty());
        a.merge_snapshot(&snap_b).unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn last_editor_metadata_tracks_newest_writer() {
        let room = RoomId::new();
        let mut a = Document::new(room, ReplicaId::new());
        let mut b = Document::new(room, ReplicaId::new());

        let (create, _) = a.create_object(attrs(&[("color", text("red"))])).unwrap();
        b.apply(&create, Origin::Remote).unwrap();
        let (edit, _) = b
            .update_object(create.object, attrs(&[("color", text("blue"))]))
            .unwrap();
        a.apply(&edit, Origin::Remote).unwrap();

        assert_eq!(a.get(create.object).unwrap().last_editor, b.replica());
    }
}
