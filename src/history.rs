//! Undo/redo manager capturing local transactions as reversible patches.
//!
//! Each committed transaction becomes one [`UndoEntry`] holding per-object,
//! per-field (before, after) deltas. Undo applies the inverse as a fresh
//! local-origin mutation, so it re-enters the normal broadcast path; remote
//! edits are never captured, keeping every participant's history private to
//! their own edits.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use tracing::warn;

use crate::document::{AttrValue, ChangeEvent, Document, ObjectId, StoreError, WireOp};

/// Before/after pair for one field. `before == None` means the field did not
/// exist prior to the transaction; the op model has no per-field removal, so
/// undoing such a write leaves the field at its old value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDelta {
    pub before: Option<AttrValue>,
    pub after: AttrValue,
}

/// What one transaction did to one object.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordDelta {
    /// Object created with these attributes.
    Created { attrs: BTreeMap<String, AttrValue> },
    /// Object deleted; attributes as they were just before.
    Removed { attrs: BTreeMap<String, AttrValue> },
    /// Fields overwritten in place.
    Fields {
        changes: BTreeMap<String, FieldDelta>,
    },
}

/// One captured local transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    deltas: BTreeMap<ObjectId, RecordDelta>,
}

impl UndoEntry {
    pub fn deltas(&self) -> &BTreeMap<ObjectId, RecordDelta> {
        &self.deltas
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// Manages the bounded undo/redo stacks and in-progress transaction capture.
pub struct HistoryManager {
    undo_stack: VecDeque<UndoEntry>,
    redo_stack: Vec<UndoEntry>,
    /// Capture buffer between `begin()` and `commit()`.
    active: Option<BTreeMap<ObjectId, RecordDelta>>,
    max_depth: usize,
}

impl HistoryManager {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            active: None,
            max_depth,
        }
    }

    /// Open a transaction bracket. An uncommitted bracket is discarded.
    pub fn begin(&mut self) {
        if self.active.is_some() {
            warn!("transaction begun while another was open; discarding capture");
        }
        self.active = Some(BTreeMap::new());
    }

    /// Close the bracket and push the captured entry. Empty transactions and
    /// commits without a matching `begin` push nothing. A new entry clears
    /// the redo stack.
    pub fn commit(&mut self) {
        let Some(deltas) = self.active.take() else {
            return;
        };
        if deltas.is_empty() {
            return;
        }
        self.undo_stack.push_back(UndoEntry { deltas });
        self.redo_stack.clear();
        while self.undo_stack.len() > self.max_depth {
            self.undo_stack.pop_front();
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.active.is_some()
    }

    // --- Capture (local-origin writes only; the session enforces origin) ---

    pub fn record_create(&mut self, id: ObjectId, attrs: BTreeMap<String, AttrValue>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.insert(id, RecordDelta::Created { attrs });
    }

    pub fn record_delete(&mut self, id: ObjectId, attrs_before: BTreeMap<String, AttrValue>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.get(&id) {
            // Created then deleted inside one bracket cancels out.
            Some(RecordDelta::Created { .. }) => {
                active.remove(&id);
            }
            _ => {
                active.insert(
                    id,
                    RecordDelta::Removed {
                        attrs: attrs_before,
                    },
                );
            }
        }
    }

    pub fn record_update(
        &mut self,
        id: ObjectId,
        field: &str,
        before: Option<AttrValue>,
        after: AttrValue,
    ) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.get_mut(&id) {
            // Edits to an object created in this bracket fold into the create.
            Some(RecordDelta::Created { attrs }) => {
                attrs.insert(field.to_string(), after);
            }
            Some(RecordDelta::Removed { .. }) => {}
            Some(RecordDelta::Fields { changes }) => {
                match changes.get_mut(field) {
                    // Keep the earliest before, the latest after.
                    Some(delta) => delta.after = after,
                    None => {
                        changes.insert(field.to_string(), FieldDelta { before, after });
                    }
                }
            }
            None => {
                let mut changes = BTreeMap::new();
                changes.insert(field.to_string(), FieldDelta { before, after });
                active.insert(id, RecordDelta::Fields { changes });
            }
        }
    }

    // --- Stacks ---

    /// Pop the most recent transaction for inverse application. The entry
    /// moves to the redo stack; a no-op when the undo stack is empty.
    pub fn undo(&mut self) -> Option<UndoEntry> {
        let entry = self.undo_stack.pop_back()?;
        self.redo_stack.push(entry.clone());
        Some(entry)
    }

    /// Pop the most recently undone transaction for forward re-application.
    pub fn redo(&mut self) -> Option<UndoEntry> {
        let entry = self.redo_stack.pop()?;
        self.undo_stack.push_back(entry.clone());
        Some(entry)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.active = None;
    }
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Apply the inverse of a captured transaction to the document as new
/// local-origin mutations. Returns the ops to broadcast with their events.
pub fn apply_inverse(
    entry: &UndoEntry,
    doc: &mut Document,
) -> Result<Vec<(WireOp, Option<ChangeEvent>)>, StoreError> {
    let mut out = Vec::new();
    for (id, delta) in entry.deltas() {
        match delta {
            RecordDelta::Created { .. } => {
                let (op, event) = doc.delete_object(*id)?;
                out.push((op, event));
            }
            RecordDelta::Removed { attrs } => {
                let (op, event) = doc.restore_object(*id, attrs.clone())?;
                out.push((op, event));
            }
            RecordDelta::Fields { changes } => {
                let before: BTreeMap<String, AttrValue> = changes
                    .iter()
                    .filter_map(|(k, d)| d.before.clone().map(|v| (k.clone(), v)))
                    .collect();
                if !before.is_empty() {
                    let (op, event) = doc.update_object(*id, before)?;
                    out.push((op, event));
                }
            }
        }
    }
    Ok(out)
}

/// Re-apply a captured transaction forward (the redo direction).
pub fn apply_forward(
    entry: &UndoEntry,
    doc: &mut Document,
) -> Result<Vec<(WireOp, Option<ChangeEvent>)>, StoreError> {
    let mut out = Vec::new();
    for (id, delta) in entry.deltas() {
        match delta {
            RecordDelta::Created { attrs } => {
                let (op, event) = doc.restore_object(*id, attrs.clone())?;
                out.push((op, event));
            }
            RecordDelta::Removed { .. } => {
                let (op, event) = doc.delete_object(*id)?;
                out.push((op, event));
            }
            RecordDelta::Fields { changes } => {
                let after: BTreeMap<String, AttrValue> = changes
                    .iter()
                    .map(|(k, d)| (k.clone(), d.after.clone()))
                    .collect();
                let (op, event) = doc.update_object(*id, after)?;
                out.push((op, event));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ReplicaId, RoomId};

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
    fn undo_on_empty_stack_is_noop() {
        let mut history = HistoryManager::new(10);
        assert!(!history.can_undo());
        assert!(history.undo().is_none());
        assert!(history.redo().is_none());
    }

    #[test]
    fn undo_then_redo_restores_post_transaction_state() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        let mut history = HistoryManager::new(10);

        let (create, _) = doc.create_object(attrs(&[("color", text("red"))])).unwrap();
        let id = create.object;

        history.begin();
        doc.update_object(id, attrs(&[("color", text("blue"))]))
            .unwrap();
        history.record_update(id, "color", Some(text("red")), text("blue"));
        history.commit();

        let post_txn = doc.get(id).unwrap().attrs.clone();

        let entry = history.undo().unwrap();
        apply_inverse(&entry, &mut doc).unwrap();
        assert_eq!(doc.get(id).unwrap().attrs["color"], text("red"));

        let entry = history.redo().unwrap();
        apply_forward(&entry, &mut doc).unwrap();
        assert_eq!(doc.get(id).unwrap().attrs, post_txn);
    }

    #[test]
    fn undo_of_create_deletes_and_redo_restores() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        let mut history = HistoryManager::new(10);

        history.begin();
        let (create, _) = doc
            .create_object(attrs(&[("type", text("rect")), ("w", AttrValue::Int(10))]))
            .unwrap();
        let id = create.object;
        history.record_create(id, doc.get(id).unwrap().attrs);
        history.commit();

        let entry = history.undo().unwrap();
        apply_inverse(&entry, &mut doc).unwrap();
        assert!(doc.get(id).is_none());

        let entry = history.redo().unwrap();
        apply_forward(&entry, &mut doc).unwrap();
        let restored = doc.get(id).unwrap();
        assert_eq!(restored.attrs["w"], AttrValue::Int(10));
    }

    #[test]
    fn undo_of_delete_restores_attributes() {
        let mut doc = Document::new(RoomId::new(), ReplicaId::new());
        let mut history = HistoryManager::new(10);

        let (create, _) = doc
            .create_object(attrs(&[("color", text("red")), ("x", AttrValue::Int(3))]))
            .unwrap();
        let id = create.object;

        history.begin();
        let before = doc.get(id).unwrap().attrs;
        doc.delete_object(id).unwrap();
        history.record_delete(id, before);
        history.commit();

        let entry = history.undo().unwrap();
        apply_inverse(&entry, &mut doc).unwrap();
        let restored = doc.get(id).unwrap();
        assert_eq!(restored.attrs["color"], text("red"));
        assert_eq!(restored.attrs["x"], AttrValue::Int(3));
    }

    #[test]
    fn create_then_delete_in_one_bracket_cancels() {
        let mut history = HistoryManager::new(10);
        let id = ObjectId::new();

        history.begin();
        history.record_create(id, attrs(&[("a", AttrValue::Int(1))]));
        history.record_delete(id, attrs(&[("a", AttrValue::Int(1))]));
        history.commit();

        assert!(!history.can_undo());
    }

    #[test]
    fn repeated_updates_keep_earliest_before_latest_after() {
        let mut history = HistoryManager::new(10);
        let id = ObjectId::new();

        history.begin();
        history.record_update(id, "x", Some(AttrValue::Int(0)), AttrValue::Int(1));
        history.record_update(id, "x", Some(AttrValue::Int(1)), AttrValue::Int(2));
        history.record_update(id, "x", Some(AttrValue::Int(2)), AttrValue::Int(3));
        history.commit();

        let entry = history.undo().unwrap();
        match &entry.deltas()[&id] {
            RecordDelta::Fields { changes } => {
                assert_eq!(changes["x"].before, Some(AttrValue::Int(0)));
                assert_eq!(changes["x"].after, AttrValue::Int(3));
            }
            other => panic!("expected field delta, got {:?}", other),
        }
    }

    #[test]
    fn depth_bound_evicts_oldest() {
        let mut history = HistoryManager::new(2);
        for i in 0..4 {
            history.begin();
            history.record_update(ObjectId::new(), "x", None, AttrValue::Int(i));
            history.commit();
        }
        assert_eq!(history.undo_count(), 2);
    }

    #[test]
    fn new_commit_clears_redo() {
        let mut history = HistoryManager::new(10);
        let id = ObjectId::new();

        history.begin();
        history.record_update(id, "x", Some(AttrValue::Int(0)), AttrValue::Int(1));
        history.commit();
        history.undo().unwrap();
        assert!(history.can_redo());

        history.begin();
        history.record_update(id, "y", Some(AttrValue::Int(0)), AttrValue::Int(9));
        history.commit();
        assert!(!history.can_redo());
    }

    #[test]
    fn empty_transaction_pushes_nothing() {
        let mut history = HistoryManager::new(10);
        history.begin();
        history.commit();
        assert!(!history.can_undo());
    }
}
