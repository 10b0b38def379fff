//! An operation-log document that converges under any merge order
//!
//! State is never stored directly. The document keeps every [`Change`] it
//! has seen, keyed by `(author, seq)`, and materializes items on demand:
//! fields resolve latest-wins, removals only cancel what their author had
//! observed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::horizon::{DeviceId, Horizon, SeqNum};
use super::operation::{Change, ChangeId, ItemId, Operation, Value};
use super::CrdtDocument;
use crate::error::FeedError;

/// Materialized state of one item.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemState {
    pub item_type: String,
    pub fields: BTreeMap<String, Value>,
    pub sets: BTreeMap<String, BTreeSet<Value>>,
    pub exists: bool,
}

/// Materialized state of a document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentState {
    pub items: BTreeMap<ItemId, ItemState>,
}

impl DocumentState {
    pub fn get(&self, item_id: &str) -> Option<&ItemState> {
        self.items.get(item_id).filter(|item| item.exists)
    }

    pub fn iter_existing(&self) -> impl Iterator<Item = (&ItemId, &ItemState)> {
        self.items.iter().filter(|(_, item)| item.exists)
    }
}

/// Persisted form of a [`ConvergentDocument`].
#[derive(Serialize, Deserialize)]
struct SavedDocument {
    device_id: DeviceId,
    next_seq: SeqNum,
    changes: Vec<Change>,
}

#[derive(Clone, Debug)]
pub struct ConvergentDocument {
    device_id: DeviceId,
    next_seq: SeqNum,
    horizon: Horizon,
    max_timestamp: u64,
    changes: BTreeMap<(DeviceId, SeqNum), Change>,
}

impl ConvergentDocument {
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            next_seq: 1,
            horizon: Horizon::new(),
            max_timestamp: 0,
            changes: BTreeMap::new(),
        }
    }

    /// A new replica with a random device id.
    pub fn new_replica() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Copy of this document's changes under another device id.
    pub fn fork(&self, device_id: impl Into<DeviceId>) -> Self {
        let device_id = device_id.into();
        Self {
            next_seq: self.horizon.get(&device_id) + 1,
            device_id,
            ..self.clone()
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn horizon(&self) -> &Horizon {
        &self.horizon
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Record a local operation.
    pub fn apply_local(&mut self, op: Operation) -> Change {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let change = Change {
            id: Uuid::new_v4(),
            author: self.device_id.clone(),
            seq: self.next_seq,
            timestamp: now.max(self.max_timestamp + 1),
            horizon: self.horizon.clone(),
            op,
        };
        self.next_seq += 1;
        self.store(change.clone());
        change
    }

    /// Record a change from another replica. Returns false if it was
    /// already known.
    pub fn apply_remote(&mut self, change: Change) -> bool {
        if self.horizon.has_seen(&change.author, change.seq)
            && self.changes.contains_key(&(change.author.clone(), change.seq))
        {
            return false;
        }
        if change.author == self.device_id && change.seq >= self.next_seq {
            // Our own changes coming back from an earlier session
            self.next_seq = change.seq + 1;
        }
        self.store(change);
        true
    }

    fn store(&mut self, change: Change) {
        self.horizon.observe(&change.author, change.seq);
        self.max_timestamp = self.max_timestamp.max(change.timestamp);
        self.changes.insert((change.author.clone(), change.seq), change);
    }

    /// Changes not covered by `since`, in `(author, seq)` order.
    pub fn changes_since(&self, since: &Horizon) -> Vec<Change> {
        self.changes
            .iter()
            .filter(|((author, seq), _)| !since.has_seen(author, *seq))
            .map(|(_, change)| change.clone())
            .collect()
    }

    pub fn add_item(&mut self, item_id: &str, item_type: &str) -> Change {
        self.apply_local(Operation::AddItem {
            item_id: item_id.to_string(),
            item_type: item_type.to_string(),
        })
    }

    pub fn remove_item(&mut self, item_id: &str) -> Change {
        self.apply_local(Operation::RemoveItem {
            item_id: item_id.to_string(),
        })
    }

    /// Set a field, creating the item first if it does not exist yet.
    pub fn set(&mut self, item_id: &str, field: &str, value: impl Into<Value>) -> Change {
        if self.materialize().get(item_id).is_none() {
            self.add_item(item_id, "item");
        }
        self.apply_local(Operation::SetField {
            item_id: item_id.to_string(),
            field: field.to_string(),
            value: value.into(),
        })
    }

    pub fn add_to_set(&mut self, item_id: &str, set_name: &str, element: Value) -> Change {
        self.apply_local(Operation::AddToSet {
            item_id: item_id.to_string(),
            set_name: set_name.to_string(),
            element,
        })
    }

    /// Remove `element`, cancelling every add of it seen so far.
    pub fn remove_from_set(&mut self, item_id: &str, set_name: &str, element: Value) -> Change {
        let observed_adds = self
            .changes
            .values()
            .filter(|change| match &change.op {
                Operation::AddToSet {
                    item_id: i,
                    set_name: s,
                    element: e,
                } => i == item_id && s == set_name && *e == element,
                _ => false,
            })
            .map(|change| change.id)
            .collect();
        self.apply_local(Operation::RemoveFromSet {
            item_id: item_id.to_string(),
            set_name: set_name.to_string(),
            element,
            observed_adds,
        })
    }

    /// Current value of one field of an existing item.
    pub fn get(&self, item_id: &str, field: &str) -> Option<Value> {
        self.materialize()
            .get(item_id)
            .and_then(|item| item.fields.get(field).cloned())
    }

    pub fn materialize(&self) -> DocumentState {
        let mut by_item: BTreeMap<&ItemId, Vec<&Change>> = BTreeMap::new();
        for change in self.changes.values() {
            by_item.entry(change.op.item_id()).or_default().push(change);
        }

        let items = by_item
            .into_iter()
            .map(|(item_id, changes)| (item_id.clone(), materialize_item(changes)))
            .collect();
        DocumentState { items }
    }
}

fn materialize_item(mut changes: Vec<&Change>) -> ItemState {
    changes.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

    let mut item = ItemState::default();
    let mut adds = Vec::new();
    let mut removes = Vec::new();
    let mut edits = Vec::new();
    let mut set_adds: BTreeMap<(&str, &Value), Vec<ChangeId>> = BTreeMap::new();
    let mut set_removes: BTreeMap<(&str, &Value), BTreeSet<ChangeId>> = BTreeMap::new();

    for change in changes {
        match &change.op {
            Operation::AddItem { item_type, .. } => {
                item.item_type = item_type.clone();
                adds.push(change);
            }
            Operation::RemoveItem { .. } => removes.push(change),
            Operation::SetField { field, value, .. } => {
                // Sorted ascending, so the last write wins
                item.fields.insert(field.clone(), value.clone());
                edits.push(change);
            }
            Operation::AddToSet {
                set_name, element, ..
            } => set_adds
                .entry((set_name.as_str(), element))
                .or_default()
                .push(change.id),
            Operation::RemoveFromSet {
                set_name,
                element,
                observed_adds,
                ..
            } => set_removes
                .entry((set_name.as_str(), element))
                .or_default()
                .extend(observed_adds.iter().copied()),
        }
    }

    // Alive if some add or edit escaped a removal that had not seen it
    item.exists = !adds.is_empty()
        && (removes.is_empty()
            || adds
                .iter()
                .chain(edits.iter())
                .any(|change| removes.iter().any(|removal| !removal.had_seen(change))));

    for ((set_name, element), add_ids) in set_adds {
        let cancelled = set_removes.get(&(set_name, element));
        let present = add_ids
            .iter()
            .any(|id| cancelled.map_or(true, |cancelled| !cancelled.contains(id)));
        if present {
            item.sets
                .entry(set_name.to_string())
                .or_default()
                .insert(element.clone());
        }
    }
    item
}

impl CrdtDocument for ConvergentDocument {
    type Changes = Vec<Change>;
    type Heads = Horizon;

    fn heads(&self) -> Horizon {
        self.horizon.clone()
    }

    fn diff(&self, since: Option<&Self>) -> Vec<Change> {
        match since {
            Some(since) => self.changes_since(&since.horizon),
            None => self.changes_since(&Horizon::new()),
        }
    }

    fn changes_are_empty(changes: &Vec<Change>) -> bool {
        changes.is_empty()
    }

    fn apply_changes(&mut self, changes: Vec<Change>) -> Result<(), FeedError> {
        for change in changes {
            self.apply_remote(change);
        }
        Ok(())
    }

    fn merge(&mut self, other: &Self) -> Result<(), FeedError> {
        self.apply_changes(other.changes_since(&self.horizon))
    }

    fn save(&self) -> Result<Vec<u8>, FeedError> {
        let saved = SavedDocument {
            device_id: self.device_id.clone(),
            next_seq: self.next_seq,
            changes: self.changes.values().cloned().collect(),
        };
        Ok(serde_json::to_vec(&saved)?)
    }

    fn load(bytes: &[u8]) -> Result<Self, FeedError> {
        let saved: SavedDocument = serde_json::from_slice(bytes)
            .map_err(|e| FeedError::Crdt(format!("malformed document: {}", e)))?;
        let mut doc = ConvergentDocument::new(saved.device_id);
        doc.apply_changes(saved.changes)?;
        doc.next_seq = doc.next_seq.max(saved.next_seq);
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut doc = ConvergentDocument::new("A");
        doc.set("root", "x", 1i64);
        doc.set("root", "x", 2i64);
        assert_eq!(doc.get("root", "x"), Some(Value::Int(2)));
        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn test_informed_remove_keeps_unseen_edit() {
        let mut a = ConvergentDocument::new("A");
        let mut b = ConvergentDocument::new("B");

        let add = a.add_item("task", "Task");
        b.apply_remote(add);
        let edit = b.set("task", "title", "B's edit");
        let removal = a.remove_item("task");

        a.apply_remote(edit);
        b.apply_remote(removal);
        assert!(a.materialize().get("task").is_some());
        assert_eq!(a.materialize(), b.materialize());
    }

    #[test]
    fn test_set_remove_only_cancels_observed_adds() {
        let mut a = ConvergentDocument::new("A");
        let mut b = ConvergentDocument::new("B");
        a.add_item("t", "Task");
        a.add_to_set("t", "tags", Value::string("urgent"));
        b.merge(&a).unwrap();

        b.remove_from_set("t", "tags", Value::string("urgent"));
        a.add_to_set("t", "tags", Value::string("urgent"));
        a.merge(&b).unwrap();
        b.merge(&a).unwrap();

        for doc in [&a, &b] {
            let state = doc.materialize();
            assert!(state.get("t").unwrap().sets["tags"].contains(&Value::string("urgent")));
        }
    }

    #[test]
    fn test_diff_and_apply() {
        let mut a = ConvergentDocument::new("A");
        a.set("root", "x", 1i64);
        let snapshot = a.clone();
        a.set("root", "y", 2i64);

        let changes = a.diff(Some(&snapshot));
        assert_eq!(changes.len(), 1);
        assert!(ConvergentDocument::changes_are_empty(&a.diff(Some(&a))));

        let mut b = ConvergentDocument::new("B");
        b.apply_changes(a.diff(None)).unwrap();
        assert_eq!(b.heads(), a.heads());
        assert_eq!(b.get("root", "y"), Some(Value::Int(2)));
    }

    #[test]
    fn test_save_load_preserves_sequence() {
        let mut a = ConvergentDocument::new("A");
        a.set("root", "x", 1i64);
        let mut loaded = ConvergentDocument::load(&a.save().unwrap()).unwrap();
        assert_eq!(loaded.heads(), a.heads());

        let next = loaded.set("root", "x", 5i64);
        assert_eq!(next.seq, 3);
    }

    #[test]
    fn test_fork_continues_own_sequence() {
        let mut a = ConvergentDocument::new("A");
        a.set("root", "x", 1i64);
        let mut b = a.fork("B");
        let change = b.set("root", "x", 2i64);
        assert_eq!(change.seq, 1);
        assert_eq!(b.get("root", "x"), Some(Value::Int(2)));
    }
}
