//! Undo and redo by recording and replaying object diffs.
//!
//! Every local change in an observed store is folded into a pending
//! [`HistoryEntry`], bucketed by store. A create or delete records a full
//! field snapshot; an update records the field's old value, and only the
//! earliest old value seen while the entry is open is kept. `commit` closes the
//! entry and pushes it onto the undo stack.
//!
//! Replaying an entry recreates deleted objects, restores updated fields and
//! removes created objects, all in one transaction, and returns the reverse
//! entry. The reverse is built from what replay actually observed, not from
//! the recorded diff: remote edits may have landed in between. Objects that
//! are already present (or already gone) are skipped.
//!
//! Remote changes never enter history. Selection changes do, so that undo can
//! restore what was selected; an entry holding only a selection change made
//! while redo was available is dropped instead of breaking the redo chain.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use arcol_live::Fields;
use arcol_types::ObjectKey;
use indexmap::map::Entry;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::change::{ChangeManager, ChangeOrigin};
use crate::object::ArcolObject;
use crate::selection::{Selection, SelectionModel};
use crate::store::{ListenerId, ObjectChange, ObjectStore, StoreName};

/// Default bound on the undo stack.
pub const DEFAULT_MAX_UNDO_LEVELS: usize = 100;

/// Store operations replay needs, with keys in their storage form.
pub trait HistoryStore {
    fn store_name(&self) -> &StoreName;

    /// Every field of the object under `key`, or `None` if it is not present.
    fn fields_of(&self, key: &str) -> Option<Fields>;

    /// Set one field. Returns the value it had before, or `None` if the object
    /// is not present.
    fn set_field(&self, key: &str, field: &str, value: Value) -> Option<Value>;

    /// Rebuild objects from snapshots and add them together. Returns the keys
    /// that were added.
    fn recreate(&self, records: Vec<Fields>) -> Vec<String>;

    /// Remove an object and its subtree. Returns a snapshot of everything
    /// removed, children first.
    fn remove_subtree(&self, key: &str) -> Vec<(String, Fields)>;
}

impl<I: ObjectKey> HistoryStore for ObjectStore<I> {
    fn store_name(&self) -> &StoreName {
        self.name()
    }

    fn fields_of(&self, key: &str) -> Option<Fields> {
        self.get_by_key(key).map(|obj| obj.fields())
    }

    fn set_field(&self, key: &str, field: &str, value: Value) -> Option<Value> {
        let obj = self.get_by_key(key)?;
        let current = obj.get(field).unwrap_or(Value::Null);
        obj.set(field, value);
        Some(current)
    }

    fn recreate(&self, records: Vec<Fields>) -> Vec<String> {
        let mut objects = Vec::with_capacity(records.len());
        for record in records {
            match self.object_from_fields(record) {
                Ok(obj) => objects.push(obj),
                Err(e) => error!(store = %self.name(), "cannot recreate object: {e}"),
            }
        }
        let keys = objects.iter().map(|o| o.id().to_string()).collect();
        self.add_objects(objects);
        keys
    }

    fn remove_subtree(&self, key: &str) -> Vec<(String, Fields)> {
        let Some(obj) = self.get_by_key(key) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        collect_subtree(&obj, &mut removed);
        self.remove_object(&obj);
        removed
    }
}

fn collect_subtree<I: ObjectKey>(obj: &Rc<ArcolObject<I>>, out: &mut Vec<(String, Fields)>) {
    for child in obj.children() {
        collect_subtree(&child, out);
    }
    out.push((obj.id().to_string(), obj.fields()));
}

/// One object's change within an entry.
#[derive(Clone, Debug, PartialEq)]
pub enum Diff {
    /// The object was created. Holds its fields at creation.
    Create(Fields),
    /// The object was deleted. Holds its fields before deletion.
    Delete(Fields),
    /// Fields were changed. Holds each field's old value (`Null` if absent).
    Update(Fields),
}

/// One undoable step.
#[derive(Clone, Debug, Default)]
pub struct HistoryEntry {
    pub changes: IndexMap<StoreName, IndexMap<String, Diff>>,
    /// Selection before this step, if the step changed it.
    pub selection: Option<Selection>,
    pub redo_stack_was_empty: bool,
}

impl HistoryEntry {
    fn new(redo_stack_was_empty: bool) -> Self {
        Self {
            redo_stack_was_empty,
            ..Self::default()
        }
    }

    pub fn has_changes(&self) -> bool {
        self.changes.values().any(|bucket| !bucket.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_changes() && self.selection.is_none()
    }

    /// A selection-only entry recorded while redo was available.
    pub fn is_ignorable_selection_change(&self) -> bool {
        !self.redo_stack_was_empty && self.selection.is_some() && !self.has_changes()
    }

    pub fn diff(&self, store: &StoreName, key: &str) -> Option<&Diff> {
        self.changes.get(store)?.get(key)
    }

    fn insert(&mut self, store: &StoreName, key: String, diff: Diff) {
        self.changes.entry(store.clone()).or_default().insert(key, diff);
    }

    /// Fold one change into this entry.
    fn record(&mut self, store: &StoreName, key: String, change: &ObjectChange, snapshot: Fields) {
        let bucket = self.changes.entry(store.clone()).or_default();
        match (bucket.entry(key), change) {
            (Entry::Vacant(slot), ObjectChange::Create) => {
                slot.insert(Diff::Create(snapshot));
            }
            (Entry::Vacant(slot), ObjectChange::Delete) => {
                slot.insert(Diff::Delete(snapshot));
            }
            (Entry::Vacant(slot), ObjectChange::Update { property, old_value }) => {
                slot.insert(Diff::Update([(property.clone(), old_value.clone())].into()));
            }

            // Deleted then recreated in the same step: restore the old fields.
            (Entry::Occupied(mut slot), ObjectChange::Create) => match slot.get() {
                Diff::Delete(before) => {
                    let restore = fields_to_restore(before, &snapshot);
                    if restore.is_empty() {
                        slot.shift_remove();
                    } else {
                        slot.insert(Diff::Update(restore));
                    }
                }
                _ => warn!(store = %store, key = %slot.key(), "create for an object already in this step"),
            },

            (Entry::Occupied(mut slot), ObjectChange::Delete) => match slot.get() {
                Diff::Create(_) => {
                    slot.shift_remove();
                }
                Diff::Update(olds) => {
                    let mut before = snapshot;
                    for (field, old) in olds {
                        if old.is_null() {
                            before.remove(field);
                        } else {
                            before.insert(field.clone(), old.clone());
                        }
                    }
                    slot.insert(Diff::Delete(before));
                }
                Diff::Delete(_) => {}
            },

            (Entry::Occupied(mut slot), ObjectChange::Update { property, old_value }) => {
                if let Diff::Update(olds) = slot.get_mut() {
                    olds.entry(property.clone()).or_insert_with(|| old_value.clone());
                }
            }
        }
    }
}

/// Old values that turn `after` back into `before`.
fn fields_to_restore(before: &Fields, after: &Fields) -> Fields {
    before
        .keys()
        .chain(after.keys())
        .filter(|field| before.get(*field) != after.get(*field))
        .map(|field| (field.clone(), before.get(field).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Undo and redo stacks over a set of stores sharing one change manager.
pub struct UndoHistory {
    changes: Rc<ChangeManager>,
    stores: RefCell<IndexMap<StoreName, Rc<dyn HistoryStore>>>,
    selection: RefCell<Option<Rc<SelectionModel>>>,
    undo_stack: RefCell<Vec<HistoryEntry>>,
    redo_stack: RefCell<Vec<HistoryEntry>>,
    pending: RefCell<Option<HistoryEntry>>,
    ignore_depth: Cell<u32>,
    max_levels: usize,
    deferred_work: RefCell<Option<Rc<dyn Fn()>>>,
}

impl UndoHistory {
    /// `max_levels` of 0 keeps every entry.
    pub fn new(changes: Rc<ChangeManager>, max_levels: usize) -> Rc<Self> {
        Rc::new(Self {
            changes,
            stores: RefCell::new(IndexMap::new()),
            selection: RefCell::new(None),
            undo_stack: RefCell::new(Vec::new()),
            redo_stack: RefCell::new(Vec::new()),
            pending: RefCell::new(None),
            ignore_depth: Cell::new(0),
            max_levels,
            deferred_work: RefCell::new(None),
        })
    }

    /// Record local changes made in `store`.
    ///
    /// Stores are replayed in the order they are observed: recreation runs
    /// forwards and removal backwards, so observe endpoint stores before the
    /// relation stores that reference them.
    pub fn observe<I: ObjectKey>(self: &Rc<Self>, store: &Rc<ObjectStore<I>>) -> ListenerId {
        if !Rc::ptr_eq(store.changes(), &self.changes) {
            warn!(store = %store.name(), "observed store uses a different change manager");
        }
        let name = store.name().clone();
        let erased: Rc<dyn HistoryStore> = store.clone();
        self.stores.borrow_mut().insert(name.clone(), erased);

        let weak: Weak<Self> = Rc::downgrade(self);
        store.subscribe_object_change(move |obj, change, origin| {
            if let Some(history) = weak.upgrade() {
                history.on_change(&name, obj, change, origin);
            }
        })
    }

    /// Record selection changes and restore them on replay.
    pub fn observe_selection(self: &Rc<Self>, model: &Rc<SelectionModel>) {
        *self.selection.borrow_mut() = Some(Rc::clone(model));
        let weak = Rc::downgrade(self);
        model.subscribe(move |_, previous| {
            if let Some(history) = weak.upgrade() {
                history.on_selection_change(previous);
            }
        });
    }

    /// Work to flush at the start of every `commit`, so its changes land in
    /// the same step as whatever triggered them.
    pub fn set_deferred_work(&self, hook: impl Fn() + 'static) {
        *self.deferred_work.borrow_mut() = Some(Rc::new(hook));
    }

    pub fn on_change<I: ObjectKey>(
        &self,
        store: &StoreName,
        obj: &Rc<ArcolObject<I>>,
        change: &ObjectChange,
        origin: ChangeOrigin,
    ) {
        if origin == ChangeOrigin::Remote || self.is_ignoring() {
            return;
        }
        let redo_was_empty = {
            let mut redo = self.redo_stack.borrow_mut();
            let was_empty = redo.is_empty();
            redo.clear();
            was_empty
        };
        let snapshot = match change {
            ObjectChange::Update { .. } => Fields::new(),
            _ => obj.fields(),
        };
        self.pending
            .borrow_mut()
            .get_or_insert_with(|| HistoryEntry::new(redo_was_empty))
            .record(store, obj.id().to_string(), change, snapshot);
    }

    /// Remember the selection as it was before the first selection change in
    /// the open step.
    pub fn on_selection_change(&self, previous: &Selection) {
        if self.is_ignoring() {
            return;
        }
        let redo_was_empty = self.redo_stack.borrow().is_empty();
        let mut pending = self.pending.borrow_mut();
        let entry = pending.get_or_insert_with(|| HistoryEntry::new(redo_was_empty));
        if entry.selection.is_none() {
            entry.selection = Some(previous.clone());
        }
    }

    /// Flush deferred work, then close the open step.
    pub fn commit(&self) {
        let hook = self.deferred_work.borrow().clone();
        if let Some(hook) = hook {
            hook();
        }

        let Some(entry) = self.pending.borrow_mut().take() else {
            return;
        };
        if entry.is_empty() {
            return;
        }
        self.push_undo(entry);
    }

    fn push_undo(&self, entry: HistoryEntry) {
        let mut stack = self.undo_stack.borrow_mut();
        stack.push(entry);
        if self.max_levels > 0 && stack.len() > self.max_levels {
            stack.remove(0);
        }
    }

    /// Undo the latest step. Returns false if there was nothing to undo.
    pub fn undo(&self) -> bool {
        self.commit();
        let Some(entry) = self.undo_stack.borrow_mut().pop() else {
            return false;
        };
        let reverse = self.without_recording(|| self.apply(&entry));
        if !entry.is_ignorable_selection_change() {
            self.redo_stack.borrow_mut().push(reverse);
        }
        true
    }

    /// Redo the latest undone step. Returns false if there was nothing to redo.
    pub fn redo(&self) -> bool {
        let Some(entry) = self.redo_stack.borrow_mut().pop() else {
            return false;
        };
        // A selection change can open a step without clearing redo.
        self.pending.borrow_mut().take();
        {
            let mut undo = self.undo_stack.borrow_mut();
            while undo.last().is_some_and(HistoryEntry::is_ignorable_selection_change) {
                undo.pop();
            }
        }
        let reverse = self.without_recording(|| self.apply(&entry));
        self.push_undo(reverse);
        true
    }

    /// Replay `entry` and return its reverse.
    fn apply(&self, entry: &HistoryEntry) -> HistoryEntry {
        // Observation order: endpoints come back before the relations on them.
        let stores: Vec<(StoreName, Rc<dyn HistoryStore>)> = self
            .stores
            .borrow()
            .iter()
            .filter(|(name, _)| entry.changes.contains_key(*name))
            .map(|(name, store)| (name.clone(), Rc::clone(store)))
            .collect();
        for name in entry.changes.keys() {
            if !self.stores.borrow().contains_key(name) {
                warn!(store = %name, "history refers to a store that is not observed");
            }
        }

        let mut reverse = HistoryEntry::new(true);
        self.changes.make_changes(|_| {
            for (name, store) in &stores {
                let Some(bucket) = entry.changes.get(name) else {
                    continue;
                };
                let records: Vec<Fields> = bucket
                    .iter()
                    .filter_map(|(key, diff)| match diff {
                        Diff::Delete(fields) if store.fields_of(key).is_none() => Some(fields.clone()),
                        _ => None,
                    })
                    .collect();
                for key in store.recreate(records) {
                    let fields = store.fields_of(&key).unwrap_or_default();
                    reverse.insert(name, key, Diff::Create(fields));
                }
            }

            for (name, store) in &stores {
                let Some(bucket) = entry.changes.get(name) else {
                    continue;
                };
                for (key, diff) in bucket {
                    let Diff::Update(olds) = diff else {
                        continue;
                    };
                    let mut observed = Fields::new();
                    for (field, value) in olds {
                        match store.set_field(key, field, value.clone()) {
                            Some(current) => {
                                observed.insert(field.clone(), current);
                            }
                            None => break,
                        }
                    }
                    if !observed.is_empty() {
                        reverse.insert(name, key.clone(), Diff::Update(observed));
                    }
                }
            }

            for (name, store) in stores.iter().rev() {
                let Some(bucket) = entry.changes.get(name) else {
                    continue;
                };
                for (key, diff) in bucket.iter().rev() {
                    if !matches!(diff, Diff::Create(_)) {
                        continue;
                    }
                    for (removed, fields) in store.remove_subtree(key) {
                        reverse.insert(name, removed, Diff::Delete(fields));
                    }
                }
            }
        });

        if let Some(selection) = &entry.selection {
            let model = self.selection.borrow().clone();
            if let Some(model) = model {
                reverse.selection = Some(model.get());
                model.set(selection.clone());
            }
        }

        debug!(
            stores = entry.changes.len(),
            selection = entry.selection.is_some(),
            "replayed history entry"
        );
        reverse
    }

    /// Run `f` without recording its changes.
    pub fn without_recording<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = IgnoreGuard::enter(&self.ignore_depth);
        f()
    }

    pub fn is_ignoring(&self) -> bool {
        self.ignore_depth.get() > 0
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.borrow().is_empty() || self.pending.borrow().is_some()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.borrow().is_empty()
    }

    pub fn undo_levels(&self) -> usize {
        self.undo_stack.borrow().len()
    }

    pub fn redo_levels(&self) -> usize {
        self.redo_stack.borrow().len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }

    /// Drop all history, including the open step.
    pub fn clear(&self) {
        self.undo_stack.borrow_mut().clear();
        self.redo_stack.borrow_mut().clear();
        self.pending.borrow_mut().take();
    }
}

impl fmt::Debug for UndoHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoHistory")
            .field("stores", &self.stores.borrow().keys().collect::<Vec<_>>())
            .field("undo", &self.undo_levels())
            .field("redo", &self.redo_levels())
            .field("pending", &self.has_pending())
            .finish()
    }
}

struct IgnoreGuard<'a>(&'a Cell<u32>);

impl<'a> IgnoreGuard<'a> {
    fn enter(depth: &'a Cell<u32>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for IgnoreGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::HierarchyIndex;
    use crate::store::PlainFactory;
    use arcol_live::Room;
    use arcol_types::{fields, ElementId};
    use serde_json::json;

    struct Fixture {
        room: Room,
        store: Rc<ObjectStore<String>>,
        history: Rc<UndoHistory>,
    }

    fn fixture() -> Fixture {
        let room = Room::new();
        let changes = Rc::new(ChangeManager::new(room.clone()));
        let store = ObjectStore::new(changes.clone(), "nodes", PlainFactory).unwrap();
        HierarchyIndex::install(&store);
        let history = UndoHistory::new(changes, DEFAULT_MAX_UNDO_LEVELS);
        history.observe(&store);
        Fixture { room, store, history }
    }

    fn create(store: &ObjectStore<String>, id: &str, parent: Option<&str>) -> Rc<ArcolObject<String>> {
        store.make_changes(|_| {
            let mut record: Fields = [(fields::ID.to_string(), json!(id))].into();
            if let Some(parent) = parent {
                record.insert(fields::PARENT_ID.into(), json!(parent));
                record.insert(fields::PARENT_INDEX.into(), json!(format!("V{id}")));
            }
            let obj = store.object_from_fields(record).unwrap();
            store.add_object(Rc::clone(&obj));
            obj
        })
    }

    fn name() -> StoreName {
        StoreName::new("nodes")
    }

    #[test]
    fn test_update_keeps_earliest_old_value() {
        let f = fixture();
        let a = create(&f.store, "a", None);
        f.history.commit();

        f.store.make_changes(|_| {
            a.set("height", 1);
            a.set("height", 2);
        });
        f.store.make_changes(|_| a.set("height", 3));

        let entry = f.history.pending.borrow().clone().unwrap();
        assert_eq!(entry.diff(&name(), "a"), Some(&Diff::Update([("height".into(), Value::Null)].into())));
    }

    #[test]
    fn test_create_then_delete_cancels() {
        let f = fixture();
        f.store.make_changes(|_| {
            let obj = f
                .store
                .object_from_fields([(fields::ID.to_string(), json!("a"))].into())
                .unwrap();
            f.store.add_object(Rc::clone(&obj));
            obj.delete();
        });
        f.history.commit();
        assert_eq!(f.history.undo_levels(), 0);
    }

    #[test]
    fn test_update_then_delete_records_original_fields() {
        let f = fixture();
        let a = create(&f.store, "a", None);
        f.store.make_changes(|_| a.set("color", "#888888"));
        f.history.commit();

        f.store.make_changes(|_| {
            a.set("color", "#ff0000");
            a.set("height", 4);
            a.delete();
        });
        let entry = f.history.pending.borrow().clone().unwrap();
        let Some(Diff::Delete(before)) = entry.diff(&name(), "a") else {
            panic!("expected delete diff");
        };
        assert_eq!(before.get("color"), Some(&json!("#888888")));
        assert!(!before.contains_key("height"));
    }

    #[test]
    fn test_undo_redo_update_round_trip() {
        let f = fixture();
        let a = create(&f.store, "a", None);
        f.store.make_changes(|_| a.set("height", 1));
        f.history.commit();
        let before = a.fields();

        f.store.make_changes(|_| {
            a.set("height", 2);
            a.set("color", "#00ff00");
        });
        f.history.commit();
        let after = a.fields();

        assert!(f.history.undo());
        assert_eq!(a.get("height"), Some(json!(1)));
        assert!(f.history.redo());
        assert_eq!(a.fields(), after);
        assert!(f.history.undo());
        assert_eq!(a.get("height"), before.get("height").cloned());
    }

    #[test]
    fn test_undo_create_and_redo() {
        let f = fixture();
        create(&f.store, "a", None);
        f.history.commit();

        f.history.undo();
        assert!(f.store.is_empty());
        assert!(f.room.collection("nodes").is_empty());

        f.history.redo();
        assert!(f.store.get_by_key("a").is_some());
        assert!(f.room.collection("nodes").contains_key("a"));
    }

    #[test]
    fn test_undo_delete_restores_subtree() {
        let f = fixture();
        let root = create(&f.store, "root", None);
        create(&f.store, "child", Some("root"));
        create(&f.store, "leaf", Some("child"));
        f.history.commit();

        f.store.make_changes(|_| root.delete());
        f.history.commit();
        assert!(f.store.is_empty());

        f.history.undo();
        let root = f.store.get_by_key("root").unwrap();
        let child = f.store.get_by_key("child").unwrap();
        assert_eq!(root.children().len(), 1);
        assert_eq!(child.children()[0].id(), "leaf");

        f.history.redo();
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_undo_create_captures_children_added_later() {
        let f = fixture();
        create(&f.store, "group", None);
        f.history.commit();
        create(&f.store, "late", Some("group"));
        f.history.clear();

        // Recreate the group's creation step by hand, then undo it.
        f.history.push_undo(HistoryEntry {
            changes: [(name(), [("group".to_string(), Diff::Create(Fields::new()))].into())].into(),
            selection: None,
            redo_stack_was_empty: true,
        });
        f.history.undo();
        assert!(f.store.is_empty());

        f.history.redo();
        let group = f.store.get_by_key("group").unwrap();
        assert_eq!(group.children()[0].id(), "late");
    }

    #[test]
    fn test_remote_changes_are_not_recorded() {
        let f = fixture();
        create(&f.store, "a", None);
        f.history.commit();

        f.room.apply_remote(|b| {
            b.set("nodes", "a", "height", json!(9));
        });
        assert!(!f.history.has_pending());
    }

    #[test]
    fn test_undo_uses_value_observed_at_replay() {
        let f = fixture();
        let a = create(&f.store, "a", None);
        f.store.make_changes(|_| a.set("height", 0));
        f.history.commit();
        f.store.make_changes(|_| a.set("height", 5));
        f.history.commit();

        f.room.apply_remote(|b| {
            b.set("nodes", "a", "height", json!(9));
        });

        f.history.undo();
        assert_eq!(a.get("height"), Some(json!(0)));
        f.history.redo();
        assert_eq!(a.get("height"), Some(json!(9)));
    }

    #[test]
    fn test_replay_skips_missing_objects() {
        let f = fixture();
        let a = create(&f.store, "a", None);
        f.history.commit();
        f.store.make_changes(|_| a.set("height", 5));
        f.history.commit();

        f.room.apply_remote(|b| {
            b.delete("nodes", "a");
        });

        assert!(f.history.undo());
        assert!(f.store.is_empty());
        assert!(f.history.can_redo());
    }

    #[test]
    fn test_new_change_clears_redo() {
        let f = fixture();
        create(&f.store, "a", None);
        f.history.commit();
        f.history.undo();
        assert!(f.history.can_redo());

        create(&f.store, "b", None);
        assert!(!f.history.can_redo());
    }

    #[test]
    fn test_noop_set_adds_no_history() {
        let f = fixture();
        let a = create(&f.store, "a", None);
        f.store.make_changes(|_| a.set("height", 1));
        f.history.commit();
        let levels = f.history.undo_levels();

        f.store.make_changes(|_| a.set("height", 1));
        f.history.commit();
        assert_eq!(f.history.undo_levels(), levels);
    }

    #[test]
    fn test_max_levels_drops_oldest() {
        let room = Room::new();
        let changes = Rc::new(ChangeManager::new(room));
        let store = ObjectStore::new(changes.clone(), "nodes", PlainFactory).unwrap();
        let history = UndoHistory::new(changes, 2);
        history.observe(&store);

        let a = create(&store, "a", None);
        history.commit();
        for height in 1..=3 {
            store.make_changes(|_| a.set("height", height));
            history.commit();
        }
        assert_eq!(history.undo_levels(), 2);
        history.undo();
        history.undo();
        assert!(!history.undo());
        assert_eq!(a.get("height"), Some(json!(1)));
    }

    #[test]
    fn test_commit_runs_deferred_work_into_same_step() {
        let f = fixture();
        let a = create(&f.store, "a", None);
        f.history.commit();

        let target = Rc::clone(&a);
        let store = Rc::clone(&f.store);
        f.history.set_deferred_work(move || {
            if target.get("height").is_some() {
                store.make_changes(|_| target.set("derived", true));
            }
        });

        f.store.make_changes(|_| a.set("height", 2));
        f.history.commit();
        assert_eq!(f.history.undo_levels(), 2);

        f.history.undo();
        assert_eq!(a.get("height"), None);
        assert_eq!(a.get("derived"), None);
    }

    #[test]
    fn test_selection_only_entry_while_redo_available_is_skipped() {
        let f = fixture();
        let model = Rc::new(SelectionModel::new());
        f.history.observe_selection(&model);

        let a = create(&f.store, "a", None);
        f.history.commit();
        f.store.make_changes(|_| a.set("height", 1));
        f.history.commit();

        f.history.undo();
        assert_eq!(f.history.redo_levels(), 1);

        model.set([ElementId::new()].into());
        f.history.commit();
        assert_eq!(f.history.redo_levels(), 1);

        f.history.redo();
        assert_eq!(a.get("height"), Some(json!(1)));
        // The selection entry was dropped rather than left above the redone step.
        assert_eq!(f.history.undo_levels(), 2);
    }

    #[test]
    fn test_undo_restores_selection() {
        let f = fixture();
        let model = Rc::new(SelectionModel::new());
        f.history.observe_selection(&model);
        let first = ElementId::new();
        let second = ElementId::new();

        model.set([first].into());
        f.history.commit();
        model.set([second].into());
        model.set([first, second].into());
        f.history.commit();

        f.history.undo();
        assert_eq!(model.get(), Selection::from([first]));
        f.history.redo();
        assert_eq!(model.get(), Selection::from([first, second]));
    }

    #[test]
    fn test_entry_spanning_stores_replays_in_order() {
        let room = Room::new();
        let changes = Rc::new(ChangeManager::new(room));
        let nodes = ObjectStore::<String>::new(changes.clone(), "nodes", PlainFactory).unwrap();
        let tags = ObjectStore::<String>::new(changes.clone(), "tags", PlainFactory).unwrap();
        let history = UndoHistory::new(changes.clone(), 0);
        history.observe(&nodes);
        history.observe(&tags);

        changes.make_changes(|_| {
            for (store, id) in [(&nodes, "n"), (&tags, "t")] {
                let obj = store
                    .object_from_fields([(fields::ID.to_string(), json!(id))].into())
                    .unwrap();
                store.add_object(obj);
            }
        });
        history.commit();
        assert_eq!(history.undo_levels(), 1);

        history.undo();
        assert!(nodes.is_empty() && tags.is_empty());
        history.redo();
        assert_eq!((nodes.len(), tags.len()), (1, 1));
    }

    #[test]
    fn test_delete_then_recreate_becomes_update() {
        let mut entry = HistoryEntry::new(true);
        let before: Fields = [("id".into(), json!("a")), ("height".into(), json!(1))].into();
        let after: Fields = [("id".into(), json!("a")), ("color".into(), json!("red"))].into();
        entry.record(&name(), "a".into(), &ObjectChange::Delete, before);
        entry.record(&name(), "a".into(), &ObjectChange::Create, after);

        let expected: Fields = [("color".into(), Value::Null), ("height".into(), json!(1))].into();
        assert_eq!(entry.diff(&name(), "a"), Some(&Diff::Update(expected)));
    }
}
