//! Parent/child structure over the objects of one store.
//!
//! Parentage is persisted as two fields on the child: `parentId` and a
//! fractional `parentIndex`. Each parent keeps a derived set of child ids plus
//! a lazily sorted list, ordered by `(parentIndex, id)`. The set is only ever
//! changed by [`HierarchyIndex`] reacting to create, delete and
//! `parentId`/`parentIndex` update events.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use arcol_live::key_between;
use arcol_types::{fields, ObjectKey};
use serde_json::Value;
use tracing::{trace, warn};

use crate::change::ChangeOrigin;
use crate::object::ArcolObject;
use crate::store::{ListenerId, ObjectChange, ObjectStore};

/// Ancestor walks give up past this depth.
pub const MAX_HIERARCHY_DEPTH: usize = 1024;

/// Derived children of one object.
pub(crate) struct ChildSet<I> {
    ids: RefCell<HashSet<I>>,
    sorted: RefCell<Option<Vec<I>>>,
}

impl<I> Default for ChildSet<I> {
    fn default() -> Self {
        Self {
            ids: RefCell::new(HashSet::new()),
            sorted: RefCell::new(None),
        }
    }
}

impl<I: ObjectKey> ChildSet<I> {
    fn add(&self, id: I) {
        if self.ids.borrow_mut().insert(id) {
            self.invalidate();
        }
    }

    fn remove(&self, id: &I) {
        if self.ids.borrow_mut().remove(id) {
            self.invalidate();
        }
    }

    fn invalidate(&self) {
        self.sorted.borrow_mut().take();
    }

    fn is_empty(&self) -> bool {
        self.ids.borrow().is_empty()
    }
}

fn parse_key<I: ObjectKey>(value: &Value) -> Option<I> {
    value.as_str().and_then(|s| s.parse().ok())
}

impl<I: ObjectKey> ArcolObject<I> {
    pub fn parent_id(&self) -> Option<I> {
        self.get(fields::PARENT_ID).as_ref().and_then(parse_key)
    }

    pub fn parent_index(&self) -> Option<String> {
        self.get_as(fields::PARENT_INDEX)
    }

    pub fn parent(&self) -> Option<Rc<ArcolObject<I>>> {
        let parent_id = self.parent_id()?;
        self.store()?.get_by_id(&parent_id)
    }

    /// Children sorted by `(parentIndex, id)`.
    pub fn children(&self) -> Vec<Rc<ArcolObject<I>>> {
        let Some(store) = self.store() else {
            return Vec::new();
        };
        if self.children.is_empty() {
            return Vec::new();
        }

        if let Some(sorted) = self.children.sorted.borrow().as_ref() {
            return sorted.iter().filter_map(|id| store.get_by_id(id)).collect();
        }

        let mut children: Vec<Rc<ArcolObject<I>>> = self
            .children
            .ids
            .borrow()
            .iter()
            .filter_map(|id| store.get_by_id(id))
            .collect();
        children.sort_by_cached_key(|c| (c.parent_index(), c.id().clone()));
        *self.children.sorted.borrow_mut() =
            Some(children.iter().map(|c| c.id().clone()).collect());
        children
    }

    pub fn last_child(&self) -> Option<Rc<ArcolObject<I>>> {
        self.children().pop()
    }

    /// Position among the parent's sorted children, `None` if detached.
    pub fn index_in_parent(&self) -> Option<usize> {
        self.parent()?
            .children()
            .iter()
            .position(|c| c.id() == self.id())
    }

    /// Whether `other` is somewhere below this object.
    pub fn is_ancestor_of(&self, other: &ArcolObject<I>) -> bool {
        let mut current = other.parent();
        let mut depth = 0;
        while let Some(node) = current {
            if node.id() == self.id() {
                return true;
            }
            depth += 1;
            if depth > MAX_HIERARCHY_DEPTH {
                warn!(id = %other.id(), "hierarchy deeper than {MAX_HIERARCHY_DEPTH}, assuming cycle");
                return true;
            }
            current = node.parent();
        }
        false
    }

    fn check_move(self: &Rc<Self>, parent: &Rc<Self>) -> bool {
        if !self.can_mutate() {
            warn!(id = %self.id(), "hierarchy move outside make_changes ignored");
            return false;
        }
        if Rc::ptr_eq(self, parent) || self.is_ancestor_of(parent) {
            warn!(id = %self.id(), parent = %parent.id(), "move would make object its own ancestor");
            return false;
        }
        true
    }

    /// Make this object the last child of `parent`.
    pub fn set_parent(self: &Rc<Self>, parent: &Rc<Self>) {
        if !self.check_move(parent) {
            return;
        }
        let after = parent.last_child().and_then(|c| c.parent_index());
        let key = key_between(after.as_deref(), None);
        self.set(fields::PARENT_ID, parent.id().to_string());
        self.set(fields::PARENT_INDEX, key);
    }

    /// Move under `parent` so this object ends up at `index` among its
    /// children. `index` is clamped to the child count.
    pub fn move_to_parent_at_index(self: &Rc<Self>, parent: &Rc<Self>, index: usize) {
        if !self.check_move(parent) {
            return;
        }
        let siblings: Vec<_> = parent
            .children()
            .into_iter()
            .filter(|c| !Rc::ptr_eq(c, self))
            .collect();
        let index = index.min(siblings.len());

        let same_parent = self.parent_id().as_ref() == Some(parent.id());
        if same_parent && self.index_in_parent() == Some(index) {
            return;
        }

        let before = index
            .checked_sub(1)
            .and_then(|i| siblings.get(i))
            .and_then(|s| s.parent_index());
        let after = siblings.get(index).and_then(|s| s.parent_index());
        let key = key_between(before.as_deref(), after.as_deref());

        self.set(fields::PARENT_ID, parent.id().to_string());
        self.set(fields::PARENT_INDEX, key);
    }
}

/// Keeps every parent's child set in step with change events.
///
/// A child whose parent is not in the store yet waits in `orphans` and is
/// adopted when the parent is created. Remote batches and undo replay can
/// both deliver children ahead of their parent.
pub struct HierarchyIndex<I: ObjectKey> {
    orphans: RefCell<HashMap<I, HashSet<I>>>,
}

impl<I: ObjectKey> HierarchyIndex<I> {
    /// Register every loaded object with its parent, then listen for changes.
    ///
    /// Install before any other listener on the store.
    pub fn install(store: &Rc<ObjectStore<I>>) -> ListenerId {
        let index = Self {
            orphans: RefCell::new(HashMap::new()),
        };
        for obj in store.get_objects() {
            index.attach(&obj);
        }

        let weak = Rc::downgrade(store);
        store.subscribe_object_change(move |obj, change, origin| {
            if let Some(store) = weak.upgrade() {
                index.on_change(&store, obj, change, origin);
            }
        })
    }

    fn attach(&self, obj: &ArcolObject<I>) {
        if let Some(parent) = obj.parent() {
            parent.children.add(obj.id().clone());
        } else if let Some(parent_id) = obj.parent_id() {
            trace!(id = %obj.id(), parent = %parent_id, "parent not in store, waiting");
            self.orphans
                .borrow_mut()
                .entry(parent_id)
                .or_default()
                .insert(obj.id().clone());
        }
    }

    fn detach(&self, store: &ObjectStore<I>, obj: &ArcolObject<I>, parent_id: Option<I>) {
        let Some(parent_id) = parent_id else {
            return;
        };
        if let Some(parent) = store.get_by_id(&parent_id) {
            parent.children.remove(obj.id());
            return;
        }
        let mut orphans = self.orphans.borrow_mut();
        if let Some(waiting) = orphans.get_mut(&parent_id) {
            waiting.remove(obj.id());
            if waiting.is_empty() {
                orphans.remove(&parent_id);
            }
        }
    }

    fn adopt(&self, store: &ObjectStore<I>, parent: &ArcolObject<I>) {
        let Some(waiting) = self.orphans.borrow_mut().remove(parent.id()) else {
            return;
        };
        for id in waiting {
            if let Some(child) = store.get_by_id(&id)
                && child.parent_id().as_ref() == Some(parent.id())
            {
                parent.children.add(id);
            }
        }
    }

    fn on_change(
        &self,
        store: &ObjectStore<I>,
        obj: &Rc<ArcolObject<I>>,
        change: &ObjectChange,
        _origin: ChangeOrigin,
    ) {
        match change {
            ObjectChange::Create => {
                self.attach(obj);
                self.adopt(store, obj);
            }
            ObjectChange::Delete => {
                self.detach(store, obj, obj.parent_id());
                // Children left behind by a remote delete wait for a new parent.
                let left: Vec<I> = obj.children.ids.borrow_mut().drain().collect();
                obj.children.invalidate();
                if !left.is_empty() {
                    self.orphans
                        .borrow_mut()
                        .entry(obj.id().clone())
                        .or_default()
                        .extend(left);
                }
            }
            ObjectChange::Update { property, old_value } if property == fields::PARENT_ID => {
                self.detach(store, obj, parse_key(old_value));
                self.attach(obj);
            }
            ObjectChange::Update { property, .. } if property == fields::PARENT_INDEX => {
                if let Some(parent) = obj.parent() {
                    parent.children.invalidate();
                }
            }
            ObjectChange::Update { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeManager;
    use crate::store::PlainFactory;
    use arcol_live::{Fields, Room};
    use serde_json::json;

    fn test_store(room: &Room) -> Rc<ObjectStore<String>> {
        let changes = Rc::new(ChangeManager::new(room.clone()));
        let store = ObjectStore::new(changes, "nodes", PlainFactory).unwrap();
        HierarchyIndex::install(&store);
        store
    }

    fn node(store: &ObjectStore<String>, id: &str, parent: Option<&str>) -> Rc<ArcolObject<String>> {
        store.make_changes(|_| {
            let mut record: Fields = [(fields::ID.to_string(), json!(id))].into();
            if let Some(parent) = parent {
                let after = store
                    .get_by_key(parent)
                    .and_then(|p| p.last_child())
                    .and_then(|c| c.parent_index());
                record.insert(fields::PARENT_ID.into(), json!(parent));
                record.insert(fields::PARENT_INDEX.into(), json!(key_between(after.as_deref(), None)));
            }
            let obj = store.object_from_fields(record).unwrap();
            store.add_object(Rc::clone(&obj));
            obj
        })
    }

    fn ids(objects: &[Rc<ArcolObject<String>>]) -> Vec<&str> {
        objects.iter().map(|o| o.id().as_str()).collect()
    }

    #[test]
    fn test_children_follow_creation_order() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        node(&store, "a", Some("root"));
        node(&store, "b", Some("root"));
        node(&store, "c", Some("root"));
        assert_eq!(ids(&root.children()), ["a", "b", "c"]);
        assert_eq!(store.get_by_key("c").unwrap().index_in_parent(), Some(2));
        assert_eq!(root.index_in_parent(), None);
    }

    #[test]
    fn test_move_to_front() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        node(&store, "a", Some("root"));
        let b = node(&store, "b", Some("root"));

        store.make_changes(|_| b.move_to_parent_at_index(&root, 0));
        assert_eq!(ids(&root.children()), ["b", "a"]);
    }

    #[test]
    fn test_move_within_parent_and_clamp() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        let a = node(&store, "a", Some("root"));
        node(&store, "b", Some("root"));
        node(&store, "c", Some("root"));

        store.make_changes(|_| a.move_to_parent_at_index(&root, 2));
        assert_eq!(ids(&root.children()), ["b", "c", "a"]);

        store.make_changes(|_| a.move_to_parent_at_index(&root, 1));
        assert_eq!(ids(&root.children()), ["b", "a", "c"]);

        store.make_changes(|_| a.move_to_parent_at_index(&root, 99));
        assert_eq!(ids(&root.children()), ["b", "c", "a"]);
    }

    #[test]
    fn test_move_to_current_position_is_noop() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        let a = node(&store, "a", Some("root"));
        node(&store, "b", Some("root"));
        let before = a.parent_index();
        room.take_outbox();

        store.make_changes(|_| a.move_to_parent_at_index(&root, 0));
        assert_eq!(a.parent_index(), before);
        assert!(room.take_outbox().is_empty());
    }

    #[test]
    fn test_reparent_updates_both_parents() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        let group = node(&store, "group", Some("root"));
        let a = node(&store, "a", Some("root"));
        node(&store, "b", Some("group"));

        store.make_changes(|_| a.set_parent(&group));
        assert_eq!(ids(&root.children()), ["group"]);
        assert_eq!(ids(&group.children()), ["b", "a"]);
        assert_eq!(a.parent().unwrap().id(), "group");
    }

    #[test]
    fn test_index_collision_breaks_tie_by_id() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        let b = node(&store, "b", Some("root"));
        let a = node(&store, "a", Some("root"));
        let shared = b.parent_index().unwrap();

        store.make_changes(|_| a.set(fields::PARENT_INDEX, shared.clone()));
        assert_eq!(ids(&root.children()), ["a", "b"]);
    }

    #[test]
    fn test_cycle_is_refused() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        let group = node(&store, "group", Some("root"));
        let inner = node(&store, "inner", Some("group"));

        store.make_changes(|_| {
            group.set_parent(&inner);
            group.set_parent(&group);
        });
        assert_eq!(group.parent_id().as_deref(), Some("root"));
        assert!(root.is_ancestor_of(&inner));
        assert!(!inner.is_ancestor_of(&root));
    }

    #[test]
    fn test_delete_cascades_children_first() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        let group = node(&store, "group", Some("root"));
        node(&store, "a", Some("group"));
        node(&store, "inner", Some("group"));
        node(&store, "deep", Some("inner"));

        let order: Rc<RefCell<Vec<String>>> = Rc::default();
        let sink = order.clone();
        store.subscribe_object_change(move |obj, change, _| {
            if *change == ObjectChange::Delete {
                sink.borrow_mut().push(obj.id().clone());
            }
        });

        store.make_changes(|_| group.delete());
        assert_eq!(*order.borrow(), ["a", "deep", "inner", "group"]);
        assert!(root.children().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remote_reparent_and_reorder() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        let group = node(&store, "group", Some("root"));
        node(&store, "a", Some("root"));
        node(&store, "b", Some("root"));

        room.apply_remote(|batch| {
            batch
                .set("nodes", "a", fields::PARENT_ID, json!("group"))
                .set("nodes", "b", fields::PARENT_INDEX, json!("0V"));
        });
        assert_eq!(ids(&root.children()), ["b", "group"]);
        assert_eq!(ids(&group.children()), ["a"]);
    }

    #[test]
    fn test_install_indexes_loaded_objects() {
        let room = Room::new();
        room.apply_remote(|batch| {
            batch
                .insert("nodes", "root", [(fields::ID.to_string(), json!("root"))].into())
                .insert(
                    "nodes",
                    "x",
                    [
                        (fields::ID.to_string(), json!("x")),
                        (fields::PARENT_ID.to_string(), json!("root")),
                        (fields::PARENT_INDEX.to_string(), json!("k")),
                    ]
                    .into(),
                )
                .insert(
                    "nodes",
                    "y",
                    [
                        (fields::ID.to_string(), json!("y")),
                        (fields::PARENT_ID.to_string(), json!("root")),
                        (fields::PARENT_INDEX.to_string(), json!("F")),
                    ]
                    .into(),
                );
        });
        let store = test_store(&room);
        let root = store.get_by_key("root").unwrap();
        assert_eq!(ids(&root.children()), ["y", "x"]);
    }

    #[test]
    fn test_child_before_parent_is_adopted() {
        let room = Room::new();
        let store = test_store(&room);
        let record = |id: &str, parent: Option<&str>| -> Fields {
            let mut fields: Fields = [(fields::ID.to_string(), json!(id))].into();
            if let Some(parent) = parent {
                fields.insert(fields::PARENT_ID.into(), json!(parent));
                fields.insert(fields::PARENT_INDEX.into(), json!("V"));
            }
            fields
        };

        room.apply_remote(|batch| {
            batch.insert("nodes", "child", record("child", Some("late")));
        });
        assert_eq!(store.get_by_key("child").unwrap().parent().map(|p| p.id().clone()), None);

        room.apply_remote(|batch| {
            batch.insert("nodes", "late", record("late", None));
        });
        let late = store.get_by_key("late").unwrap();
        assert_eq!(ids(&late.children()), ["child"]);
    }

    #[test]
    fn test_remote_parent_delete_leaves_children_waiting() {
        let room = Room::new();
        let store = test_store(&room);
        let root = node(&store, "root", None);
        node(&store, "a", Some("root"));
        let snapshot = root.fields();

        room.apply_remote(|batch| {
            batch.delete("nodes", "root");
        });
        assert_eq!(store.len(), 1);

        room.apply_remote(|batch| {
            batch.insert("nodes", "root", snapshot);
        });
        let root = store.get_by_key("root").unwrap();
        assert_eq!(ids(&root.children()), ["a"]);
    }
}
