//! Many-to-many relations between objects of (possibly) different stores.
//!
//! Each relation is a bare object in its own store, keyed `"{a}<>{b}"`. Two
//! reverse indices map each endpoint to the keys of the relations that
//! reference it. The index listener is the first listener on the relation
//! store, so anything registered later can query it synchronously.
//!
//! When an endpoint object is deleted, locally or remotely, every relation
//! referencing it is removed in the same pass. This is best effort: a client
//! that disconnects before its cleanup is sent can leave an orphan behind.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use arcol_live::Fields;
use arcol_types::{fields, ElementId, ObjectKey, RelationKey};
use serde_json::Value;
use tracing::{debug, warn};

use crate::change::{ChangeManager, ChangeOrigin, Transaction};
use crate::element::Element;
use crate::object::ArcolObject;
use crate::store::{ListenerId, ObjectChange, ObjectStore, PlainFactory};
use crate::Result;

/// Default collection holding element-to-element relations.
pub const ELEMENT_RELATIONS_COLLECTION: &str = "elementRelations";

pub type RelationObject<A, B> = ArcolObject<RelationKey<A, B>>;

/// Typed view of one relation.
pub struct Relation<A: ObjectKey, B: ObjectKey> {
    object: Rc<RelationObject<A, B>>,
}

impl<A: ObjectKey, B: ObjectKey> Relation<A, B> {
    pub fn key(&self) -> &RelationKey<A, B> {
        self.object.id()
    }

    pub fn key_a(&self) -> &A {
        &self.object.id().a
    }

    pub fn key_b(&self) -> &B {
        &self.object.id().b
    }

    pub fn object(&self) -> &Rc<RelationObject<A, B>> {
        &self.object
    }
}

impl<A: ObjectKey, B: ObjectKey> Clone for Relation<A, B> {
    fn clone(&self) -> Self {
        Self { object: Rc::clone(&self.object) }
    }
}

impl<A: ObjectKey, B: ObjectKey> fmt::Debug for Relation<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.key())
    }
}

type ReverseIndex<K, A, B> = RefCell<HashMap<K, BTreeSet<RelationKey<A, B>>>>;

/// Relation store plus its reverse indices.
pub struct RelationsStore<A: ObjectKey, B: ObjectKey> {
    store: Rc<ObjectStore<RelationKey<A, B>>>,
    from_a: ReverseIndex<A, A, B>,
    from_b: ReverseIndex<B, A, B>,
}

impl<A: ObjectKey, B: ObjectKey> RelationsStore<A, B> {
    /// Load the relations collection and install the reverse-index listener.
    pub fn new(changes: Rc<ChangeManager>, collection: &str) -> Result<Rc<Self>> {
        let store = ObjectStore::new(changes, collection, PlainFactory)?;
        let relations = Rc::new(Self {
            store,
            from_a: RefCell::new(HashMap::new()),
            from_b: RefCell::new(HashMap::new()),
        });

        for obj in relations.store.get_objects() {
            relations.index(obj.id());
        }

        let weak = Rc::downgrade(&relations);
        relations.store.subscribe_object_change(move |obj, change, _origin| {
            let Some(relations) = weak.upgrade() else {
                return;
            };
            match change {
                ObjectChange::Create => relations.index(obj.id()),
                ObjectChange::Delete => relations.unindex(obj.id()),
                ObjectChange::Update { property, .. } => {
                    warn!(key = %obj.id(), property, "relations carry no mutable fields");
                }
            }
        });

        Ok(relations)
    }

    pub fn store(&self) -> &Rc<ObjectStore<RelationKey<A, B>>> {
        &self.store
    }

    fn index(&self, key: &RelationKey<A, B>) {
        insert_key(&self.from_a, &key.a, key);
        insert_key(&self.from_b, &key.b, key);
    }

    fn unindex(&self, key: &RelationKey<A, B>) {
        remove_key(&self.from_a, &key.a, key);
        remove_key(&self.from_b, &key.b, key);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_relation(&self, a: &A, b: &B) -> Option<Relation<A, B>> {
        let key = RelationKey::new(a.clone(), b.clone());
        self.store.get_by_id(&key).map(|object| Relation { object })
    }

    pub fn has_relation(&self, a: &A, b: &B) -> bool {
        self.store.contains(&RelationKey::new(a.clone(), b.clone()))
    }

    /// Keys of every relation whose first endpoint is `a`. Empty if none.
    pub fn get_relations_from_a(&self, a: &A) -> BTreeSet<RelationKey<A, B>> {
        self.from_a.borrow().get(a).cloned().unwrap_or_default()
    }

    /// Keys of every relation whose second endpoint is `b`. Empty if none.
    pub fn get_relations_from_b(&self, b: &B) -> BTreeSet<RelationKey<A, B>> {
        self.from_b.borrow().get(b).cloned().unwrap_or_default()
    }

    pub fn relations(&self) -> Vec<Relation<A, B>> {
        self.store
            .get_objects()
            .into_iter()
            .map(|object| Relation { object })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Relate `a` to `b`. Returns the existing relation if there is one.
    pub fn add_relation(&self, _tx: &Transaction<'_>, a: &A, b: &B) -> Result<Relation<A, B>> {
        if let Some(existing) = self.get_relation(a, b) {
            return Ok(existing);
        }
        let key = RelationKey::new(a.clone(), b.clone());
        let record: Fields = [(fields::ID.to_string(), Value::String(key.to_string()))].into();
        let object = self.store.object_from_fields(record)?;
        self.store.add_object(Rc::clone(&object));
        Ok(Relation { object })
    }

    /// Remove the relation between `a` and `b`, if any.
    pub fn remove_relation(&self, _tx: &Transaction<'_>, a: &A, b: &B) {
        if let Some(relation) = self.get_relation(a, b) {
            self.store.remove_object(relation.object());
        }
    }

    // =========================================================================
    // Endpoint cleanup
    // =========================================================================

    /// Remove this store's relations when an `A` is deleted from `owner`.
    pub fn attach_endpoint_a(self: &Rc<Self>, owner: &ObjectStore<A>) -> ListenerId {
        let weak = Rc::downgrade(self);
        owner.subscribe_object_change(move |obj, change, origin| {
            if *change == ObjectChange::Delete
                && let Some(relations) = weak.upgrade()
            {
                let keys = relations.get_relations_from_a(obj.id());
                relations.remove_all(keys, origin);
            }
        })
    }

    /// Remove this store's relations when a `B` is deleted from `owner`.
    pub fn attach_endpoint_b(self: &Rc<Self>, owner: &ObjectStore<B>) -> ListenerId {
        let weak = Rc::downgrade(self);
        owner.subscribe_object_change(move |obj, change, origin| {
            if *change == ObjectChange::Delete
                && let Some(relations) = weak.upgrade()
            {
                let keys = relations.get_relations_from_b(obj.id());
                relations.remove_all(keys, origin);
            }
        })
    }

    fn remove_all(&self, keys: BTreeSet<RelationKey<A, B>>, origin: ChangeOrigin) {
        for key in keys {
            if let Some(object) = self.store.get_by_id(&key) {
                debug!(key = %key, %origin, "removing relation to deleted endpoint");
                self.store.remove_object(&object);
            }
        }
    }
}

/// Relations between elements of the same document.
pub type ElementRelations = RelationsStore<ElementId, ElementId>;

impl RelationsStore<ElementId, ElementId> {
    pub fn add_element_relation(
        &self,
        tx: &Transaction<'_>,
        a: &Element,
        b: &Element,
    ) -> Result<Relation<ElementId, ElementId>> {
        self.add_relation(tx, &a.id(), &b.id())
    }

    pub fn remove_element_relation(&self, tx: &Transaction<'_>, a: ElementId, b: ElementId) {
        self.remove_relation(tx, &a, &b);
    }
}

fn insert_key<K: Eq + Hash + Clone, R: Ord + Clone>(index: &RefCell<HashMap<K, BTreeSet<R>>>, endpoint: &K, key: &R) {
    index
        .borrow_mut()
        .entry(endpoint.clone())
        .or_default()
        .insert(key.clone());
}

fn remove_key<K: Eq + Hash, R: Ord>(index: &RefCell<HashMap<K, BTreeSet<R>>>, endpoint: &K, key: &R) {
    let mut index = index.borrow_mut();
    if let Some(set) = index.get_mut(endpoint) {
        set.remove(key);
        if set.is_empty() {
            index.remove(endpoint);
        }
    }
}

impl<A: ObjectKey, B: ObjectKey> fmt::Debug for RelationsStore<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationsStore")
            .field("name", self.store.name())
            .field("relations", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcol_live::Room;
    use serde_json::json;

    struct Fixture {
        room: Room,
        things: Rc<ObjectStore<String>>,
        relations: Rc<RelationsStore<String, String>>,
    }

    fn fixture() -> Fixture {
        let room = Room::new();
        let changes = Rc::new(ChangeManager::new(room.clone()));
        let things = ObjectStore::new(changes.clone(), "things", PlainFactory).unwrap();
        let relations = RelationsStore::new(changes, "relations").unwrap();
        relations.attach_endpoint_a(&things);
        relations.attach_endpoint_b(&things);
        Fixture { room, things, relations }
    }

    fn thing(store: &ObjectStore<String>, id: &str) -> Rc<ArcolObject<String>> {
        store.make_changes(|_| {
            let obj = store
                .object_from_fields([(fields::ID.to_string(), json!(id))].into())
                .unwrap();
            store.add_object(Rc::clone(&obj));
            obj
        })
    }

    fn key(a: &str, b: &str) -> RelationKey<String, String> {
        RelationKey::new(a.to_string(), b.to_string())
    }

    #[test]
    fn test_add_and_query() {
        let f = fixture();
        thing(&f.things, "a");
        thing(&f.things, "b");

        let relation = f
            .relations
            .store()
            .make_changes(|tx| f.relations.add_relation(tx, &"a".into(), &"b".into()))
            .unwrap();
        assert_eq!(relation.key().to_string(), "a<>b");
        assert!(f.relations.has_relation(&"a".into(), &"b".into()));
        assert_eq!(f.relations.get_relations_from_a(&"a".into()), BTreeSet::from([key("a", "b")]));
        assert_eq!(f.relations.get_relations_from_b(&"b".into()), BTreeSet::from([key("a", "b")]));
        assert!(f.relations.get_relations_from_a(&"b".into()).is_empty());
        assert!(f.room.collection("relations").contains_key("a<>b"));
    }

    #[test]
    fn test_add_twice_returns_existing() {
        let f = fixture();
        f.things.make_changes(|tx| {
            f.relations.add_relation(tx, &"a".into(), &"b".into()).unwrap();
            f.relations.add_relation(tx, &"a".into(), &"b".into()).unwrap();
        });
        assert_eq!(f.relations.len(), 1);
    }

    #[test]
    fn test_remove_relation() {
        let f = fixture();
        f.things.make_changes(|tx| {
            f.relations.add_relation(tx, &"a".into(), &"b".into()).unwrap();
        });
        f.things.make_changes(|tx| {
            f.relations.remove_relation(tx, &"a".into(), &"b".into());
            f.relations.remove_relation(tx, &"a".into(), &"c".into());
        });
        assert!(f.relations.is_empty());
        assert!(f.relations.get_relations_from_a(&"a".into()).is_empty());
    }

    #[test]
    fn test_local_endpoint_delete_removes_relations() {
        let f = fixture();
        let a = thing(&f.things, "a");
        thing(&f.things, "b");
        thing(&f.things, "c");
        f.things.make_changes(|tx| {
            f.relations.add_relation(tx, &"a".into(), &"b".into()).unwrap();
            f.relations.add_relation(tx, &"c".into(), &"a".into()).unwrap();
            f.relations.add_relation(tx, &"b".into(), &"c".into()).unwrap();
        });

        f.things.make_changes(|_| a.delete());
        let remaining: Vec<String> = f.relations.relations().iter().map(|r| r.key().to_string()).collect();
        assert_eq!(remaining, ["b<>c"]);
        assert!(f.relations.get_relations_from_b(&"a".into()).is_empty());
    }

    #[test]
    fn test_remote_endpoint_delete_removes_relations() {
        let f = fixture();
        thing(&f.things, "a");
        thing(&f.things, "b");
        f.things.make_changes(|tx| {
            f.relations.add_relation(tx, &"a".into(), &"b".into()).unwrap();
        });
        f.room.take_outbox();

        let origins: Rc<RefCell<Vec<ChangeOrigin>>> = Rc::default();
        let sink = origins.clone();
        f.relations.store().subscribe_object_change(move |_, _, origin| sink.borrow_mut().push(origin));

        f.room.apply_remote(|batch| {
            batch.delete("things", "a");
        });

        assert!(f.relations.is_empty());
        assert!(f.relations.get_relations_from_a(&"a".into()).is_empty());
        assert_eq!(*origins.borrow(), [ChangeOrigin::Remote]);
        // The cleanup is written to storage so peers converge.
        let outbox = f.room.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0][0].key(), "a<>b");
    }

    #[test]
    fn test_remote_relation_create_is_indexed() {
        let f = fixture();
        f.room.apply_remote(|batch| {
            batch.insert("relations", "x<>y", [(fields::ID.to_string(), json!("x<>y"))].into());
        });
        assert_eq!(f.relations.get_relations_from_b(&"y".into()), BTreeSet::from([key("x", "y")]));
    }

    #[test]
    fn test_load_indexes_existing_relations() {
        let room = Room::new();
        room.apply_remote(|batch| {
            batch.insert("relations", "p<>q", [(fields::ID.to_string(), json!("p<>q"))].into());
        });
        let changes = Rc::new(ChangeManager::new(room));
        let relations = RelationsStore::<String, String>::new(changes, "relations").unwrap();
        assert_eq!(relations.get_relations_from_a(&"p".into()), BTreeSet::from([key("p", "q")]));
    }
}
