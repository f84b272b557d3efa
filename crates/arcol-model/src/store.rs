//! Object stores: identity-indexed mirrors of one replicated collection.
//!
//! An [`ObjectStore`] owns the `id → object` map for one collection and keeps
//! it in lockstep with the collection: objects are added to and removed from
//! both together. Local mutations and reconciled remote batches are published
//! through the same listener chain as `(object, change, origin)`.
//!
//! # Listener order
//!
//! Listeners run in registration order. Derived indices (hierarchy, relation
//! reverse maps) are registered before anything else so that later listeners
//! can read them while handling the same event.
//!
//! # Reconciliation
//!
//! A remote batch is handled in two passes: collection-level creates and
//! deletes first, then field updates. Per-delta anomalies are logged and
//! skipped; the rest of the batch still applies.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use arcol_live::{CollectionChange, Fields, LiveMap, LiveObject, StorageUpdate, SubscriptionId};
use arcol_types::{fields, ObjectKey};
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::change::{ChangeManager, ChangeOrigin, Transaction};
use crate::object::{ArcolObject, Attachment};
use crate::{Result, StoreError};

/// Name of a store, equal to its collection name. Buckets undo history.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreName(String);

impl StoreName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happened to an object.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectChange {
    Create,
    Delete,
    /// One field changed; `old_value` is `Null` if it was absent.
    Update { property: String, old_value: Value },
}

impl ObjectChange {
    /// The updated field, for updates.
    pub fn property(&self) -> Option<&str> {
        match self {
            ObjectChange::Update { property, .. } => Some(property),
            _ => None,
        }
    }

    pub fn is_update_of(&self, field: &str) -> bool {
        self.property() == Some(field)
    }
}

/// Callback invoked for every change in a store.
pub type ObjectListener<I> = dyn Fn(&Rc<ArcolObject<I>>, &ObjectChange, ChangeOrigin);

/// Handle returned by [`ObjectStore::subscribe_object_change`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Validates records and supplies per-type local fields.
pub trait ObjectFactory<I: ObjectKey>: 'static {
    /// Local fields (with defaults) an object built from `record` carries.
    ///
    /// Errors here reject the record. [`StoreError::is_fatal`] errors abort
    /// the initial load.
    fn local_fields(&self, record: &Fields) -> Result<Vec<(&'static str, Value)>>;
}

/// Factory for stores with no local fields and no type dispatch.
pub struct PlainFactory;

impl<I: ObjectKey> ObjectFactory<I> for PlainFactory {
    fn local_fields(&self, _record: &Fields) -> Result<Vec<(&'static str, Value)>> {
        Ok(Vec::new())
    }
}

/// An identity-indexed collection of objects mirroring one replicated collection.
pub struct ObjectStore<I: ObjectKey> {
    name: StoreName,
    changes: Rc<ChangeManager>,
    collection: LiveMap,
    factory: Box<dyn ObjectFactory<I>>,
    objects: RefCell<HashMap<I, Rc<ArcolObject<I>>>>,
    listeners: RefCell<Vec<(ListenerId, Rc<ObjectListener<I>>)>>,
    next_listener: Cell<u64>,
    subscription: Cell<Option<SubscriptionId>>,
    this: Weak<Self>,
}

impl<I: ObjectKey> ObjectStore<I> {
    /// Load every record of `collection` and subscribe to remote batches.
    ///
    /// Records whose id does not match their key are logged and dropped.
    /// Fatal factory errors abort the load.
    pub fn new(
        changes: Rc<ChangeManager>,
        collection: &str,
        factory: impl ObjectFactory<I>,
    ) -> Result<Rc<Self>> {
        let map = changes.room().collection(collection);
        let store = Rc::new_cyclic(|this| Self {
            name: StoreName::new(collection),
            changes,
            collection: map,
            factory: Box::new(factory),
            objects: RefCell::new(HashMap::new()),
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(0),
            subscription: Cell::new(None),
            this: this.clone(),
        });

        store.load()?;

        let weak = Rc::downgrade(&store);
        let id = store.changes.room().subscribe(collection, move |updates| {
            if let Some(store) = weak.upgrade() {
                store.reconcile(updates);
            }
        });
        store.subscription.set(Some(id));

        debug!(store = %store.name, objects = store.len(), "store loaded");
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        for (key, node) in self.collection.entries() {
            match self.instantiate(&key, node) {
                Ok(obj) => {
                    obj.set_attachment(Attachment::Attached);
                    self.objects.borrow_mut().insert(obj.id().clone(), obj);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(store = %self.name, key, "dropping record on load: {e}"),
            }
        }
        Ok(())
    }

    /// Build an object for the record under `key` without adding it anywhere.
    fn instantiate(&self, key: &str, node: LiveObject) -> Result<Rc<ArcolObject<I>>> {
        let record = node.to_fields();
        let id = record
            .get(fields::ID)
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::MissingId { key: key.to_string() })?;
        if id != key {
            return Err(StoreError::KeyMismatch {
                key: key.to_string(),
                id: id.to_string(),
            });
        }
        let id: I = key
            .parse()
            .map_err(|_| StoreError::InvalidKey(key.to_string()))?;
        // Writes key the collection by `Display`, so only the canonical form
        // can be deleted or recreated later.
        let canonical = id.to_string();
        if canonical != key {
            return Err(StoreError::KeyMismatch {
                key: key.to_string(),
                id: canonical,
            });
        }
        let local = self.factory.local_fields(&record)?;
        Ok(ArcolObject::new(id, node, local, self.this.clone()))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &StoreName {
        &self.name
    }

    pub fn changes(&self) -> &Rc<ChangeManager> {
        &self.changes
    }

    pub fn collection(&self) -> &LiveMap {
        &self.collection
    }

    pub fn get_by_id(&self, id: &I) -> Option<Rc<ArcolObject<I>>> {
        self.objects.borrow().get(id).cloned()
    }

    /// Look up by storage key. Only the canonical key form matches.
    pub fn get_by_key(&self, key: &str) -> Option<Rc<ArcolObject<I>>> {
        let id: I = key.parse().ok()?;
        if id.to_string() != key {
            return None;
        }
        self.get_by_id(&id)
    }

    pub fn contains(&self, id: &I) -> bool {
        self.objects.borrow().contains_key(id)
    }

    /// Snapshot of every object, ordered by id.
    pub fn get_objects(&self) -> Vec<Rc<ArcolObject<I>>> {
        let mut objects: Vec<_> = self.objects.borrow().values().cloned().collect();
        objects.sort_by(|a, b| a.id().cmp(b.id()));
        objects
    }

    pub fn len(&self) -> usize {
        self.objects.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.borrow().is_empty()
    }

    /// Plain-value dump of every object, ordered by id.
    pub fn debug_objects(&self) -> Vec<Value> {
        self.get_objects().iter().map(|o| o.debug_value()).collect()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn making_changes(&self) -> bool {
        self.changes.making_changes()
    }

    pub fn make_changes<T>(&self, f: impl FnOnce(&Transaction<'_>) -> T) -> T {
        self.changes.make_changes(f)
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Register a listener. Listeners run in registration order.
    pub fn subscribe_object_change(
        &self,
        listener: impl Fn(&Rc<ArcolObject<I>>, &ObjectChange, ChangeOrigin) + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        let listener: Rc<ObjectListener<I>> = Rc::new(listener);
        self.listeners.borrow_mut().push((id, listener));
        id
    }

    /// Returns whether the listener was registered.
    pub fn unsubscribe_object_change(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Call every listener. A panicking listener is logged and skipped.
    fn notify(&self, obj: &Rc<ArcolObject<I>>, change: &ObjectChange, origin: ChangeOrigin) {
        trace!(store = %self.name, id = %obj.id(), ?change, %origin, "object change");
        let listeners: Vec<Rc<ObjectListener<I>>> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(obj, change, origin)));
            if outcome.is_err() {
                error!(store = %self.name, id = %obj.id(), ?change, "object listener panicked");
            }
        }
    }

    pub(crate) fn on_field_set(
        &self,
        obj: &Rc<ArcolObject<I>>,
        field: &str,
        old_value: Value,
        new_value: Value,
    ) {
        trace!(store = %self.name, id = %obj.id(), field, %new_value, "field set");
        let change = ObjectChange::Update {
            property: field.to_string(),
            old_value,
        };
        self.notify(obj, &change, self.changes.origin());
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub fn add_object(&self, obj: Rc<ArcolObject<I>>) {
        self.add_objects(vec![obj]);
    }

    /// Insert objects into the map and the collection, then emit one create
    /// per object in the given order.
    pub fn add_objects(&self, objects: Vec<Rc<ArcolObject<I>>>) {
        if !self.making_changes() {
            warn!(store = %self.name, count = objects.len(), "add_objects outside make_changes ignored");
            return;
        }

        let mut added = Vec::with_capacity(objects.len());
        for obj in objects {
            if !obj.belongs_to(self) {
                error!(store = %self.name, id = %obj.id(), "object belongs to another store");
                continue;
            }
            if obj.attachment() != Attachment::Pending || self.contains(obj.id()) {
                error!(store = %self.name, id = %obj.id(), "object already added");
                continue;
            }
            self.objects
                .borrow_mut()
                .insert(obj.id().clone(), Rc::clone(&obj));
            self.collection.set(&obj.id().to_string(), obj.node().clone());
            obj.set_attachment(Attachment::Attached);
            added.push(obj);
        }

        let origin = self.changes.origin();
        for obj in &added {
            self.notify(obj, &ObjectChange::Create, origin);
        }
    }

    /// Remove an object and, depth-first, everything parented under it.
    ///
    /// Each removal emits its own delete, children before parents. Removing
    /// an object that is not in the store does nothing.
    pub fn remove_object(&self, obj: &Rc<ArcolObject<I>>) {
        if !self.making_changes() {
            warn!(store = %self.name, id = %obj.id(), "remove_object outside make_changes ignored");
            return;
        }
        if !self.contains(obj.id()) {
            return;
        }

        for child in obj.children() {
            self.remove_object(&child);
        }

        // A listener may already have removed it while its children went.
        if self.objects.borrow_mut().remove(obj.id()).is_none() {
            return;
        }
        self.collection.delete(&obj.id().to_string());
        self.notify(obj, &ObjectChange::Delete, self.changes.origin());
        obj.set_attachment(Attachment::Detached);
    }

    /// Build a fresh object from a field set, ready for [`add_objects`].
    ///
    /// The node gets `id` and `type` directly; every other field goes through
    /// `set` so local fields stay local. No events fire until the object is
    /// added.
    ///
    /// [`add_objects`]: Self::add_objects
    pub fn object_from_fields(&self, mut record: Fields) -> Result<Rc<ArcolObject<I>>> {
        if !self.making_changes() {
            return Err(StoreError::OutsideTransaction);
        }
        let Some(Value::String(key)) = record.remove(fields::ID) else {
            return Err(StoreError::MissingId { key: String::new() });
        };

        let node = LiveObject::new();
        node.set(fields::ID, Value::String(key.clone()));
        if let Some(tag) = record.remove(fields::TYPE) {
            node.set(fields::TYPE, tag);
        }

        let obj = self.instantiate(&key, node)?;
        for (field, value) in record {
            obj.set(&field, value);
        }
        Ok(obj)
    }

    // =========================================================================
    // Remote reconciliation
    // =========================================================================

    /// Apply one remote batch of updates for this collection.
    pub(crate) fn reconcile(&self, updates: &[StorageUpdate]) {
        self.changes.reconcile(|| {
            let mut created = Vec::new();

            for update in updates {
                if let StorageUpdate::Collection { key, change, .. } = update {
                    match change {
                        CollectionChange::Set => {
                            if let Some(obj) = self.reconcile_create(key) {
                                created.push(obj);
                            }
                        }
                        CollectionChange::Delete => self.reconcile_delete(key),
                    }
                }
            }

            for obj in &created {
                self.notify(obj, &ObjectChange::Create, ChangeOrigin::Remote);
            }

            let mut seen: HashSet<(&str, &str)> = HashSet::new();
            for update in updates {
                if let StorageUpdate::Record { key, fields, .. } = update {
                    for field in fields {
                        if !seen.insert((key.as_str(), field.as_str())) {
                            error!(store = %self.name, key, field, "field already updated in this batch, skipping");
                            continue;
                        }
                        self.reconcile_field(key, field);
                    }
                }
            }
        });
    }

    fn reconcile_create(&self, key: &str) -> Option<Rc<ArcolObject<I>>> {
        if self.get_by_key(key).is_some() {
            error!(store = %self.name, key, "remote set on existing key, skipping");
            return None;
        }
        let Some(node) = self.collection.get(key) else {
            warn!(store = %self.name, key, "remote create for record no longer present");
            return None;
        };
        match self.instantiate(key, node) {
            Ok(obj) => {
                obj.set_attachment(Attachment::Attached);
                self.objects
                    .borrow_mut()
                    .insert(obj.id().clone(), Rc::clone(&obj));
                Some(obj)
            }
            Err(e) => {
                error!(store = %self.name, key, "dropping remote record: {e}");
                None
            }
        }
    }

    fn reconcile_delete(&self, key: &str) {
        let Some(obj) = self.get_by_key(key) else {
            warn!(store = %self.name, key, "remote delete for unknown object");
            return;
        };
        self.objects.borrow_mut().remove(obj.id());
        self.notify(&obj, &ObjectChange::Delete, ChangeOrigin::Remote);
        obj.set_attachment(Attachment::Detached);
    }

    fn reconcile_field(&self, key: &str, field: &str) {
        let Some(obj) = self.get_by_key(key) else {
            error!(store = %self.name, key, field, "remote update for nonexistent object");
            return;
        };
        if obj.is_local_field(field) || field == fields::ID || field == fields::TYPE {
            warn!(store = %self.name, key, field, "remote update to a fixed or local field ignored");
            return;
        }
        let value = obj.node().get(field).unwrap_or(Value::Null);
        if let Some(old_value) = obj.apply_remote_field(field, value) {
            let change = ObjectChange::Update {
                property: field.to_string(),
                old_value,
            };
            self.notify(&obj, &change, ChangeOrigin::Remote);
        }
    }
}

impl<I: ObjectKey> Drop for ObjectStore<I> {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.changes.room().unsubscribe(id);
        }
    }
}

impl<I: ObjectKey> fmt::Debug for ObjectStore<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.name)
            .field("objects", &self.len())
            .finish()
    }
}
