//! Rooms: the replicated storage a document lives in.
//!
//! A [`Room`] owns named [`LiveMap`] collections. Local writes are recorded as
//! [`StorageOp`]s and grouped into outbound batches; [`Room::batch`] makes a
//! group atomic. Remote batches arrive through [`Room::receive`], are applied
//! straight to the records without being recorded, and are announced to
//! subscribers as [`StorageUpdate`]s.
//!
//! Local writes are never echoed back to local subscribers. Per-field conflict
//! resolution is last-arrival-wins, which is all a single process can observe.
//!
//! # Example
//!
//! ```
//! use arcol_live::{Room, StorageUpdate};
//! use serde_json::json;
//!
//! let room = Room::new();
//! room.subscribe("elements", |updates: &[StorageUpdate]| {
//!     assert_eq!(updates.len(), 1);
//! });
//! room.apply_remote(|batch| {
//!     batch.insert("elements", "a", [("id".to_string(), json!("a"))].into());
//! });
//! assert!(room.collection("elements").contains_key("a"));
//! ```

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::live::{Fields, LiveMap, LiveObject, StorageOp};

/// Full contents of a room: collection name → key → record fields.
pub type RoomSnapshot = BTreeMap<String, BTreeMap<String, Fields>>;

/// Collection-level change kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionChange {
    /// A record was put under the key.
    Set,
    /// The record under the key was removed.
    Delete,
}

/// One delta in a remote batch, as seen by a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageUpdate {
    /// A whole record appeared or disappeared.
    Collection {
        collection: String,
        key: String,
        change: CollectionChange,
    },
    /// Fields of an existing record changed. Each field is listed once.
    Record {
        collection: String,
        key: String,
        fields: Vec<String>,
    },
}

impl StorageUpdate {
    pub fn collection(&self) -> &str {
        match self {
            StorageUpdate::Collection { collection, .. } | StorageUpdate::Record { collection, .. } => {
                collection
            }
        }
    }
}

/// Handle returned by [`Room::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Rc<dyn Fn(&[StorageUpdate])>;

struct Subscriber {
    id: SubscriptionId,
    collection: String,
    callback: Callback,
}

pub(crate) struct RoomShared {
    collections: RefCell<BTreeMap<String, LiveMap>>,
    batch_depth: Cell<u32>,
    pending: RefCell<Vec<StorageOp>>,
    outbox: RefCell<Vec<Vec<StorageOp>>>,
    history: RefCell<Vec<Vec<StorageOp>>>,
    subscribers: RefCell<Vec<Subscriber>>,
    next_subscription: Cell<u64>,
}

impl RoomShared {
    /// Record a local op, either into the open batch or as its own batch.
    pub(crate) fn record(&self, op: StorageOp) {
        trace!(collection = op.collection(), key = op.key(), "recording storage op");
        if self.batch_depth.get() > 0 {
            self.pending.borrow_mut().push(op);
        } else {
            self.push_batch(vec![op]);
        }
    }

    fn push_batch(&self, ops: Vec<StorageOp>) {
        if ops.is_empty() {
            return;
        }
        self.history.borrow_mut().push(ops.clone());
        self.outbox.borrow_mut().push(ops);
    }
}

/// Shared handle to one room. Cloning shares the room.
#[derive(Clone)]
pub struct Room {
    shared: Rc<RoomShared>,
}

impl Room {
    /// An empty room.
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RoomShared {
                collections: RefCell::new(BTreeMap::new()),
                batch_depth: Cell::new(0),
                pending: RefCell::new(Vec::new()),
                outbox: RefCell::new(Vec::new()),
                history: RefCell::new(Vec::new()),
                subscribers: RefCell::new(Vec::new()),
                next_subscription: Cell::new(0),
            }),
        }
    }

    /// A room whose initial storage is `snapshot`. Nothing is recorded.
    pub fn from_snapshot(snapshot: &RoomSnapshot) -> Self {
        let room = Self::new();
        for (name, records) in snapshot {
            let map = room.collection(name);
            for (key, fields) in records {
                map.insert_silently(key, LiveObject::from_fields(fields.clone()));
            }
        }
        room
    }

    /// Copy of every collection's records.
    pub fn snapshot(&self) -> RoomSnapshot {
        self.shared
            .collections
            .borrow()
            .iter()
            .map(|(name, map)| {
                let records = map
                    .entries()
                    .into_iter()
                    .map(|(key, node)| (key, node.to_fields()))
                    .collect();
                (name.clone(), records)
            })
            .collect()
    }

    /// The collection named `name`, created empty on first use.
    pub fn collection(&self, name: &str) -> LiveMap {
        let mut collections = self.shared.collections.borrow_mut();
        collections
            .entry(name.to_string())
            .or_insert_with(|| LiveMap::new(name, Rc::downgrade(&self.shared)))
            .clone()
    }

    /// Run `f` with every local write grouped into one outbound batch.
    ///
    /// Reentrant: only the outermost call closes the batch.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = BatchGuard::open(&self.shared);
        f()
    }

    /// Whether a batch is currently open.
    pub fn in_batch(&self) -> bool {
        self.shared.batch_depth.get() > 0
    }

    /// Forget the merge history accumulated so far.
    pub fn clear_history(&self) {
        self.shared.history.borrow_mut().clear();
    }

    pub fn history_len(&self) -> usize {
        self.shared.history.borrow().len()
    }

    /// Drain the outbound batches, oldest first.
    pub fn take_outbox(&self) -> Vec<Vec<StorageOp>> {
        std::mem::take(&mut *self.shared.outbox.borrow_mut())
    }

    /// Call `callback` with every remote batch touching `collection`.
    pub fn subscribe(
        &self,
        collection: &str,
        callback: impl Fn(&[StorageUpdate]) + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.get());
        self.shared.next_subscription.set(id.0 + 1);
        self.shared.subscribers.borrow_mut().push(Subscriber {
            id,
            collection: collection.to_string(),
            callback: Rc::new(callback),
        });
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.shared.subscribers.borrow_mut();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Apply a batch of ops that originated at another replica.
    ///
    /// Sets for records that do not exist are dropped, as a merge would.
    /// Subscribers are called after the whole batch is applied.
    pub fn receive(&self, ops: &[StorageOp]) {
        let mut updates = UpdateCollector::default();

        for op in ops {
            match op {
                StorageOp::Insert { collection, key, fields } => {
                    self.collection(collection)
                        .insert_silently(key, LiveObject::from_fields(fields.clone()));
                    updates.collection_change(collection, key, CollectionChange::Set);
                }
                StorageOp::Delete { collection, key } => {
                    if self.collection(collection).remove_silently(key).is_some() {
                        updates.collection_change(collection, key, CollectionChange::Delete);
                    } else {
                        debug!(collection, key, "remote delete for missing record");
                    }
                }
                StorageOp::Set { collection, key, field, value } => {
                    match self.collection(collection).get(key) {
                        Some(node) => {
                            node.set_silently(field, value.clone());
                            updates.field_change(collection, key, field);
                        }
                        None => debug!(collection, key, field, "remote set for missing record"),
                    }
                }
            }
        }

        self.dispatch(&updates.finish());
    }

    /// Build a remote batch with `f` and [`receive`](Self::receive) it.
    pub fn apply_remote(&self, f: impl FnOnce(&mut RemoteBatch)) {
        let mut batch = RemoteBatch::default();
        f(&mut batch);
        self.receive(&batch.ops);
    }

    fn dispatch(&self, updates: &[StorageUpdate]) {
        if updates.is_empty() {
            return;
        }
        let subscribers: Vec<(String, Callback)> = self
            .shared
            .subscribers
            .borrow()
            .iter()
            .map(|s| (s.collection.clone(), Rc::clone(&s.callback)))
            .collect();

        for (collection, callback) in subscribers {
            let relevant: Vec<StorageUpdate> = updates
                .iter()
                .filter(|u| u.collection() == collection)
                .cloned()
                .collect();
            if !relevant.is_empty() {
                callback(&relevant);
            }
        }
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("collections", &self.shared.collections.borrow().keys().collect::<Vec<_>>())
            .field("batch_depth", &self.shared.batch_depth.get())
            .field("outbox", &self.shared.outbox.borrow().len())
            .finish()
    }
}

/// Closes the batch on drop, so a panicking closure still unwinds cleanly.
struct BatchGuard<'a> {
    shared: &'a RoomShared,
}

impl<'a> BatchGuard<'a> {
    fn open(shared: &'a RoomShared) -> Self {
        shared.batch_depth.set(shared.batch_depth.get() + 1);
        Self { shared }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let depth = self.shared.batch_depth.get() - 1;
        self.shared.batch_depth.set(depth);
        if depth == 0 {
            let ops = std::mem::take(&mut *self.shared.pending.borrow_mut());
            self.shared.push_batch(ops);
        }
    }
}

/// Ops making up one simulated remote batch.
#[derive(Debug, Default)]
pub struct RemoteBatch {
    ops: Vec<StorageOp>,
}

impl RemoteBatch {
    pub fn insert(&mut self, collection: &str, key: &str, fields: Fields) -> &mut Self {
        self.ops.push(StorageOp::Insert {
            collection: collection.to_string(),
            key: key.to_string(),
            fields,
        });
        self
    }

    pub fn delete(&mut self, collection: &str, key: &str) -> &mut Self {
        self.ops.push(StorageOp::Delete {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        self
    }

    pub fn set(&mut self, collection: &str, key: &str, field: &str, value: Value) -> &mut Self {
        self.ops.push(StorageOp::Set {
            collection: collection.to_string(),
            key: key.to_string(),
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn into_ops(self) -> Vec<StorageOp> {
        self.ops
    }
}

/// Groups field changes per record, preserving first-seen order.
#[derive(Default)]
struct UpdateCollector {
    collection_changes: Vec<StorageUpdate>,
    record_changes: IndexMap<(String, String), Vec<String>>,
}

impl UpdateCollector {
    fn collection_change(&mut self, collection: &str, key: &str, change: CollectionChange) {
        self.collection_changes.push(StorageUpdate::Collection {
            collection: collection.to_string(),
            key: key.to_string(),
            change,
        });
    }

    fn field_change(&mut self, collection: &str, key: &str, field: &str) {
        let fields = self
            .record_changes
            .entry((collection.to_string(), key.to_string()))
            .or_default();
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
    }

    fn finish(self) -> Vec<StorageUpdate> {
        let mut updates = self.collection_changes;
        updates.extend(
            self.record_changes
                .into_iter()
                .map(|((collection, key), fields)| StorageUpdate::Record { collection, key, fields }),
        );
        updates
    }
}
