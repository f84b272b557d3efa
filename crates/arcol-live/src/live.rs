//! Replicated records and collections.
//!
//! A [`LiveObject`] is one record of named fields. A [`LiveMap`] is a
//! key-ordered collection of records belonging to a [`Room`](crate::Room).
//! Writes to an attached record, and inserts/deletes on a collection, are
//! recorded as [`StorageOp`]s on the owning room. A record that has not been
//! inserted into a collection yet is detached: writes only change its fields.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::room::RoomShared;

/// Named field values of one record.
pub type Fields = BTreeMap<String, Value>;

/// A low-level write, as sent between replicas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageOp {
    /// Put a whole record under `key`.
    Insert { collection: String, key: String, fields: Fields },
    /// Remove the record under `key`.
    Delete { collection: String, key: String },
    /// Write one field of an existing record.
    Set { collection: String, key: String, field: String, value: Value },
}

impl StorageOp {
    pub fn collection(&self) -> &str {
        match self {
            StorageOp::Insert { collection, .. }
            | StorageOp::Delete { collection, .. }
            | StorageOp::Set { collection, .. } => collection,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StorageOp::Insert { key, .. }
            | StorageOp::Delete { key, .. }
            | StorageOp::Set { key, .. } => key,
        }
    }
}

/// Where an attached record lives.
struct Attachment {
    room: Weak<RoomShared>,
    collection: String,
    key: String,
}

struct LiveObjectInner {
    fields: RefCell<Fields>,
    attachment: RefCell<Option<Attachment>>,
}

/// One replicated record. Cloning shares the record.
#[derive(Clone)]
pub struct LiveObject {
    inner: Rc<LiveObjectInner>,
}

impl LiveObject {
    /// A new, detached, empty record.
    pub fn new() -> Self {
        Self::from_fields(Fields::new())
    }

    /// A new detached record holding `fields`.
    pub fn from_fields(fields: Fields) -> Self {
        Self {
            inner: Rc::new(LiveObjectInner {
                fields: RefCell::new(fields),
                attachment: RefCell::new(None),
            }),
        }
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.inner.fields.borrow().get(field).cloned()
    }

    /// Copy of every field.
    pub fn to_fields(&self) -> Fields {
        self.inner.fields.borrow().clone()
    }

    /// Write one field. Recorded on the room when the record is attached.
    /// Writing `Null` removes the field.
    pub fn set(&self, field: &str, value: Value) {
        self.write(field, value.clone());

        let attachment = self.inner.attachment.borrow();
        if let Some(at) = attachment.as_ref()
            && let Some(room) = at.room.upgrade()
        {
            room.record(StorageOp::Set {
                collection: at.collection.clone(),
                key: at.key.clone(),
                field: field.to_string(),
                value,
            });
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.attachment.borrow().is_some()
    }

    /// Whether both handles refer to the same record.
    pub fn ptr_eq(&self, other: &LiveObject) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Apply a remote write: no op is recorded.
    pub(crate) fn set_silently(&self, field: &str, value: Value) {
        self.write(field, value);
    }

    fn write(&self, field: &str, value: Value) {
        let mut fields = self.inner.fields.borrow_mut();
        if value.is_null() {
            fields.remove(field);
        } else {
            fields.insert(field.to_string(), value);
        }
    }

    fn attach(&self, room: Weak<RoomShared>, collection: &str, key: &str) {
        *self.inner.attachment.borrow_mut() = Some(Attachment {
            room,
            collection: collection.to_string(),
            key: key.to_string(),
        });
    }

    fn detach(&self) {
        self.inner.attachment.borrow_mut().take();
    }
}

impl Default for LiveObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LiveObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveObject")
            .field("fields", &*self.inner.fields.borrow())
            .field("attached", &self.is_attached())
            .finish()
    }
}

struct LiveMapInner {
    name: String,
    room: Weak<RoomShared>,
    entries: RefCell<BTreeMap<String, LiveObject>>,
}

/// A named, key-ordered collection of records. Cloning shares the collection.
#[derive(Clone)]
pub struct LiveMap {
    inner: Rc<LiveMapInner>,
}

impl LiveMap {
    pub(crate) fn new(name: &str, room: Weak<RoomShared>) -> Self {
        Self {
            inner: Rc::new(LiveMapInner {
                name: name.to_string(),
                room,
                entries: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn get(&self, key: &str) -> Option<LiveObject> {
        self.inner.entries.borrow().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.borrow().keys().cloned().collect()
    }

    /// Snapshot of `(key, record)` pairs in key order.
    pub fn entries(&self) -> Vec<(String, LiveObject)> {
        self.inner
            .entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.borrow().is_empty()
    }

    /// Insert `node` under `key`, attaching it to this collection.
    pub fn set(&self, key: &str, node: LiveObject) {
        let fields = node.to_fields();
        self.replace(key, node);
        self.record(StorageOp::Insert {
            collection: self.inner.name.clone(),
            key: key.to_string(),
            fields,
        });
    }

    /// Remove the record under `key`, detaching it.
    pub fn delete(&self, key: &str) -> Option<LiveObject> {
        let removed = self.inner.entries.borrow_mut().remove(key)?;
        removed.detach();
        self.record(StorageOp::Delete {
            collection: self.inner.name.clone(),
            key: key.to_string(),
        });
        Some(removed)
    }

    /// Remote insert: replaces any existing record, records nothing.
    pub(crate) fn insert_silently(&self, key: &str, node: LiveObject) {
        self.replace(key, node);
    }

    fn replace(&self, key: &str, node: LiveObject) {
        node.attach(self.inner.room.clone(), &self.inner.name, key);
        let previous = self
            .inner
            .entries
            .borrow_mut()
            .insert(key.to_string(), node.clone());
        if let Some(previous) = previous
            && !previous.ptr_eq(&node)
        {
            previous.detach();
        }
    }

    /// Remote delete: records nothing.
    pub(crate) fn remove_silently(&self, key: &str) -> Option<LiveObject> {
        let removed = self.inner.entries.borrow_mut().remove(key)?;
        removed.detach();
        Some(removed)
    }

    fn record(&self, op: StorageOp) {
        if let Some(room) = self.inner.room.upgrade() {
            room.record(op);
        }
    }
}

impl fmt::Debug for LiveMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveMap")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}
