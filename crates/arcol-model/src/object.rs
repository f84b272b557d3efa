//! Entities: typed records backed by a replicated node.
//!
//! An [`ArcolObject`] keeps a cache of every field, persisted and local. The
//! generic `set` captures the old value, writes persisted fields through to
//! the node, and reports the change to its store, which fans it out to
//! listeners. Typed views (sketches, extrusions, relations) sit on top of
//! this and are the public way to mutate product data.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use arcol_live::{Fields, LiveObject};
use arcol_types::{fields, ObjectKey};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::hierarchy::ChildSet;
use crate::store::ObjectStore;

/// Where an object is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attachment {
    /// Built by a factory but not yet added to its store.
    Pending,
    /// In its store and its replicated collection.
    Attached,
    /// Removed from its store. Fields stay readable.
    Detached,
}

/// A stored object.
pub struct ArcolObject<I: ObjectKey> {
    id: I,
    node: LiveObject,
    fields: RefCell<Fields>,
    local_fields: Vec<&'static str>,
    store: Weak<ObjectStore<I>>,
    state: Cell<Attachment>,
    pub(crate) children: ChildSet<I>,
}

impl<I: ObjectKey> ArcolObject<I> {
    pub(crate) fn new(
        id: I,
        node: LiveObject,
        local: Vec<(&'static str, Value)>,
        store: Weak<ObjectStore<I>>,
    ) -> Rc<Self> {
        let mut cache = node.to_fields();
        let mut local_fields = Vec::with_capacity(local.len());
        for (name, default) in local {
            cache.insert(name.to_string(), default);
            local_fields.push(name);
        }
        Rc::new(Self {
            id,
            node,
            fields: RefCell::new(cache),
            local_fields,
            store,
            state: Cell::new(Attachment::Pending),
            children: ChildSet::default(),
        })
    }

    pub fn id(&self) -> &I {
        &self.id
    }

    /// The `type` discriminant, for stores whose records carry one.
    pub fn type_tag(&self) -> Option<String> {
        self.get(fields::TYPE)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.fields.borrow().get(field).cloned()
    }

    /// Deserialize a field. `None` if absent or of the wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        let value = self.get(field)?;
        serde_json::from_value(value).ok()
    }

    /// Every field, local ones included.
    pub fn fields(&self) -> Fields {
        self.fields.borrow().clone()
    }

    /// Fields that are written to the replicated node.
    pub fn persisted_fields(&self) -> Fields {
        self.fields
            .borrow()
            .iter()
            .filter(|(name, _)| !self.is_local_field(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_local_field(&self, field: &str) -> bool {
        self.local_fields.contains(&field)
    }

    pub fn node(&self) -> &LiveObject {
        &self.node
    }

    pub fn store(&self) -> Option<Rc<ObjectStore<I>>> {
        self.store.upgrade()
    }

    pub fn attachment(&self) -> Attachment {
        self.state.get()
    }

    pub fn is_attached(&self) -> bool {
        self.state.get() == Attachment::Attached
    }

    pub(crate) fn set_attachment(&self, state: Attachment) {
        self.state.set(state);
    }

    pub(crate) fn belongs_to(&self, store: &ObjectStore<I>) -> bool {
        std::ptr::eq(self.store.as_ptr(), store)
    }

    /// Whether the owning store currently permits mutation.
    pub fn can_mutate(&self) -> bool {
        self.store().is_some_and(|s| s.making_changes())
    }

    /// Set a field, capturing the old value and notifying the store.
    ///
    /// Outside a transaction, on a removed object, or for `id`/`type`, this
    /// logs a warning and does nothing. Setting a deep-equal value is silent.
    /// Setting `Null` removes the field.
    pub fn set(self: &Rc<Self>, field: &str, value: impl Into<Value>) {
        let value = value.into();
        let Some(store) = self.store() else {
            warn!(id = %self.id, field, "set on object whose store is gone");
            return;
        };
        if !store.making_changes() {
            warn!(id = %self.id, field, "set outside make_changes ignored");
            return;
        }
        if self.state.get() == Attachment::Detached {
            warn!(id = %self.id, field, "set on removed object ignored");
            return;
        }

        let old = self.get(field).unwrap_or(Value::Null);
        if old == value {
            return;
        }
        if field == fields::ID || field == fields::TYPE {
            warn!(id = %self.id, field, "identity fields are fixed at creation");
            return;
        }

        if !self.is_local_field(field) {
            self.node.set(field, value.clone());
        }
        {
            let mut cache = self.fields.borrow_mut();
            if value.is_null() {
                cache.remove(field);
            } else {
                cache.insert(field.to_string(), value.clone());
            }
        }

        if self.state.get() == Attachment::Attached {
            store.on_field_set(self, field, old, value);
        }
    }

    /// Take a remote value into the cache. Returns the old value if it changed.
    pub(crate) fn apply_remote_field(&self, field: &str, value: Value) -> Option<Value> {
        let mut cache = self.fields.borrow_mut();
        let old = cache.get(field).cloned().unwrap_or(Value::Null);
        if old == value {
            return None;
        }
        if value.is_null() {
            cache.remove(field);
        } else {
            cache.insert(field.to_string(), value);
        }
        Some(old)
    }

    /// Remove this object (and its subtree) from its store. Idempotent.
    pub fn delete(self: &Rc<Self>) {
        if let Some(store) = self.store() {
            store.remove_object(self);
        }
    }

    /// Plain-value dump of the cached fields.
    pub fn debug_value(&self) -> Value {
        Value::Object(self.fields().into_iter().collect())
    }
}

impl<I: ObjectKey> fmt::Debug for ArcolObject<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcolObject")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("fields", &*self.fields.borrow())
            .finish()
    }
}
