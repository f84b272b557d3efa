//! The elements store of one document.

use std::rc::Rc;

use arcol_live::{key_between, Fields, RoomSnapshot};
use arcol_types::{fields, ElementId, ElementKind};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::change::{ChangeManager, ChangeOrigin, Transaction};
use crate::element::{Element, ElementFactory, Extrusion, Group, Level, Sketch};
use crate::hierarchy::HierarchyIndex;
use crate::store::{ListenerId, ObjectChange, ObjectStore};
use crate::{Result, StoreError};

/// Default collection holding element records.
pub const ELEMENTS_COLLECTION: &str = "elements";

/// Default color of new sketches.
pub const DEFAULT_SKETCH_COLOR: &str = "#888888";

/// Element store plus its root level.
pub struct ProjectStore {
    store: Rc<ObjectStore<ElementId>>,
    root: Level,
    sketch_color: String,
}

impl ProjectStore {
    /// Load the elements collection and index its hierarchy.
    ///
    /// Fails if any record has an unknown type or if there is no level. With
    /// several levels, the one with the smallest id becomes the root.
    pub fn new(changes: Rc<ChangeManager>, collection: &str, sketch_color: &str) -> Result<Self> {
        let store = ObjectStore::new(changes, collection, ElementFactory)?;
        HierarchyIndex::install(&store);

        let levels: Vec<Level> = store
            .get_objects()
            .into_iter()
            .filter_map(Element::from_object)
            .filter_map(|e| e.as_level())
            .collect();
        if levels.len() > 1 {
            warn!(count = levels.len(), "document has several levels, using the first by id");
        }
        let root = levels.into_iter().next().ok_or(StoreError::MissingRootLevel)?;

        debug!(root = %root.id(), elements = store.len(), "project loaded");
        Ok(Self {
            store,
            root,
            sketch_color: sketch_color.to_string(),
        })
    }

    pub fn store(&self) -> &Rc<ObjectStore<ElementId>> {
        &self.store
    }

    pub fn root_level(&self) -> &Level {
        &self.root
    }

    pub fn get_by_id(&self, id: &ElementId) -> Option<Element> {
        self.store.get_by_id(id).and_then(Element::from_object)
    }

    /// Every element, ordered by id.
    pub fn elements(&self) -> Vec<Element> {
        self.store
            .get_objects()
            .into_iter()
            .filter_map(Element::from_object)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn subscribe_element_change(
        &self,
        listener: impl Fn(&Element, &ObjectChange, ChangeOrigin) + 'static,
    ) -> ListenerId {
        self.store.subscribe_object_change(move |obj, change, origin| {
            if let Some(element) = Element::from_object(Rc::clone(obj)) {
                listener(&element, change, origin);
            }
        })
    }

    pub fn make_changes<T>(&self, f: impl FnOnce(&Transaction<'_>) -> T) -> T {
        self.store.make_changes(f)
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Append a new sketch under the root level.
    pub fn create_sketch(&self, tx: &Transaction<'_>) -> Result<Sketch> {
        let record: Fields = [
            (fields::TRANSLATE.to_string(), json!([0.0, 0.0, 0.0])),
            (fields::COLOR.to_string(), json!(self.sketch_color)),
        ]
        .into();
        let element = self.create(tx, ElementKind::Sketch, &self.root, record)?;
        Ok(Sketch::from_element(element))
    }

    /// Append a new empty group under the root level.
    pub fn create_group(&self, tx: &Transaction<'_>) -> Result<Group> {
        let element = self.create(tx, ElementKind::Group, &self.root, Fields::new())?;
        Ok(Group::from_element(element))
    }

    /// Extrude `sketch`: the extrusion is appended to the sketch's parent and
    /// the sketch moves under it.
    pub fn create_extrusion(&self, tx: &Transaction<'_>, sketch: &Sketch) -> Result<Extrusion> {
        let parent = sketch.parent().unwrap_or_else(|| Element::clone(&self.root));
        let record: Fields = [
            (fields::HEIGHT.to_string(), json!(0.0)),
            (fields::BACKING_SKETCH.to_string(), json!(sketch.id())),
        ]
        .into();
        let element = self.create(tx, ElementKind::Extrusion, &parent, record)?;
        sketch.set_parent(tx, &element);
        Ok(Extrusion::from_element(element))
    }

    fn create(
        &self,
        _tx: &Transaction<'_>,
        kind: ElementKind,
        parent: &Element,
        mut record: Fields,
    ) -> Result<Element> {
        let after = parent.object().last_child().and_then(|c| c.parent_index());
        record.insert(fields::ID.into(), json!(ElementId::new()));
        record.insert(fields::TYPE.into(), json!(kind.as_str()));
        record.insert(fields::PARENT_ID.into(), json!(parent.id()));
        record.insert(fields::PARENT_INDEX.into(), json!(key_between(after.as_deref(), None)));

        let object = self.store.object_from_fields(record)?;
        self.store.add_object(Rc::clone(&object));
        Element::from_object(object).ok_or_else(|| StoreError::UnknownType(kind.to_string()))
    }

    /// Remove an element and everything under it, children first.
    pub fn remove_element(&self, _tx: &Transaction<'_>, element: &Element) {
        self.store.remove_object(element.object());
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Flat dump of every element, ordered by id.
    pub fn debug_objects(&self) -> Vec<Value> {
        self.store.debug_objects()
    }

    /// Nested dump of the hierarchy under the root level.
    pub fn debug_tree(&self) -> Value {
        tree_value(&self.root)
    }
}

fn tree_value(element: &Element) -> Value {
    let mut value = element.object().debug_value();
    let children: Vec<Value> = element.children().iter().map(tree_value).collect();
    if let Value::Object(map) = &mut value
        && !children.is_empty()
    {
        map.insert("children".into(), Value::Array(children));
    }
    value
}

/// Storage for a new document: one root level and nothing else.
pub fn initial_storage(collection: &str, level_id: ElementId) -> RoomSnapshot {
    let level: Fields = [
        (fields::ID.to_string(), json!(level_id)),
        (fields::TYPE.to_string(), json!(ElementKind::Level.as_str())),
    ]
    .into();
    let records = [(level_id.to_string(), level)].into();
    [(collection.to_string(), records)].into()
}
