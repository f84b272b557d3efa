//! Typed views over element objects.
//!
//! Every element is an [`ArcolObject`] keyed by [`ElementId`] whose `type`
//! field names its [`ElementKind`]. [`Element`] is the kind-erased view; the
//! per-kind newtypes add typed accessors and dereference to it. Typed
//! mutators take a [`Transaction`], so they can only be called from inside
//! `make_changes`.

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use arcol_live::Fields;
use arcol_types::{fields, ElementId, ElementKind, Vec3};
use serde_json::{json, Value};

use crate::change::Transaction;
use crate::object::ArcolObject;
use crate::store::ObjectFactory;
use crate::{Result, StoreError};

pub type ElementObject = ArcolObject<ElementId>;

/// Builds element objects: checks the `type` tag and adds the local fields
/// of hidable kinds.
pub struct ElementFactory;

impl ObjectFactory<ElementId> for ElementFactory {
    fn local_fields(&self, record: &Fields) -> Result<Vec<(&'static str, Value)>> {
        let tag = record
            .get(fields::TYPE)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = ElementKind::from_str(tag).ok_or_else(|| StoreError::UnknownType(tag.to_string()))?;
        if kind.is_hidable() {
            Ok(vec![(fields::HIDDEN, Value::Bool(false))])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Any element.
#[derive(Clone)]
pub struct Element {
    object: Rc<ElementObject>,
    kind: ElementKind,
}

impl Element {
    /// View an object as an element. `None` if its `type` is not a known kind.
    pub fn from_object(object: Rc<ElementObject>) -> Option<Self> {
        let kind = ElementKind::from_str(&object.type_tag()?)?;
        Some(Self { object, kind })
    }

    pub fn id(&self) -> ElementId {
        *self.object.id()
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn object(&self) -> &Rc<ElementObject> {
        &self.object
    }

    pub fn is_attached(&self) -> bool {
        self.object.is_attached()
    }

    pub fn parent_id(&self) -> Option<ElementId> {
        self.object.parent_id()
    }

    pub fn parent_index(&self) -> Option<String> {
        self.object.parent_index()
    }

    pub fn parent(&self) -> Option<Element> {
        self.object.parent().and_then(Element::from_object)
    }

    pub fn children(&self) -> Vec<Element> {
        self.object
            .children()
            .into_iter()
            .filter_map(Element::from_object)
            .collect()
    }

    pub fn index_in_parent(&self) -> Option<usize> {
        self.object.index_in_parent()
    }

    pub fn set_parent(&self, _tx: &Transaction<'_>, parent: &Element) {
        self.object.set_parent(&parent.object);
    }

    pub fn move_to_parent_at_index(&self, _tx: &Transaction<'_>, parent: &Element, index: usize) {
        self.object.move_to_parent_at_index(&parent.object, index);
    }

    /// Remove this element and its subtree.
    pub fn delete(&self, _tx: &Transaction<'_>) {
        self.object.delete();
    }

    pub fn as_level(&self) -> Option<Level> {
        (self.kind == ElementKind::Level).then(|| Level::from_element(self.clone()))
    }

    pub fn as_group(&self) -> Option<Group> {
        (self.kind == ElementKind::Group).then(|| Group::from_element(self.clone()))
    }

    pub fn as_sketch(&self) -> Option<Sketch> {
        (self.kind == ElementKind::Sketch).then(|| Sketch::from_element(self.clone()))
    }

    pub fn as_extrusion(&self) -> Option<Extrusion> {
        (self.kind == ElementKind::Extrusion).then(|| Extrusion::from_element(self.clone()))
    }

    /// Whether both views refer to the same object.
    pub fn ptr_eq(&self, other: &Element) -> bool {
        Rc::ptr_eq(&self.object, &other.object)
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.id().short())
    }
}

macro_rules! element_kind {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        pub struct $name(Element);

        impl $name {
            pub(crate) fn from_element(element: Element) -> Self {
                Self(element)
            }
        }

        impl Deref for $name {
            type Target = Element;

            fn deref(&self) -> &Element {
                &self.0
            }
        }

        impl From<$name> for Element {
            fn from(typed: $name) -> Element {
                typed.0
            }
        }
    };
}

element_kind!(
    /// The document root.
    Level
);
element_kind!(
    /// A plain container.
    Group
);
element_kind!(
    /// A 2D profile.
    Sketch
);
element_kind!(
    /// A solid built from a backing sketch.
    Extrusion
);

impl Sketch {
    pub fn translate(&self) -> Vec3 {
        self.object.get_as(fields::TRANSLATE).unwrap_or_default()
    }

    pub fn set_translate(&self, _tx: &Transaction<'_>, translate: Vec3) {
        self.object.set(fields::TRANSLATE, json!(translate));
    }

    pub fn color(&self) -> String {
        self.object.get_as(fields::COLOR).unwrap_or_default()
    }

    pub fn set_color(&self, _tx: &Transaction<'_>, color: &str) {
        self.object.set(fields::COLOR, color);
    }
}

impl Extrusion {
    pub fn height(&self) -> f64 {
        self.object.get_as(fields::HEIGHT).unwrap_or_default()
    }

    pub fn set_height(&self, _tx: &Transaction<'_>, height: f64) {
        self.object.set(fields::HEIGHT, height);
    }

    pub fn backing_sketch(&self) -> Option<ElementId> {
        self.object.get_as(fields::BACKING_SKETCH)
    }
}

/// Elements carrying the local `hidden` flag.
pub trait Hidable: Deref<Target = Element> {
    fn hidden(&self) -> bool {
        self.object.get_as(fields::HIDDEN).unwrap_or(false)
    }

    /// Local only: never written to the replicated record.
    fn set_hidden(&self, _tx: &Transaction<'_>, hidden: bool) {
        self.object.set(fields::HIDDEN, hidden);
    }
}

impl Hidable for Group {}
impl Hidable for Sketch {}
impl Hidable for Extrusion {}
