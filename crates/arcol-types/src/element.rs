//! Element kinds and the well-known field names of stored records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

/// Field names shared by every stored record, plus the element-specific ones.
pub mod fields {
    /// Object identity. Equal to the record's key in its collection.
    pub const ID: &str = "id";
    /// Variant discriminant, fixed at creation.
    pub const TYPE: &str = "type";
    pub const PARENT_ID: &str = "parentId";
    /// Fractional sort key among siblings.
    pub const PARENT_INDEX: &str = "parentIndex";

    pub const TRANSLATE: &str = "translate";
    pub const COLOR: &str = "color";
    pub const HEIGHT: &str = "height";
    pub const BACKING_SKETCH: &str = "backingSketch";

    /// Local-only visibility toggle. Never written to the replicated record.
    pub const HIDDEN: &str = "hidden";
}

/// A point or offset in document space.
pub type Vec3 = [f64; 3];

/// Discriminant of an element record, stored in its `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ElementKind {
    /// The document root. Exactly one per document.
    Level,
    /// Plain container.
    Group,
    /// 2D profile with a color and translation.
    Sketch,
    /// Solid built from a backing sketch, which it parents.
    Extrusion,
}

impl ElementKind {
    /// Parse a stored discriminant. Exact match only.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Level => "level",
            ElementKind::Group => "group",
            ElementKind::Sketch => "sketch",
            ElementKind::Extrusion => "extrusion",
        }
    }

    /// Whether this kind carries the local `hidden` field.
    pub fn is_hidable(&self) -> bool {
        !matches!(self, ElementKind::Level)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
