//! Shared identity and kind types for the Arcol object graph.
//!
//! Every stored object is keyed by something implementing [`ObjectKey`]: its
//! string form is the record key in the replicated collection. Elements use
//! [`ElementId`]; relations use the composite [`RelationKey`].

pub mod element;
pub mod ids;
pub mod relation;

pub use element::{fields, ElementKind, Vec3};
pub use ids::{ElementId, ObjectKey};
pub use relation::{RelationKey, RelationKeyError, RELATION_SEPARATOR};
