//! Typed identifiers for document entities.
//!
//! `ElementId` wraps a UUIDv7 (time-ordered, globally unique). It is assigned by
//! whoever creates the element, never by a store, and is stored in the replicated
//! collection as standard hyphenated UUID text. That text form is also the storage
//! key, so `Display` and `FromStr` must round-trip exactly.
//!
//! The `short()` form (first 8 hex chars) is for logs and debug dumps only; it is
//! never used as a lookup key.

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Anything usable as the identity key of a stored object.
///
/// The string form (`Display`) is the key in the replicated collection and must
/// parse back (`FromStr`) to an equal value. `Ord` provides the deterministic
/// tie-break when two siblings share a fractional index.
pub trait ObjectKey:
    Clone + Eq + Hash + Ord + fmt::Display + fmt::Debug + FromStr + 'static
{
}

impl<T> ObjectKey for T where
    T: Clone + Eq + Hash + Ord + fmt::Display + fmt::Debug + FromStr + 'static
{
}

/// An element identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(uuid::Uuid);

impl ElementId {
    /// Create a new time-ordered ID (UUIDv7).
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First 8 hex characters, for human display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }

    /// A nil / zero ID, for sentinel values only.
    pub fn nil() -> Self {
        Self(uuid::Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<uuid::Uuid> for ElementId {
    fn from(u: uuid::Uuid) -> Self {
        Self(u)
    }
}

impl From<ElementId> for uuid::Uuid {
    fn from(id: ElementId) -> uuid::Uuid {
        id.0
    }
}

impl FromStr for ElementId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Hyphenated form: this is the storage key
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElementId({})", self.short())
    }
}

impl From<ElementId> for serde_json::Value {
    fn from(id: ElementId) -> Self {
        serde_json::Value::String(id.to_string())
    }
}
