//! Composite relation keys.
//!
//! A relation between two objects is stored under the key `"{a}<>{b}"`. The
//! endpoints are fixed for the relation's lifetime, so the key is also the
//! relation's only payload.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separator between the two endpoint keys.
pub const RELATION_SEPARATOR: &str = "<>";

/// Errors from parsing a composite relation key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelationKeyError {
    /// The key did not split into exactly two parts on `<>`.
    #[error("relation key {0:?} must have exactly two parts separated by '<>'")]
    Malformed(String),

    /// One of the endpoint keys failed to parse.
    #[error("relation key {key:?} has an invalid {side} endpoint")]
    InvalidEndpoint { key: String, side: &'static str },
}

/// Identity of a relation between an `A` and a `B`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationKey<A, B> {
    pub a: A,
    pub b: B,
}

impl<A, B> RelationKey<A, B> {
    pub fn new(a: A, b: B) -> Self {
        Self { a, b }
    }
}

impl<A: fmt::Display, B: fmt::Display> fmt::Display for RelationKey<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{RELATION_SEPARATOR}{}", self.a, self.b)
    }
}

impl<A: fmt::Debug, B: fmt::Debug> fmt::Debug for RelationKey<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Relation({:?} <> {:?})", self.a, self.b)
    }
}

impl<A: FromStr, B: FromStr> FromStr for RelationKey<A, B> {
    type Err = RelationKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(RELATION_SEPARATOR).collect();
        let [a, b] = parts.as_slice() else {
            return Err(RelationKeyError::Malformed(s.to_string()));
        };
        let a = a.parse().map_err(|_| RelationKeyError::InvalidEndpoint {
            key: s.to_string(),
            side: "first",
        })?;
        let b = b.parse().map_err(|_| RelationKeyError::InvalidEndpoint {
            key: s.to_string(),
            side: "second",
        })?;
        Ok(Self { a, b })
    }
}
