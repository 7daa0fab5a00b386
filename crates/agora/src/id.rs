//! # Identity Types
//!
//! Stable identities used throughout the dispatch machinery: active objects,
//! reply futures, and logical node addresses. Identities are never reused;
//! an `ActiveObjectId` survives any number of migrations unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique, immutable identity of one active object.
///
/// The id is minted once, at instantiation, and follows the object across
/// migrations. Location is *not* part of the identity; the
/// [`LocationDirectory`](crate::directory::LocationDirectory) maps an id to
/// its current address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ActiveObjectId(Uuid);

impl ActiveObjectId {
    /// Mint a fresh identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identity from its string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

impl fmt::Display for ActiveObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one reply slot, used to route a reply wire message back to
/// the future registered at the calling node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FutureId(Uuid);

impl FutureId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical address of a node. Opaque to the core: the transport decides what
/// an address means physically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
