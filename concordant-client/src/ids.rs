//! Identifiers shared by every layer of the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Per-session client identity, random v4 UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create with an explicit UUID (for testing).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name scoping a set of objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Service-wide identity of a replicated object: (collection, type tag, name).
///
/// Used as the cache key and, once encoded by [`crate::codec::WireCodec`], as
/// the `id` field of every request that targets an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    #[serde(rename = "collectionUId")]
    pub collection: CollectionId,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(
        collection: CollectionId,
        type_tag: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            collection,
            type_tag: type_tag.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.collection, self.type_tag, self.name)
    }
}

/// A local tick issued by [`crate::clock::ClockEnvironment`].
///
/// Unique per (client, counter); counters are never reused by one client.
/// Ordered by counter first, client breaking ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub counter: u64,
    pub client: ClientId,
}
