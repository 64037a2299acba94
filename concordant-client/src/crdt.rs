//! Replicated object contract and the type-tag registry.
//!
//! The engine never looks inside a replicated value. It only needs to merge
//! one into another, serialize it for a push and rebuild it from a fetched
//! document. The registry maps the type tag carried by every [`ObjectId`]
//! to the factory that builds the matching variant.
//!
//! [`ObjectId`]: crate::ids::ObjectId

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{ClientError, ClientResult};
use crate::ids::{ClientId, Timestamp};

/// Object-safe view of a replicated value.
pub trait ReplicatedObject: Any + Send + Sync + fmt::Debug {
    /// Tag selecting the concrete variant.
    fn type_tag(&self) -> &'static str;

    /// Merge another value (full state or delta) into this one.
    ///
    /// Fails with [`ClientError::TypeMismatch`] if `other` is a different variant.
    fn merge(&mut self, other: &dyn ReplicatedObject) -> ClientResult<()>;

    /// Serialize to the transport document.
    fn to_wire(&self) -> ClientResult<String>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Statically typed replicated value.
///
/// Implement this (not [`ReplicatedObject`]) to add a variant; the object-safe
/// trait is provided by a blanket impl.
pub trait Crdt:
    Default + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
    const TYPE_TAG: &'static str;

    /// Join `other` into `self`. Must be commutative, associative and idempotent.
    fn merge_from(&mut self, other: &Self);
}

impl<T: Crdt> ReplicatedObject for T {
    fn type_tag(&self) -> &'static str {
        T::TYPE_TAG
    }

    fn merge(&mut self, other: &dyn ReplicatedObject) -> ClientResult<()> {
        let other = other
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| ClientError::TypeMismatch {
                expected: T::TYPE_TAG.to_string(),
                found: other.type_tag().to_string(),
            })?;
        self.merge_from(other);
        Ok(())
    }

    fn to_wire(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

type CreateFn = fn() -> Box<dyn ReplicatedObject>;
type DecodeFn = fn(&str) -> ClientResult<Box<dyn ReplicatedObject>>;

#[derive(Clone, Copy)]
struct Factory {
    create: CreateFn,
    decode: DecodeFn,
}

fn create<T: Crdt>() -> Box<dyn ReplicatedObject> {
    Box::new(T::default())
}

fn decode<T: Crdt>(wire: &str) -> ClientResult<Box<dyn ReplicatedObject>> {
    let value: T = serde_json::from_str(wire)?;
    Ok(Box::new(value))
}

/// Type tag → factory.
#[derive(Clone, Default)]
pub struct CrdtRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl CrdtRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the bundled variants.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<PNCounter>();
        registry.register::<LwwRegister>();
        registry
    }

    pub fn register<T: Crdt>(&mut self) {
        self.factories.insert(
            T::TYPE_TAG,
            Factory {
                create: create::<T>,
                decode: decode::<T>,
            },
        );
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.factories.contains_key(type_tag)
    }

    /// Build an empty value of the given type.
    pub fn create(&self, type_tag: &str) -> ClientResult<Box<dyn ReplicatedObject>> {
        self.factory(type_tag).map(|f| (f.create)())
    }

    /// Rebuild a value from its transport document.
    pub fn decode(&self, type_tag: &str, wire: &str) -> ClientResult<Box<dyn ReplicatedObject>> {
        let factory = self.factory(type_tag)?;
        (factory.decode)(wire)
    }

    fn factory(&self, type_tag: &str) -> ClientResult<Factory> {
        self.factories
            .get(type_tag)
            .copied()
            .ok_or_else(|| ClientError::UnknownType(type_tag.to_string()))
    }
}

impl fmt::Debug for CrdtRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.factories.keys().collect();
        tags.sort();
        f.debug_struct("CrdtRegistry").field("types", &tags).finish()
    }
}

/// Positive-negative counter: one grow-only tally per client and direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PNCounter {
    #[serde(default)]
    increments: BTreeMap<ClientId, u64>,
    #[serde(default)]
    decrements: BTreeMap<ClientId, u64>,
}

impl PNCounter {
    /// Current value, saturating at the `i64` bounds.
    pub fn get(&self) -> i64 {
        let up: i128 = self.increments.values().map(|&n| i128::from(n)).sum();
        let down: i128 = self.decrements.values().map(|&n| i128::from(n)).sum();
        let value = (up - down).clamp(i128::from(i64::MIN), i128::from(i64::MAX));
        value as i64
    }

    pub fn increment(&mut self, amount: u64, ts: Timestamp) {
        let tally = self.increments.entry(ts.client).or_default();
        *tally = tally.saturating_add(amount);
    }

    pub fn decrement(&mut self, amount: u64, ts: Timestamp) {
        let tally = self.decrements.entry(ts.client).or_default();
        *tally = tally.saturating_add(amount);
    }
}

fn join_max(into: &mut BTreeMap<ClientId, u64>, from: &BTreeMap<ClientId, u64>) {
    for (client, count) in from {
        let entry = into.entry(*client).or_default();
        *entry = (*entry).max(*count);
    }
}

impl Crdt for PNCounter {
    const TYPE_TAG: &'static str = "PNCounter";

    fn merge_from(&mut self, other: &Self) {
        join_max(&mut self.increments, &other.increments);
        join_max(&mut self.decrements, &other.decrements);
    }
}

/// Last-writer-wins register holding a string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister {
    value: Option<String>,
    stamp: Option<Timestamp>,
}

impl LwwRegister {
    pub fn get(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Overwrite the value. A local write always takes effect: if `ts` does
    /// not beat the current stamp (merged from a client further ahead), the
    /// write is stamped just past it under `ts.client`.
    pub fn set(&mut self, value: impl Into<String>, ts: Timestamp) {
        let stamp = match self.stamp {
            Some(current) if ts <= current => Timestamp {
                counter: current.counter.saturating_add(1),
                client: ts.client,
            },
            _ => ts,
        };
        self.value = Some(value.into());
        self.stamp = Some(stamp);
    }
}

impl Crdt for LwwRegister {
    const TYPE_TAG: &'static str = "LWWRegister";

    fn merge_from(&mut self, other: &Self) {
        if let Some(stamp) = other.stamp {
            if self.stamp.map_or(true, |current| stamp > current) {
                self.value = other.value.clone();
                self.stamp = Some(stamp);
            }
        }
    }
}
