//! Core types for the object store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Set of field names, ordered for stable diagnostics.
pub type FieldSet = BTreeSet<String>;

/// Field values of an object.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Unique identifier for an object within its entity type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one open connection. Managed objects are bound to it.
///
/// `InstanceId(0)` is reserved for detached objects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl InstanceId {
    /// Allocate a process-unique instance id.
    pub fn next() -> Self {
        InstanceId(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_detached(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Descriptor for one entity type in a schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub name: String,

    /// Declared field names. Empty means the type accepts any field.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Restrict the type to a fixed set of fields.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Check whether a field may be stored on this type.
    pub fn accepts_field(&self, field: &str) -> bool {
        self.fields.is_empty() || self.fields.iter().any(|f| f == field)
    }
}

/// The set of entity types a connection is opened to support.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    types: BTreeMap<String, EntityType>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from entity type descriptors. Later duplicates win.
    pub fn of<I>(types: I) -> Self
    where
        I: IntoIterator<Item = EntityType>,
    {
        Self {
            types: types.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn with(mut self, entity_type: EntityType) -> Self {
        self.types.insert(entity_type.name.clone(), entity_type);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&EntityType> {
        self.types.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityType> {
        self.types.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Names present here but missing from `other`.
    pub fn missing_from<'a>(&'a self, other: &'a Schema) -> Vec<&'a str> {
        self.names().filter(|n| !other.contains(n)).collect()
    }
}

/// A managed object: stored in, and bound to, one open connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: EntityId,
    pub entity_type: String,

    /// Connection that produced this copy. Not persisted.
    #[serde(skip, default)]
    pub instance: InstanceId,

    pub fields: Fields,
    pub created: Timestamp,
    pub updated: Timestamp,
}

impl Object {
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    /// Decode the field map into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| crate::StoreError::Deserialization(e.to_string()))
    }

    /// Field names whose values differ between `self` and `other`.
    pub fn changed_fields(&self, other: &Object) -> FieldSet {
        let mut changed = FieldSet::new();
        for (name, value) in &self.fields {
            if other.fields.get(name) != Some(value) {
                changed.insert(name.clone());
            }
        }
        for name in other.fields.keys() {
            if !self.fields.contains_key(name) {
                changed.insert(name.clone());
            }
        }
        changed
    }

    pub(crate) fn bound_to(mut self, instance: InstanceId) -> Self {
        self.instance = instance;
        self
    }
}

/// An unmanaged object: field values not yet written to a store.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectInput {
    pub entity_type: String,
    pub fields: Fields,
}

impl ObjectInput {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: Fields::new(),
        }
    }

    /// Create an input from any value that serializes to a JSON object.
    pub fn json(entity_type: impl Into<String>, value: &impl Serialize) -> crate::Result<Self> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(map) => Ok(Self {
                entity_type: entity_type.into(),
                fields: map.into_iter().collect(),
            }),
            other => Err(crate::StoreError::Serialization(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}
