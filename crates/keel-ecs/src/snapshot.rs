//! Store snapshot, restore, and state hashing.
//!
//! A [`StoreSnapshot`] captures everything needed to rebuild a store
//! exactly: allocator generations and free order, every non-transient
//! resource, and every row of every archetype with its entity handle.
//! Transient resources are never captured; restoring resets them to their
//! defaults.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{AllocatorSnapshot, Entity, EntityAllocator};
use crate::store::{empty_archetypes, EntityLocation, Store};
use crate::{EcsError, EntityValues};

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One archetype row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSnapshot {
    pub entity: Entity,
    /// `BTreeMap` keeps serialization order deterministic.
    pub components: BTreeMap<String, Value>,
}

/// A complete, serializable copy of a store's contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub allocator: AllocatorSnapshot,
    /// Non-transient resources only.
    pub resources: BTreeMap<String, Value>,
    /// Rows per archetype, in row order.
    pub archetypes: BTreeMap<String, Vec<RowSnapshot>>,
}

// ---------------------------------------------------------------------------
// Capture / restore
// ---------------------------------------------------------------------------

impl Store {
    pub fn capture_snapshot(&self) -> StoreSnapshot {
        let resources = self
            .resources
            .iter()
            .filter(|(name, _)| {
                self.schema()
                    .resources
                    .get(*name)
                    .is_some_and(|schema| !schema.transient)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let archetypes = self
            .archetypes
            .iter()
            .map(|archetype| {
                let rows = archetype
                    .iter()
                    .map(|(entity, values)| RowSnapshot {
                        entity,
                        components: values.into_iter().collect(),
                    })
                    .collect();
                (archetype.name().to_owned(), rows)
            })
            .collect();

        StoreSnapshot {
            allocator: self.allocator.to_snapshot(),
            resources,
            archetypes,
        }
    }

    /// Replace the store's contents with `snapshot`.
    ///
    /// The snapshot is fully validated before anything is replaced; on error
    /// the store is unchanged. Resources the snapshot omits (including all
    /// transient ones) are reset to their defaults. Every resource and
    /// archetype is marked changed.
    pub fn restore_snapshot(&mut self, snapshot: &StoreSnapshot) -> Result<(), EcsError> {
        let mismatch = |details: String| EcsError::SnapshotMismatch { details };

        let allocator = EntityAllocator::from_snapshot(&snapshot.allocator)
            .ok_or_else(|| mismatch("allocator free list is inconsistent".to_owned()))?;

        if let Some(name) = snapshot
            .resources
            .keys()
            .find(|name| !self.schema().resources.contains_key(*name))
        {
            return Err(mismatch(format!("unknown resource '{name}'")));
        }

        let mut archetypes = empty_archetypes(self.schema(), self.config())?;
        let mut locations = HashMap::new();
        let mut seen = BTreeSet::new();
        for (name, rows) in &snapshot.archetypes {
            let table = archetypes
                .iter_mut()
                .find(|a| a.name() == name)
                .ok_or_else(|| mismatch(format!("unknown archetype '{name}'")))?;
            for row in rows {
                if !allocator.is_alive(row.entity) || !seen.insert(row.entity) {
                    return Err(mismatch(format!(
                        "entity {} is not live or appears twice",
                        row.entity
                    )));
                }
                let values: EntityValues = row
                    .components
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let index = table.insert(row.entity, &values)?;
                locations.insert(
                    row.entity,
                    EntityLocation {
                        archetype: table.id(),
                        row: index,
                    },
                );
            }
        }
        if seen.len() != allocator.live_count() {
            return Err(mismatch(format!(
                "allocator has {} live entities but snapshot has {} rows",
                allocator.live_count(),
                seen.len()
            )));
        }

        let mut resources = BTreeMap::new();
        for (name, schema) in &self.schema().resources {
            let value = match snapshot.resources.get(name) {
                Some(value) if !schema.transient => {
                    schema
                        .validate(value)
                        .map_err(|source| EcsError::InvalidValue {
                            target: name.clone(),
                            source,
                        })?;
                    value.clone()
                }
                Some(_) => {
                    tracing::warn!(resource = %name, "ignoring snapshot value for transient resource");
                    schema.default_value()
                }
                None => schema.default_value(),
            };
            resources.insert(name.clone(), value);
        }

        self.save_all();
        self.archetypes = archetypes;
        self.allocator = allocator;
        self.locations = locations;
        self.resources = resources;
        let changed_resources: Vec<String> = self.resources.keys().cloned().collect();
        self.changes.resources.extend(changed_resources);
        let changed_archetypes: Vec<String> =
            self.archetypes.iter().map(|a| a.name().to_owned()).collect();
        self.changes.archetypes.extend(changed_archetypes);

        tracing::debug!(entities = self.entity_count(), "store restored from snapshot");
        Ok(())
    }

    /// blake3 hex digest of the canonical JSON form of the snapshot.
    ///
    /// Equal contents always produce equal hashes, regardless of the order
    /// in which resources or rows were written.
    pub fn state_hash(&self) -> String {
        let snapshot = self.capture_snapshot();
        let value = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
        blake3::hash(canonical_json(&value).as_bytes())
            .to_hex()
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Serialize `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
