//! The store: resources, archetypes, and stable entity handles.
//!
//! A [`Store`] is built from a [`StoreSchema`] once and never changes shape.
//! Resources are single schema-checked values. Entities are inserted into a
//! named archetype and addressed afterwards by [`Entity`] handle; the store
//! keeps each live handle's current `(archetype, row)` and patches it when a
//! swap-remove moves the row. Every mutation is recorded in a [`ChangeSet`]
//! that the caller drains with [`Store::take_changes`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::archetype::{Archetype, ArchetypeId};
use crate::entity::{Entity, EntityAllocator};
use crate::schema::Schema;
use crate::{EcsError, EntityValues};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Storage limits shared by every buffer in a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Capacity of a buffer's first allocation.
    pub initial_capacity: usize,
    /// Hard cap on elements per buffer.
    pub max_length: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            max_length: 100_000_000,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreSchema
// ---------------------------------------------------------------------------

/// Component names of one archetype, shared by identity between plugins.
pub type ArchetypeComponents = Arc<[String]>;

/// The complete shape of a store.
#[derive(Debug, Clone, Default)]
pub struct StoreSchema {
    pub components: BTreeMap<String, Arc<Schema>>,
    pub resources: BTreeMap<String, Arc<Schema>>,
    pub archetypes: BTreeMap<String, ArchetypeComponents>,
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// What a batch of mutations touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub resources: BTreeSet<String>,
    pub archetypes: BTreeSet<String>,
    pub components: BTreeSet<String>,
    pub entities: BTreeSet<Entity>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
            && self.archetypes.is_empty()
            && self.components.is_empty()
            && self.entities.is_empty()
    }

    /// Whether any of `resources` changed.
    pub fn touches_resources<'a>(&self, mut resources: impl Iterator<Item = &'a str>) -> bool {
        resources.any(|name| self.resources.contains(name))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// State overwritten since [`Store::atomically`] began, saved the first time
/// each piece is touched.
#[derive(Debug, Default)]
struct Journal {
    changes: ChangeSet,
    resources: BTreeMap<String, Value>,
    archetypes: BTreeMap<ArchetypeId, Archetype>,
    entities: Option<(EntityAllocator, HashMap<Entity, EntityLocation>)>,
}

impl Journal {
    /// Fold a finished inner journal into this one. Entries saved here first
    /// are older and win.
    fn absorb(&mut self, inner: Journal) {
        for (name, value) in inner.resources {
            self.resources.entry(name).or_insert(value);
        }
        for (id, table) in inner.archetypes {
            self.archetypes.entry(id).or_insert(table);
        }
        if self.entities.is_none() {
            self.entities = inner.entities;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityLocation {
    pub(crate) archetype: ArchetypeId,
    pub(crate) row: usize,
}

/// Resources plus archetype tables for one database.
pub struct Store {
    schema: StoreSchema,
    config: StoreConfig,
    pub(crate) resources: BTreeMap<String, Value>,
    pub(crate) archetypes: Vec<Archetype>,
    archetype_index: HashMap<String, ArchetypeId>,
    pub(crate) allocator: EntityAllocator,
    pub(crate) locations: HashMap<Entity, EntityLocation>,
    pub(crate) changes: ChangeSet,
    journal: Option<Journal>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("resources", &self.resources.len())
            .field("archetypes", &self.archetypes.len())
            .field("entities", &self.locations.len())
            .finish()
    }
}

fn joined<'a>(names: impl Iterator<Item = &'a String>) -> String {
    names.map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// One empty table per declared archetype, ids in name order.
pub(crate) fn empty_archetypes(
    schema: &StoreSchema,
    config: &StoreConfig,
) -> Result<Vec<Archetype>, EcsError> {
    let mut archetypes = Vec::with_capacity(schema.archetypes.len());
    for (name, components) in &schema.archetypes {
        let columns = components
            .iter()
            .map(|component| {
                schema
                    .components
                    .get(component)
                    .map(|s| (component.clone(), s.clone()))
                    .ok_or_else(|| EcsError::UnknownComponent {
                        name: component.clone(),
                        registered: joined(schema.components.keys()),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let id = ArchetypeId(archetypes.len() as u32);
        archetypes.push(Archetype::new(id, name.clone(), &columns, config)?);
    }
    Ok(archetypes)
}

impl Store {
    /// Build an empty store. Resources start at their schema default.
    pub fn new(schema: StoreSchema, config: StoreConfig) -> Result<Self, EcsError> {
        let mut resources = BTreeMap::new();
        for (name, resource) in &schema.resources {
            let value = resource.default_value();
            resource
                .validate(&value)
                .map_err(|source| EcsError::InvalidValue {
                    target: name.clone(),
                    source,
                })?;
            resources.insert(name.clone(), value);
        }

        let archetypes = empty_archetypes(&schema, &config)?;
        let archetype_index = archetypes
            .iter()
            .map(|a| (a.name().to_owned(), a.id()))
            .collect();

        tracing::debug!(
            components = schema.components.len(),
            resources = schema.resources.len(),
            archetypes = archetypes.len(),
            "store created"
        );

        Ok(Self {
            schema,
            config,
            resources,
            archetypes,
            archetype_index,
            allocator: EntityAllocator::new(),
            locations: HashMap::new(),
            changes: ChangeSet::default(),
            journal: None,
        })
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // -- resources ----------------------------------------------------------

    pub fn resource(&self, name: &str) -> Option<&Value> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> &BTreeMap<String, Value> {
        &self.resources
    }

    /// Replace a resource value after checking it against its schema.
    pub fn set_resource(&mut self, name: &str, value: Value) -> Result<(), EcsError> {
        let schema = self
            .schema
            .resources
            .get(name)
            .ok_or_else(|| EcsError::UnknownResource {
                name: name.to_owned(),
                registered: joined(self.schema.resources.keys()),
            })?;
        schema
            .validate(&value)
            .map_err(|source| EcsError::InvalidValue {
                target: name.to_owned(),
                source,
            })?;
        self.save_resource(name);
        self.resources.insert(name.to_owned(), value);
        self.changes.resources.insert(name.to_owned());
        Ok(())
    }

    /// Reset every transient resource to its default.
    pub fn reset_transient_resources(&mut self) {
        for (name, schema) in &self.schema.resources {
            if schema.transient {
                if let Some(journal) = self.journal.as_mut() {
                    if let Some(previous) = self.resources.get(name) {
                        journal
                            .resources
                            .entry(name.clone())
                            .or_insert_with(|| previous.clone());
                    }
                }
                self.resources.insert(name.clone(), schema.default_value());
                self.changes.resources.insert(name.clone());
            }
        }
    }

    // -- archetypes ---------------------------------------------------------

    pub fn archetype(&self, name: &str) -> Option<&Archetype> {
        self.archetype_index
            .get(name)
            .map(|id| &self.archetypes[id.index()])
    }

    pub fn archetypes(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    fn archetype_id(&self, name: &str) -> Result<ArchetypeId, EcsError> {
        self.archetype_index
            .get(name)
            .copied()
            .ok_or_else(|| EcsError::UnknownArchetype {
                name: name.to_owned(),
                registered: joined(self.schema.archetypes.keys()),
            })
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Insert a new entity into `archetype`.
    pub fn insert(&mut self, archetype: &str, values: &EntityValues) -> Result<Entity, EcsError> {
        let id = self.archetype_id(archetype)?;
        self.save_archetype(id);
        self.save_entities();
        let entity = self.allocator.allocate();
        let table = &mut self.archetypes[id.index()];
        let row = match table.insert(entity, values) {
            Ok(row) => row,
            Err(err) => {
                self.allocator.free(entity);
                return Err(err);
            }
        };
        self.changes.archetypes.insert(table.name().to_owned());
        self.changes
            .components
            .extend(table.components().map(str::to_owned));
        self.changes.entities.insert(entity);
        self.locations.insert(
            entity,
            EntityLocation {
                archetype: id,
                row,
            },
        );
        Ok(entity)
    }

    /// Overwrite some components of `entity`.
    pub fn update(&mut self, entity: Entity, values: &EntityValues) -> Result<(), EcsError> {
        let location = self.locate(entity)?;
        self.save_archetype(location.archetype);
        self.archetypes[location.archetype.index()].update(location.row, values)?;
        self.changes.components.extend(values.keys().cloned());
        self.changes.entities.insert(entity);
        Ok(())
    }

    /// Remove `entity`. Its handle becomes stale.
    pub fn delete(&mut self, entity: Entity) -> Result<(), EcsError> {
        let location = self.locate(entity)?;
        self.save_archetype(location.archetype);
        self.save_entities();
        let table = &mut self.archetypes[location.archetype.index()];
        let moved = table.delete(location.row)?;
        self.changes.archetypes.insert(table.name().to_owned());
        self.changes
            .components
            .extend(table.components().map(str::to_owned));
        self.changes.entities.insert(entity);

        if let Some(moved) = moved {
            if let Some(moved_location) = self.locations.get_mut(&moved) {
                moved_location.row = location.row;
            }
        }
        self.locations.remove(&entity);
        self.allocator.free(entity);
        Ok(())
    }

    fn locate(&self, entity: Entity) -> Result<EntityLocation, EcsError> {
        if !self.allocator.is_alive(entity) {
            return Err(EcsError::StaleEntity { entity });
        }
        self.locations
            .get(&entity)
            .copied()
            .ok_or(EcsError::StaleEntity { entity })
    }

    // -- atomic writes ------------------------------------------------------

    /// Run `write` as one unit. If it returns an error, every mutation it
    /// made is undone and the pending change set is as it was before.
    /// Calls nest; an inner failure undoes only the inner writes.
    pub fn atomically<R, E>(
        &mut self,
        write: impl FnOnce(&mut Store) -> Result<R, E>,
    ) -> Result<R, E> {
        let outer = self.journal.replace(Journal {
            changes: self.changes.clone(),
            ..Journal::default()
        });
        let result = write(self);
        let inner = self.journal.take().unwrap_or_default();
        if result.is_err() {
            self.roll_back(inner);
            self.journal = outer;
        } else {
            self.journal = outer.map(|mut outer| {
                outer.absorb(inner);
                outer
            });
        }
        result
    }

    fn roll_back(&mut self, journal: Journal) {
        for (name, value) in journal.resources {
            self.resources.insert(name, value);
        }
        for (id, table) in journal.archetypes {
            self.archetypes[id.index()] = table;
        }
        if let Some((allocator, locations)) = journal.entities {
            self.allocator = allocator;
            self.locations = locations;
        }
        self.changes = journal.changes;
        tracing::trace!("store writes rolled back");
    }

    fn save_resource(&mut self, name: &str) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if let Some(previous) = self.resources.get(name) {
            journal
                .resources
                .entry(name.to_owned())
                .or_insert_with(|| previous.clone());
        }
    }

    fn save_archetype(&mut self, id: ArchetypeId) {
        if let Some(journal) = self.journal.as_mut() {
            journal
                .archetypes
                .entry(id)
                .or_insert_with(|| self.archetypes[id.index()].clone());
        }
    }

    fn save_entities(&mut self) {
        if let Some(journal) = self.journal.as_mut() {
            if journal.entities.is_none() {
                journal.entities = Some((self.allocator.clone(), self.locations.clone()));
            }
        }
    }

    /// Save everything before a whole-store replacement.
    pub(crate) fn save_all(&mut self) {
        let names: Vec<String> = self.resources.keys().cloned().collect();
        for name in names {
            self.save_resource(&name);
        }
        for index in 0..self.archetypes.len() {
            self.save_archetype(self.archetypes[index].id());
        }
        self.save_entities();
    }

    // -- entity reads -------------------------------------------------------

    pub fn contains(&self, entity: Entity) -> bool {
        self.locate(entity).is_ok()
    }

    /// The archetype name and current row of `entity`.
    pub fn location(&self, entity: Entity) -> Option<(&str, usize)> {
        let location = self.locate(entity).ok()?;
        Some((self.archetypes[location.archetype.index()].name(), location.row))
    }

    pub fn get(&self, entity: Entity) -> Option<EntityValues> {
        let location = self.locate(entity).ok()?;
        self.archetypes[location.archetype.index()].get(location.row)
    }

    pub fn get_component(&self, entity: Entity, component: &str) -> Option<Value> {
        let location = self.locate(entity).ok()?;
        self.archetypes[location.archetype.index()].get_component(location.row, component)
    }

    pub fn entity_count(&self) -> usize {
        self.locations.len()
    }

    // -- changes ------------------------------------------------------------

    /// Mutations recorded since the last [`take_changes`](Self::take_changes).
    pub fn pending_changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Drain the recorded mutations.
    pub fn take_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }

    /// Resources and archetype rows as one JSON object.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "resources": self.resources,
            "archetypes": self
                .archetypes
                .iter()
                .map(|a| (a.name().to_owned(), a.to_json()))
                .collect::<serde_json::Map<_, _>>(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
