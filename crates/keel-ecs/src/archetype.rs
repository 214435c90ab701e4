//! Archetype tables.
//!
//! An [`Archetype`] stores every entity that has exactly one fixed set of
//! components. Storage is Structure-of-Arrays: one [`TypedBuffer`] column per
//! component plus a parallel `Vec<Entity>` mapping row to entity. Rows stay
//! dense; deleting a row moves the last row into the hole.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffer::{create_typed_buffer, TypedBuffer};
use crate::entity::Entity;
use crate::schema::Schema;
use crate::store::StoreConfig;
use crate::{EcsError, EntityValues};

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Index of an archetype within its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Column {
    name: String,
    schema: Arc<Schema>,
    buffer: Box<dyn TypedBuffer>,
}

impl Clone for Column {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            schema: self.schema.clone(),
            buffer: self.buffer.clone_box(),
        }
    }
}

/// A table of entities sharing one component set.
#[derive(Debug, Clone)]
pub struct Archetype {
    id: ArchetypeId,
    name: String,
    /// In declaration order.
    columns: Vec<Column>,
    entities: Vec<Entity>,
}

impl Archetype {
    /// Create an empty archetype with one column per component.
    pub fn new(
        id: ArchetypeId,
        name: impl Into<String>,
        components: &[(String, Arc<Schema>)],
        config: &StoreConfig,
    ) -> Result<Self, EcsError> {
        let name = name.into();
        let mut columns: Vec<Column> = Vec::with_capacity(components.len());
        for (component, schema) in components {
            if columns.iter().any(|c| c.name == *component) {
                return Err(EcsError::DuplicateComponent {
                    archetype: name,
                    component: component.clone(),
                });
            }
            let buffer =
                create_typed_buffer(schema, config).map_err(|source| EcsError::Layout {
                    component: component.clone(),
                    source,
                })?;
            columns.push(Column {
                name: component.clone(),
                schema: schema.clone(),
                buffer,
            });
        }
        Ok(Self {
            id,
            name,
            columns,
            entities: Vec::new(),
        })
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Component names in declaration order.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Row-to-entity map.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// The column storing `name`.
    pub fn column(&self, name: &str) -> Option<&dyn TypedBuffer> {
        self.column_index(name)
            .map(|i| self.columns[i].buffer.as_ref())
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn check_row(&self, row: usize) -> Result<(), EcsError> {
        if row < self.len() {
            Ok(())
        } else {
            Err(EcsError::InvalidRow {
                archetype: self.name.clone(),
                row,
                len: self.len(),
            })
        }
    }

    fn check_keys(&self, values: &EntityValues) -> Result<(), EcsError> {
        match values.keys().find(|key| !self.has_component(key)) {
            Some(key) => Err(EcsError::ComponentNotInArchetype {
                archetype: self.name.clone(),
                component: key.clone(),
            }),
            None => Ok(()),
        }
    }

    // -- mutation -----------------------------------------------------------

    /// Append a row for `entity`. Components absent from `values` take their
    /// schema default; a component without one is an error.
    ///
    /// All values are validated before any column is touched.
    pub fn insert(&mut self, entity: Entity, values: &EntityValues) -> Result<usize, EcsError> {
        self.check_keys(values)?;
        let mut row_values = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = match values.get(&column.name) {
                Some(value) => value.clone(),
                None => column.schema.explicit_default().ok_or_else(|| {
                    EcsError::MissingComponent {
                        archetype: self.name.clone(),
                        component: column.name.clone(),
                    }
                })?,
            };
            column
                .schema
                .validate(&value)
                .map_err(|source| EcsError::InvalidValue {
                    target: column.name.clone(),
                    source,
                })?;
            row_values.push(value);
        }

        let row = self.len();
        for i in 0..self.columns.len() {
            let column = &mut self.columns[i];
            let written = column
                .buffer
                .resize(row + 1)
                .and_then(|()| column.buffer.set(row, &row_values[i]));
            if let Err(source) = written {
                let component = column.name.clone();
                for column in &mut self.columns[..=i] {
                    // Shrinking never fails.
                    let _ = column.buffer.resize(row);
                }
                return Err(EcsError::Buffer { component, source });
            }
        }
        self.entities.push(entity);
        Ok(row)
    }

    /// Overwrite some components of `row`.
    pub fn update(&mut self, row: usize, values: &EntityValues) -> Result<(), EcsError> {
        self.check_row(row)?;
        self.check_keys(values)?;
        for column in &self.columns {
            if let Some(value) = values.get(&column.name) {
                column
                    .schema
                    .validate(value)
                    .map_err(|source| EcsError::InvalidValue {
                        target: column.name.clone(),
                        source,
                    })?;
            }
        }
        let mut written: Vec<(usize, Value)> = Vec::new();
        for i in 0..self.columns.len() {
            let column = &mut self.columns[i];
            let Some(value) = values.get(&column.name) else {
                continue;
            };
            let outcome = column.buffer.get(row).and_then(|previous| {
                column.buffer.set(row, value)?;
                Ok(previous)
            });
            match outcome {
                Ok(previous) => written.push((i, previous)),
                Err(source) => {
                    let component = column.name.clone();
                    for (j, previous) in written {
                        // The column held this value a moment ago.
                        let _ = self.columns[j].buffer.set(row, &previous);
                    }
                    return Err(EcsError::Buffer { component, source });
                }
            }
        }
        Ok(())
    }

    /// Remove `row` by moving the last row into its place.
    ///
    /// Returns the entity that moved into `row`, or `None` if the removed
    /// row was the last one.
    pub fn delete(&mut self, row: usize) -> Result<Option<Entity>, EcsError> {
        self.check_row(row)?;
        let last = self.len() - 1;
        for column in &mut self.columns {
            let moved = if row == last {
                Ok(())
            } else {
                column.buffer.copy_within(row, last, last + 1)
            };
            moved
                .and_then(|()| column.buffer.resize(last))
                .map_err(|source| EcsError::Buffer {
                    component: column.name.clone(),
                    source,
                })?;
        }
        self.entities.swap_remove(row);
        Ok(self.entities.get(row).copied())
    }

    /// Drop every row.
    pub fn clear(&mut self) {
        for column in &mut self.columns {
            let _ = column.buffer.resize(0);
        }
        self.entities.clear();
    }

    // -- reads --------------------------------------------------------------

    pub fn get_component(&self, row: usize, name: &str) -> Option<Value> {
        let index = self.column_index(name)?;
        self.columns[index].buffer.get(row).ok()
    }

    /// All component values of `row`.
    pub fn get(&self, row: usize) -> Option<EntityValues> {
        if row >= self.len() {
            return None;
        }
        self.columns
            .iter()
            .map(|c| c.buffer.get(row).ok().map(|v| (c.name.clone(), v)))
            .collect()
    }

    /// `(entity, values)` for every row in row order.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, EntityValues)> + '_ {
        self.entities
            .iter()
            .enumerate()
            .filter_map(|(row, &entity)| self.get(row).map(|values| (entity, values)))
    }

    /// Rows as a JSON array of component objects.
    pub fn to_json(&self) -> Value {
        Value::Array(self.iter().map(|(_, values)| Value::Object(values)).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;
    use serde_json::json;

    fn values(value: Value) -> EntityValues {
        value.as_object().cloned().unwrap()
    }

    fn particles() -> Archetype {
        let components = vec![
            ("position".to_owned(), Schema::vector(2).shared()),
            ("mass".to_owned(), Schema::number().with_default(json!(1)).shared()),
            ("label".to_owned(), Schema::string().shared()),
        ];
        Archetype::new(ArchetypeId(0), "Particle", &components, &StoreConfig::default()).unwrap()
    }

    #[test]
    fn insert_and_read_back() {
        let mut arch = particles();
        let e = Entity::new(0, 0);
        let row = arch
            .insert(e, &values(json!({ "position": [1, 2], "mass": 3, "label": "a" })))
            .unwrap();
        assert_eq!(row, 0);
        assert_eq!(arch.get_component(0, "mass"), Some(json!(3)));
        assert_eq!(arch.column("position").unwrap().kind(), BufferKind::Struct);
        assert_eq!(arch.entities(), &[e]);
    }

    #[test]
    fn insert_fills_defaults_and_rejects_missing() {
        let mut arch = particles();
        arch.insert(Entity::new(0, 0), &values(json!({ "position": [0, 0], "label": "x" })))
            .unwrap();
        assert_eq!(arch.get_component(0, "mass"), Some(json!(1)));

        let err = arch
            .insert(Entity::new(1, 0), &values(json!({ "mass": 2, "label": "y" })))
            .unwrap_err();
        assert!(matches!(err, EcsError::MissingComponent { .. }));
        assert_eq!(arch.len(), 1);
    }

    #[test]
    fn invalid_insert_leaves_columns_untouched() {
        let mut arch = particles();
        let err = arch
            .insert(
                Entity::new(0, 0),
                &values(json!({ "position": [0, 0], "mass": 1, "label": 5 })),
            )
            .unwrap_err();
        assert!(matches!(err, EcsError::InvalidValue { .. }));
        assert_eq!(arch.len(), 0);
        assert_eq!(arch.column("position").unwrap().len(), 0);
    }

    #[test]
    fn failed_update_restores_columns_already_written() {
        let components = vec![
            ("mass".to_owned(), Schema::number().shared()),
            ("position".to_owned(), Schema::vector(2).shared()),
        ];
        let mut arch =
            Archetype::new(ArchetypeId(0), "Body", &components, &StoreConfig::default()).unwrap();
        arch.insert(Entity::new(0, 0), &values(json!({ "mass": 2, "position": [1, 1] })))
            .unwrap();

        let err = arch
            .update(0, &values(json!({ "mass": 9, "position": [1e300, 0] })))
            .unwrap_err();
        assert!(matches!(err, EcsError::Buffer { ref component, .. } if component == "position"));
        assert_eq!(arch.get_component(0, "mass"), Some(json!(2)));
        assert_eq!(arch.get_component(0, "position"), Some(json!([1, 1])));
    }

    #[test]
    fn unknown_component_is_rejected() {
        let mut arch = particles();
        let err = arch
            .insert(
                Entity::new(0, 0),
                &values(json!({ "position": [0, 0], "label": "", "spin": 1 })),
            )
            .unwrap_err();
        assert!(matches!(err, EcsError::ComponentNotInArchetype { .. }));
    }

    #[test]
    fn delete_moves_last_row_into_hole() {
        let mut arch = particles();
        for i in 0..3u32 {
            arch.insert(
                Entity::new(i, 0),
                &values(json!({ "position": [i, i], "label": format!("p{i}") })),
            )
            .unwrap();
        }

        let moved = arch.delete(0).unwrap();
        assert_eq!(moved, Some(Entity::new(2, 0)));
        assert_eq!(arch.len(), 2);
        assert_eq!(arch.get_component(0, "label"), Some(json!("p2")));
        assert_eq!(arch.get_component(0, "position"), Some(json!([2, 2])));
        assert_eq!(arch.entities(), &[Entity::new(2, 0), Entity::new(1, 0)]);

        assert_eq!(arch.delete(1).unwrap(), None);
        assert!(matches!(arch.delete(5), Err(EcsError::InvalidRow { .. })));
    }

    #[test]
    fn update_validates_every_value_first() {
        let mut arch = particles();
        arch.insert(Entity::new(0, 0), &values(json!({ "position": [0, 0], "label": "a" })))
            .unwrap();
        let err = arch
            .update(0, &values(json!({ "mass": 9, "position": "bad" })))
            .unwrap_err();
        assert!(matches!(err, EcsError::InvalidValue { .. }));
        assert_eq!(arch.get_component(0, "mass"), Some(json!(1)));

        arch.update(0, &values(json!({ "mass": 9 }))).unwrap();
        assert_eq!(arch.get_component(0, "mass"), Some(json!(9)));
    }

    #[test]
    fn to_json_lists_rows() {
        let mut arch = particles();
        arch.insert(Entity::new(0, 0), &values(json!({ "position": [1, 1], "label": "a" })))
            .unwrap();
        assert_eq!(
            arch.to_json(),
            json!([{ "position": [1, 1], "mass": 1, "label": "a" }])
        );
    }

    #[test]
    fn duplicate_component_is_rejected() {
        let number = Schema::number().shared();
        let components = vec![("a".to_owned(), number.clone()), ("a".to_owned(), number)];
        let err = Archetype::new(ArchetypeId(0), "Dup", &components, &StoreConfig::default())
            .unwrap_err();
        assert!(matches!(err, EcsError::DuplicateComponent { .. }));
    }
}
