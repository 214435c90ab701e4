//! Keel ECS -- schema-driven, archetype-based entity storage.
//!
//! Components and resources are described by declarative [`Schema`]s rather
//! than Rust types. Each component column is backed by the most compact
//! [`TypedBuffer`] its schema allows: a packed numeric array, a byte buffer
//! laid out by the [layout compiler](layout), a constant, or a plain array of
//! JSON values. Entities live in archetypes (fixed component sets) using a
//! Structure-of-Arrays layout; deletion swap-removes the last row so columns
//! stay dense, and generational [`Entity`] handles keep working across moves.
//!
//! # Quick Start
//!
//! ```
//! use keel_ecs::prelude::*;
//! use serde_json::json;
//!
//! let position = Schema::vector(3).shared();
//! let mass = Schema::number().shared();
//!
//! let mut schema = StoreSchema::default();
//! schema.components.insert("position".into(), position);
//! schema.components.insert("mass".into(), mass);
//! schema.archetypes.insert(
//!     "Particle".into(),
//!     ["position", "mass"].into_iter().map(String::from).collect(),
//! );
//!
//! let mut store = Store::new(schema, StoreConfig::default()).unwrap();
//! let values = json!({ "position": [1, 2, 3], "mass": 4 });
//! let e = store.insert("Particle", values.as_object().unwrap()).unwrap();
//!
//! assert_eq!(store.get_component(e, "mass"), Some(json!(4)));
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod buffer;
pub mod entity;
pub mod layout;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod vertex;

/// Component values of one entity, keyed by component name.
pub type EntityValues = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A value did not match the schema it was checked against.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("expected {expected} at '{path}', found {found}")]
pub struct ValueMismatch {
    /// JSON-path-like location, `$` for the root.
    pub path: String,
    pub expected: String,
    pub found: String,
}

/// Errors produced while computing a byte layout for a schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayoutError {
    /// Only objects and fixed-length arrays have a struct layout.
    #[error("schema of type '{kind}' is not struct-shaped; only objects and fixed-length arrays have a layout")]
    NotAStruct { kind: String },

    #[error("array at '{path}' must have a fixed length (minItems == maxItems)")]
    VariableLengthArray { path: String },

    /// Primitive arrays are vectors and must have 2, 3, or 4 elements.
    #[error("vector at '{path}' has {len} elements; vectors must have 2 to 4 elements")]
    VectorLength { path: String, len: usize },

    #[error("unsupported member type '{kind}' at '{path}'")]
    UnsupportedType { path: String, kind: String },

    #[error("struct at '{path}' has no fields")]
    EmptyStruct { path: String },

    #[error("array at '{path}' has no elements")]
    EmptyArray { path: String },

    /// A struct field cannot be expressed as a single vertex attribute.
    #[error("field '{field}' cannot be a vertex attribute: {reason}")]
    UnsupportedVertexField { field: String, reason: String },
}

/// Errors produced by typed buffer operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("index {index} out of range for buffer of length {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("cannot grow buffer to {requested} elements; maximum length is {max}")]
    CapacityExceeded { requested: usize, max: usize },

    #[error("invalid value: {0}")]
    InvalidValue(#[from] ValueMismatch),

    #[error("no field '{name}' in struct layout")]
    UnknownField { name: String },
}

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::Entity },

    #[error("archetype '{name}' not declared. Declared archetypes: [{registered}]")]
    UnknownArchetype { name: String, registered: String },

    #[error("component '{name}' not declared. Declared components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    #[error("resource '{name}' not declared. Declared resources: [{registered}]")]
    UnknownResource { name: String, registered: String },

    #[error("archetype '{archetype}' has no component '{component}'")]
    ComponentNotInArchetype { archetype: String, component: String },

    /// An insert omitted a component whose schema has no default.
    #[error("archetype '{archetype}' requires a value for component '{component}'")]
    MissingComponent { archetype: String, component: String },

    #[error("archetype '{archetype}' lists component '{component}' more than once")]
    DuplicateComponent { archetype: String, component: String },

    #[error("row {row} out of range for archetype '{archetype}' with {len} rows")]
    InvalidRow {
        archetype: String,
        row: usize,
        len: usize,
    },

    /// A component or resource value failed schema validation.
    #[error("invalid value for '{target}': {source}")]
    InvalidValue {
        target: String,
        source: ValueMismatch,
    },

    #[error("cannot lay out component '{component}': {source}")]
    Layout {
        component: String,
        source: LayoutError,
    },

    #[error("buffer for component '{component}' failed: {source}")]
    Buffer {
        component: String,
        source: BufferError,
    },

    /// A snapshot is inconsistent with the store it is restored into.
    #[error("snapshot does not match store: {details}")]
    SnapshotMismatch { details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::buffer::{create_typed_buffer, BufferKind, TypedBuffer};
    pub use crate::entity::Entity;
    pub use crate::layout::{compute_layout, FieldType, PrimitiveType, StructLayout};
    pub use crate::schema::{LayoutMode, Schema, SchemaKind};
    pub use crate::snapshot::StoreSnapshot;
    pub use crate::store::{ArchetypeComponents, ChangeSet, Store, StoreConfig, StoreSchema};
    pub use crate::vertex::{vertex_buffer_layout, VertexBufferLayout, VertexLayoutOptions};
    pub use crate::{BufferError, EcsError, EntityValues, LayoutError, ValueMismatch};
}
