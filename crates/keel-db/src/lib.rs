//! Keel DB -- plugins, scheduling, and the transactional database.
//!
//! A [`Plugin`](plugin::Plugin) bundles component, resource, and archetype
//! declarations with the transactions, actions, and systems that operate on
//! them. Plugins are merged with [`combine`](plugin::combine), compiled into a
//! [`Database`](database::Database), and driven one tick at a time. Every
//! write goes through a named transaction; each committed transaction is
//! published once, with the set of everything it touched, so derived
//! observables recompute only when their inputs changed.
//!
//! # Quick Start
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use keel_db::prelude::*;
//! use serde_json::json;
//!
//! let plugin = Plugin::builder()
//!     .resource("a", Schema::number().with_default(json!(10)).shared())
//!     .resource("b", Schema::number().with_default(json!(20)).shared())
//!     .transaction("set_a", |store, args| {
//!         store.set_resource("a", args.clone())?;
//!         Ok(None)
//!     })
//!     .build()
//!     .unwrap();
//!
//! let db = Database::create(&plugin).unwrap();
//! let sum = db.observe_dependent_value(|r| {
//!     r.number("a").unwrap_or(0.0) + r.number("b").unwrap_or(0.0)
//! });
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = seen.clone();
//! let handle = sum.observe(move |v| sink.borrow_mut().push(v));
//! db.transact("set_a", &json!(15)).unwrap();
//! handle.unobserve();
//!
//! assert_eq!(*seen.borrow(), vec![30.0, 35.0]);
//! ```

#![deny(unsafe_code)]

pub mod database;
pub mod plugin;
pub mod schedule;

use serde::{Deserialize, Serialize};

use keel_ecs::store::StoreConfig;
use keel_ecs::{EcsError, LayoutError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for [`Database::create_with_config`](database::Database::create_with_config).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub store: StoreConfig,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Two plugins declared the same structural key with different declarations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("plugin conflict: {section}.{key} must be the identical declaration across plugins")]
pub struct PluginConflictError {
    pub section: plugin::Section,
    pub key: String,
}

/// The system ordering constraints contain a cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circular dependency detected involving node: {node}")]
pub struct ScheduleCycleError {
    pub node: String,
}

/// Errors produced while building or combining plugins.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    Conflict(#[from] PluginConflictError),

    /// A system names itself in its own schedule.
    #[error("system '{system}' cannot be scheduled {relation} itself")]
    SelfReference {
        system: String,
        relation: schedule::Relation,
    },

    #[error("archetype '{archetype}' uses undeclared component '{component}'")]
    UnknownComponent {
        archetype: String,
        component: String,
    },

    /// A component with an explicit layout annotation cannot be laid out.
    #[error("component '{component}' has an unrepresentable layout: {source}")]
    Layout {
        component: String,
        source: LayoutError,
    },
}

/// Errors produced by database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("transaction '{name}' not declared. Declared transactions: [{registered}]")]
    UnknownTransaction { name: String, registered: String },

    #[error("action '{name}' not declared. Declared actions: [{registered}]")]
    UnknownAction { name: String, registered: String },

    /// A transaction body returned an error.
    #[error("transaction '{name}' failed: {reason:#}")]
    Transaction { name: String, reason: anyhow::Error },

    /// The argument provider of an async transaction failed.
    #[error("arguments for transaction '{name}' could not be produced: {reason:#}")]
    Arguments { name: String, reason: anyhow::Error },

    /// A write was attempted while the store was borrowed for reading.
    #[error("cannot run '{operation}': the store is borrowed")]
    StoreBusy { operation: String },

    #[error("action '{name}' failed: {reason:#}")]
    Action { name: String, reason: anyhow::Error },

    /// A system failed to start or failed during a tick.
    #[error("system '{name}' failed: {reason:#}")]
    System { name: String, reason: anyhow::Error },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Schedule(#[from] ScheduleCycleError),

    #[error(transparent)]
    Ecs(#[from] EcsError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::database::{Database, ResourceReader, TickDiagnostics, TransactionCommit};
    pub use crate::plugin::{combine, Plugin, PluginBuilder, Section, SystemDeclaration};
    pub use crate::schedule::{topological_sort, Schedule, SystemSchedule};
    pub use crate::{
        DatabaseConfig, DatabaseError, PluginConflictError, PluginError, ScheduleCycleError,
    };
    pub use keel_ecs::prelude::*;
    pub use keel_observe::prelude::*;
}
