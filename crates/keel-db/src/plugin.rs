//! Plugins: declarative bundles of schema and behavior, and their merge.
//!
//! A plugin has six sections. The structural ones (components, resources,
//! archetypes) describe data shape; two plugins may both declare a key there
//! only if they share the very same declaration (`Arc` identity). The
//! behavioral ones (transactions, systems, actions) are unioned and a later
//! plugin overrides an earlier one under the same name.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;

use keel_ecs::entity::Entity;
use keel_ecs::layout::compute_layout;
use keel_ecs::schema::Schema;
use keel_ecs::store::{ArchetypeComponents, Store, StoreSchema};

use crate::database::Database;
use crate::schedule::SystemSchedule;
use crate::{PluginConflictError, PluginError};

// ---------------------------------------------------------------------------
// Behavior types
// ---------------------------------------------------------------------------

/// A transaction body. Receives the store and the caller's arguments and may
/// return the entity it created.
pub type TransactionFn = Rc<dyn Fn(&mut Store, &Value) -> anyhow::Result<Option<Entity>>>;

/// An action body. Actions mutate only by calling transactions or other
/// actions on the database they receive.
pub type ActionFn = Rc<dyn Fn(&Database, &Value) -> anyhow::Result<Value>>;

/// The per-tick function a system's factory returns.
pub type SystemFn = Box<dyn FnMut(&Database) -> anyhow::Result<()>>;

/// Runs once per database build and returns the system's tick function.
pub type SystemFactory = Rc<dyn Fn(&Database) -> anyhow::Result<SystemFn>>;

/// A system: how to create it and where it runs.
#[derive(Clone)]
pub struct SystemDeclaration {
    pub create: SystemFactory,
    pub schedule: SystemSchedule,
}

impl fmt::Debug for SystemDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDeclaration")
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Section
// ---------------------------------------------------------------------------

/// A plugin section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Components,
    Resources,
    Archetypes,
    Transactions,
    Systems,
    Actions,
}

impl Section {
    /// Whether keys in this section must be identical across plugins.
    pub fn is_structural(self) -> bool {
        matches!(self, Section::Components | Section::Resources | Section::Archetypes)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Section::Components => "components",
            Section::Resources => "resources",
            Section::Archetypes => "archetypes",
            Section::Transactions => "transactions",
            Section::Systems => "systems",
            Section::Actions => "actions",
        })
    }
}

// ---------------------------------------------------------------------------
// Plugin
// ---------------------------------------------------------------------------

/// An immutable bundle of declarations.
///
/// Cloning a plugin is cheap: every declaration is reference counted, and the
/// clone shares them, so a clone never conflicts with its original.
#[derive(Clone, Default)]
pub struct Plugin {
    components: BTreeMap<String, Arc<Schema>>,
    resources: BTreeMap<String, Arc<Schema>>,
    archetypes: BTreeMap<String, ArchetypeComponents>,
    transactions: BTreeMap<String, TransactionFn>,
    systems: BTreeMap<String, SystemDeclaration>,
    actions: BTreeMap<String, ActionFn>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("archetypes", &self.archetypes)
            .field("transactions", &self.transactions.keys().collect::<Vec<_>>())
            .field("systems", &self.systems)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Plugin {
    pub fn builder() -> PluginBuilder {
        PluginBuilder::default()
    }

    pub fn components(&self) -> &BTreeMap<String, Arc<Schema>> {
        &self.components
    }

    pub fn resources(&self) -> &BTreeMap<String, Arc<Schema>> {
        &self.resources
    }

    pub fn archetypes(&self) -> &BTreeMap<String, ArchetypeComponents> {
        &self.archetypes
    }

    pub fn transactions(&self) -> &BTreeMap<String, TransactionFn> {
        &self.transactions
    }

    pub fn systems(&self) -> &BTreeMap<String, SystemDeclaration> {
        &self.systems
    }

    pub fn actions(&self) -> &BTreeMap<String, ActionFn> {
        &self.actions
    }

    /// Keys declared in `section`, in sorted order.
    pub fn keys(&self, section: Section) -> Vec<&str> {
        fn names<V>(map: &BTreeMap<String, V>) -> Vec<&str> {
            map.keys().map(String::as_str).collect()
        }
        match section {
            Section::Components => names(&self.components),
            Section::Resources => names(&self.resources),
            Section::Archetypes => names(&self.archetypes),
            Section::Transactions => names(&self.transactions),
            Section::Systems => names(&self.systems),
            Section::Actions => names(&self.actions),
        }
    }

    /// The store shape this plugin declares.
    pub fn store_schema(&self) -> StoreSchema {
        StoreSchema {
            components: self.components.clone(),
            resources: self.resources.clone(),
            archetypes: self.archetypes.clone(),
        }
    }

    /// Merge `next` into `self`: structural keys must be identical,
    /// behavioral keys from `next` win.
    fn absorb(mut self, next: &Plugin) -> Result<Self, PluginConflictError> {
        merge_identical(&mut self.components, &next.components, Section::Components, Arc::ptr_eq)?;
        merge_identical(&mut self.resources, &next.resources, Section::Resources, Arc::ptr_eq)?;
        merge_identical(&mut self.archetypes, &next.archetypes, Section::Archetypes, Arc::ptr_eq)?;
        override_all(&mut self.transactions, &next.transactions);
        override_all(&mut self.systems, &next.systems);
        override_all(&mut self.actions, &next.actions);
        Ok(self)
    }
}

fn merge_identical<V: Clone>(
    into: &mut BTreeMap<String, V>,
    from: &BTreeMap<String, V>,
    section: Section,
    same: impl Fn(&V, &V) -> bool,
) -> Result<(), PluginConflictError> {
    for (key, value) in from {
        match into.get(key) {
            Some(existing) if !same(existing, value) => {
                return Err(PluginConflictError {
                    section,
                    key: key.clone(),
                });
            }
            Some(_) => {}
            None => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}

fn override_all<V: Clone>(into: &mut BTreeMap<String, V>, from: &BTreeMap<String, V>) {
    for (key, value) in from {
        into.insert(key.clone(), value.clone());
    }
}

/// Merge `plugins` left to right into one plugin.
///
/// Combining nothing yields an empty plugin. `combine(&[a, b, c])` equals
/// `combine(&[combine(&[a, b])?, c])`.
pub fn combine(plugins: &[Plugin]) -> Result<Plugin, PluginConflictError> {
    plugins
        .iter()
        .try_fold(Plugin::default(), |merged, next| merged.absorb(next))
}

// ---------------------------------------------------------------------------
// PluginBuilder
// ---------------------------------------------------------------------------

/// Assembles and validates a [`Plugin`].
///
/// ```
/// use keel_db::prelude::*;
///
/// let physics = Plugin::builder()
///     .component("mass", Schema::number().shared())
///     .archetype("Body", ["mass"])
///     .build()
///     .unwrap();
///
/// let game = Plugin::builder()
///     .extends(&physics)
///     .component("hp", Schema::integer().shared())
///     .archetype("Player", ["mass", "hp"])
///     .build()
///     .unwrap();
///
/// assert_eq!(game.keys(Section::Archetypes), ["Body", "Player"]);
/// ```
#[derive(Default)]
pub struct PluginBuilder {
    base: Option<Plugin>,
    plugin: Plugin,
}

impl PluginBuilder {
    /// Merge `base` underneath this plugin. Keys declared here override
    /// `base` only in the behavioral sections.
    pub fn extends(mut self, base: &Plugin) -> Self {
        self.base = Some(base.clone());
        self
    }

    pub fn component(mut self, name: impl Into<String>, schema: Arc<Schema>) -> Self {
        self.plugin.components.insert(name.into(), schema);
        self
    }

    pub fn resource(mut self, name: impl Into<String>, schema: Arc<Schema>) -> Self {
        self.plugin.resources.insert(name.into(), schema);
        self
    }

    /// Declare an archetype from component names.
    pub fn archetype<I, S>(self, name: impl Into<String>, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: ArchetypeComponents = components.into_iter().map(Into::into).collect();
        self.shared_archetype(name, components)
    }

    /// Declare an archetype from a component list another plugin also uses.
    pub fn shared_archetype(mut self, name: impl Into<String>, components: ArchetypeComponents) -> Self {
        self.plugin.archetypes.insert(name.into(), components);
        self
    }

    pub fn transaction(
        mut self,
        name: impl Into<String>,
        body: impl Fn(&mut Store, &Value) -> anyhow::Result<Option<Entity>> + 'static,
    ) -> Self {
        self.plugin.transactions.insert(name.into(), Rc::new(body));
        self
    }

    pub fn action(
        mut self,
        name: impl Into<String>,
        body: impl Fn(&Database, &Value) -> anyhow::Result<Value> + 'static,
    ) -> Self {
        self.plugin.actions.insert(name.into(), Rc::new(body));
        self
    }

    pub fn system(
        mut self,
        name: impl Into<String>,
        schedule: SystemSchedule,
        create: impl Fn(&Database) -> anyhow::Result<SystemFn> + 'static,
    ) -> Self {
        self.plugin.systems.insert(
            name.into(),
            SystemDeclaration {
                create: Rc::new(create),
                schedule,
            },
        );
        self
    }

    /// Validate the declarations and merge in the base plugin, if any.
    pub fn build(self) -> Result<Plugin, PluginError> {
        let PluginBuilder { base, plugin } = self;

        for (name, declaration) in &plugin.systems {
            if let Some((relation, _)) = declaration
                .schedule
                .constraints()
                .find(|(_, target)| *target == name.as_str())
            {
                return Err(PluginError::SelfReference {
                    system: name.clone(),
                    relation,
                });
            }
        }

        for (name, schema) in &plugin.components {
            if let Some(mode) = schema.layout {
                compute_layout(schema, mode).map_err(|source| PluginError::Layout {
                    component: name.clone(),
                    source,
                })?;
            }
        }

        let merged = match &base {
            Some(base) => combine(&[base.clone(), plugin])?,
            None => plugin,
        };

        for (archetype, components) in &merged.archetypes {
            if let Some(missing) = components
                .iter()
                .find(|c| !merged.components.contains_key(c.as_str()))
            {
                return Err(PluginError::UnknownComponent {
                    archetype: archetype.clone(),
                    component: missing.clone(),
                });
            }
        }

        tracing::debug!(
            components = merged.components.len(),
            resources = merged.resources.len(),
            archetypes = merged.archetypes.len(),
            transactions = merged.transactions.len(),
            systems = merged.systems.len(),
            actions = merged.actions.len(),
            "plugin built"
        );
        Ok(merged)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
