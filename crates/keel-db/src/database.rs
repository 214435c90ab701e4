//! The database: one store plus the transactions, actions, and systems that
//! operate on it.
//!
//! All writes run as named commits. A commit either applies every write of
//! its body or, when the body fails, none of them. A successful commit
//! drains the store's change set and publishes one [`TransactionCommit`].
//! Every observable the database hands out is driven by that stream, so an
//! observer sees a multi-write transaction exactly once, after all of its
//! writes.

use std::cell::{Cell, Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;

use keel_ecs::entity::Entity;
use keel_ecs::schema::Schema;
use keel_ecs::snapshot::StoreSnapshot;
use keel_ecs::store::{ChangeSet, Store};
use keel_ecs::{EcsError, EntityValues};
use keel_observe::combinators::with_deduplicate_data;
use keel_observe::observe::{Observe, Subscriber};
use keel_observe::state::Subject;

use crate::plugin::{ActionFn, Plugin, SystemFn, TransactionFn};
use crate::schedule::Schedule;
use crate::{DatabaseConfig, DatabaseError};

// ---------------------------------------------------------------------------
// TransactionCommit
// ---------------------------------------------------------------------------

/// One committed write and everything it touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCommit {
    /// Transaction name, or the built-in write that produced it
    /// (`insert`, `update`, `delete`, `set_resource`, `restore_snapshot`).
    pub name: String,
    pub changes: ChangeSet,
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// The tick these timings belong to, counting from 1.
    pub tick: u64,
    /// Wall-clock time per system, in execution order. A failed tick lists
    /// the systems that ran, ending with the one that failed.
    pub system_times: Vec<(String, Duration)>,
    pub total_time: Duration,
}

// ---------------------------------------------------------------------------
// ResourceReader
// ---------------------------------------------------------------------------

/// Read access to resources that remembers which ones were read.
pub struct ResourceReader<'a> {
    store: &'a Store,
    reads: RefCell<BTreeSet<String>>,
}

impl<'a> ResourceReader<'a> {
    fn new(store: &'a Store) -> Self {
        Self {
            store,
            reads: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn resource(&self, name: &str) -> Option<&'a Value> {
        self.reads.borrow_mut().insert(name.to_owned());
        self.store.resource(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.resource(name)?.as_f64()
    }

    /// Deserialize a resource into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        serde_json::from_value(self.resource(name)?.clone()).ok()
    }

    /// Names read so far.
    pub fn reads(&self) -> Vec<String> {
        self.reads.borrow().iter().cloned().collect()
    }

    fn into_reads(self) -> BTreeSet<String> {
        self.reads.into_inner()
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

struct RunningSystem {
    name: String,
    run: SystemFn,
}

/// A store with its behavior, built from a [`Plugin`].
pub struct Database {
    store: Rc<RefCell<Store>>,
    transactions: BTreeMap<String, TransactionFn>,
    actions: BTreeMap<String, ActionFn>,
    schedule: Schedule,
    systems: RefCell<Vec<RunningSystem>>,
    commits: Subject<Rc<TransactionCommit>>,
    tick_counter: Cell<u64>,
    last_diagnostics: RefCell<TickDiagnostics>,
    config: DatabaseConfig,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("store", &self.store)
            .field("transactions", &self.transactions.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("schedule", &self.schedule)
            .field("tick", &self.tick_counter.get())
            .finish()
    }
}

fn joined<'a>(names: impl Iterator<Item = &'a String>) -> String {
    names.map(String::as_str).collect::<Vec<_>>().join(", ")
}

impl Database {
    /// Build a database with default configuration.
    pub fn create(plugin: &Plugin) -> Result<Self, DatabaseError> {
        Self::create_with_config(plugin, DatabaseConfig::default())
    }

    /// Build the store, compile the schedule, and create every system once,
    /// in schedule order.
    pub fn create_with_config(plugin: &Plugin, config: DatabaseConfig) -> Result<Self, DatabaseError> {
        let store = Store::new(plugin.store_schema(), config.store.clone())?;
        let schedule = Schedule::compile(
            plugin
                .systems()
                .iter()
                .map(|(name, declaration)| (name.as_str(), &declaration.schedule)),
        )?;

        let database = Self {
            store: Rc::new(RefCell::new(store)),
            transactions: plugin.transactions().clone(),
            actions: plugin.actions().clone(),
            schedule,
            systems: RefCell::new(Vec::new()),
            commits: Subject::new(),
            tick_counter: Cell::new(0),
            last_diagnostics: RefCell::new(TickDiagnostics::default()),
            config,
        };

        for name in database.schedule.order() {
            let Some(declaration) = plugin.systems().get(name) else {
                continue;
            };
            let run = (declaration.create)(&database).map_err(|reason| DatabaseError::System {
                name: name.clone(),
                reason,
            })?;
            database.systems.borrow_mut().push(RunningSystem {
                name: name.clone(),
                run,
            });
        }

        tracing::debug!(
            transactions = database.transactions.len(),
            actions = database.actions.len(),
            systems = database.schedule.len(),
            "database created"
        );
        Ok(database)
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Borrow the store for reading. Writes fail with
    /// [`DatabaseError::StoreBusy`] while the borrow is held.
    pub fn store(&self) -> Ref<'_, Store> {
        self.store.borrow()
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn component_schemas(&self) -> BTreeMap<String, Arc<Schema>> {
        self.store.borrow().schema().components.clone()
    }

    pub fn transaction_names(&self) -> impl Iterator<Item = &str> {
        self.transactions.keys().map(String::as_str)
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn resource(&self, name: &str) -> Option<Value> {
        self.store.borrow().resource(name).cloned()
    }

    pub fn get(&self, entity: Entity) -> Option<EntityValues> {
        self.store.borrow().get(entity)
    }

    pub fn get_component(&self, entity: Entity, component: &str) -> Option<Value> {
        self.store.borrow().get_component(entity, component)
    }

    // -- writes -------------------------------------------------------------

    /// Run `write` against the store as one unit and publish what it changed.
    ///
    /// A failed write is rolled back completely and publishes nothing.
    fn commit<R>(
        &self,
        name: &str,
        write: impl FnOnce(&mut Store) -> Result<R, DatabaseError>,
    ) -> Result<R, DatabaseError> {
        let (result, changes) = {
            let mut store = self
                .store
                .try_borrow_mut()
                .map_err(|_| DatabaseError::StoreBusy {
                    operation: name.to_owned(),
                })?;
            let result = store.atomically(write);
            (result, store.take_changes())
        };

        match &result {
            Ok(_) => {
                tracing::trace!(
                    transaction = name,
                    resources = changes.resources.len(),
                    entities = changes.entities.len(),
                    "commit"
                );
                self.commits.emit(Rc::new(TransactionCommit {
                    name: name.to_owned(),
                    changes,
                }));
            }
            Err(err) => tracing::debug!(transaction = name, error = %err, "write rolled back"),
        }
        result
    }

    fn transaction(&self, name: &str) -> Result<TransactionFn, DatabaseError> {
        self.transactions
            .get(name)
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownTransaction {
                name: name.to_owned(),
                registered: joined(self.transactions.keys()),
            })
    }

    /// Run the transaction `name` with `args`. Observers are notified once,
    /// after the whole body has run.
    pub fn transact(&self, name: &str, args: &Value) -> Result<Option<Entity>, DatabaseError> {
        let body = self.transaction(name)?;
        self.commit(name, |store| {
            body(store, args).map_err(|reason| DatabaseError::Transaction {
                name: name.to_owned(),
                reason,
            })
        })
    }

    /// Await `args`, then run the transaction `name` with the result.
    ///
    /// Nothing is written until the arguments resolve. An unknown name fails
    /// before `args` is polled.
    pub async fn transact_async<F>(&self, name: &str, args: F) -> Result<Option<Entity>, DatabaseError>
    where
        F: Future<Output = anyhow::Result<Value>>,
    {
        self.transaction(name)?;
        let args = args.await.map_err(|reason| DatabaseError::Arguments {
            name: name.to_owned(),
            reason,
        })?;
        self.transact(name, &args)
    }

    /// Run the action `name`. Actions write only through the database.
    pub fn action(&self, name: &str, args: &Value) -> Result<Value, DatabaseError> {
        let body = self
            .actions
            .get(name)
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownAction {
                name: name.to_owned(),
                registered: joined(self.actions.keys()),
            })?;
        body(self, args).map_err(|reason| DatabaseError::Action {
            name: name.to_owned(),
            reason,
        })
    }

    pub fn set_resource(&self, name: &str, value: Value) -> Result<(), DatabaseError> {
        self.commit("set_resource", |store| Ok(store.set_resource(name, value)?))
    }

    pub fn insert(&self, archetype: &str, values: &EntityValues) -> Result<Entity, DatabaseError> {
        self.commit("insert", |store| Ok(store.insert(archetype, values)?))
    }

    pub fn update(&self, entity: Entity, values: &EntityValues) -> Result<(), DatabaseError> {
        self.commit("update", |store| Ok(store.update(entity, values)?))
    }

    pub fn delete(&self, entity: Entity) -> Result<(), DatabaseError> {
        self.commit("delete", |store| Ok(store.delete(entity)?))
    }

    // -- snapshots ----------------------------------------------------------

    pub fn capture_snapshot(&self) -> StoreSnapshot {
        self.store.borrow().capture_snapshot()
    }

    /// Replace the store's contents with `snapshot`, publishing one commit.
    pub fn restore_snapshot(&self, snapshot: &StoreSnapshot) -> Result<(), DatabaseError> {
        self.commit("restore_snapshot", |store| Ok(store.restore_snapshot(snapshot)?))
    }

    pub fn state_hash(&self) -> String {
        self.store.borrow().state_hash()
    }

    pub fn to_json(&self) -> Value {
        self.store.borrow().to_json()
    }

    // -- ticks --------------------------------------------------------------

    /// Run every system once, in schedule order.
    ///
    /// The first failing system ends the tick; the tick counter advances only
    /// when every system succeeded.
    pub fn tick(&self) -> Result<(), DatabaseError> {
        let tick = self.tick_counter.get() + 1;
        let span = tracing::debug_span!("tick", tick);
        let _entered = span.enter();

        let started = Instant::now();
        let mut systems = std::mem::take(&mut *self.systems.borrow_mut());
        let mut system_times = Vec::with_capacity(systems.len());
        let mut outcome = Ok(());
        for system in &mut systems {
            let begun = Instant::now();
            let result = (system.run)(self);
            system_times.push((system.name.clone(), begun.elapsed()));
            if let Err(reason) = result {
                tracing::warn!(system = %system.name, error = %reason, "system failed");
                outcome = Err(DatabaseError::System {
                    name: system.name.clone(),
                    reason,
                });
                break;
            }
        }
        *self.systems.borrow_mut() = systems;

        if outcome.is_ok() {
            self.tick_counter.set(tick);
        }
        *self.last_diagnostics.borrow_mut() = TickDiagnostics {
            tick,
            system_times,
            total_time: started.elapsed(),
        };
        outcome
    }

    /// Run `count` ticks, stopping at the first failure.
    pub fn run_ticks(&self, count: u64) -> Result<(), DatabaseError> {
        for _ in 0..count {
            self.tick()?;
        }
        Ok(())
    }

    /// Number of ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_counter.get()
    }

    pub fn last_diagnostics(&self) -> TickDiagnostics {
        self.last_diagnostics.borrow().clone()
    }

    // -- observables --------------------------------------------------------

    /// Every commit, as it happens.
    pub fn observe_transactions(&self) -> Observe<Rc<TransactionCommit>> {
        self.commits.observe()
    }

    /// The value of resource `name`: the current value on subscribe, then
    /// each value a commit writes.
    pub fn observe_resource(&self, name: &str) -> Result<Observe<Value>, DatabaseError> {
        {
            let store = self.store.borrow();
            if store.resource(name).is_none() {
                return Err(EcsError::UnknownResource {
                    name: name.to_owned(),
                    registered: joined(store.resources().keys()),
                }
                .into());
            }
        }

        let store = self.store.clone();
        let commits = self.commits.clone();
        let name: Rc<str> = Rc::from(name);
        Ok(Observe::new(move |subscriber: Subscriber<Value>| {
            let (reader, watched, sink) = (store.clone(), name.clone(), subscriber.clone());
            let handle = commits.observe().subscribe(subscriber.forward(
                move |commit: Rc<TransactionCommit>| {
                    if !commit.changes.resources.contains(&*watched) {
                        return;
                    }
                    let value = reader.borrow().resource(&watched).cloned();
                    if let Some(value) = value {
                        sink.next(value);
                    }
                },
            ));
            let current = store.borrow().resource(&name).cloned();
            if let Some(current) = current {
                subscriber.next(current);
            }
            handle
        }))
    }

    /// The components of `entity`, or `None` once it is deleted. Delivers the
    /// current values on subscribe and again whenever they change.
    pub fn observe_entity(&self, entity: Entity) -> Observe<Option<EntityValues>> {
        let store = self.store.clone();
        let commits = self.commits.clone();
        let values = Observe::new(move |subscriber: Subscriber<Option<EntityValues>>| {
            let (reader, sink) = (store.clone(), subscriber.clone());
            let handle = commits.observe().subscribe(subscriber.forward(
                move |commit: Rc<TransactionCommit>| {
                    // Restores rewrite whole archetypes without naming entities.
                    if commit.changes.entities.contains(&entity)
                        || !commit.changes.archetypes.is_empty()
                    {
                        let values = reader.borrow().get(entity);
                        sink.next(values);
                    }
                },
            ));
            let current = store.borrow().get(entity);
            subscriber.next(current);
            handle
        });
        with_deduplicate_data(values)
    }

    /// A value computed from resources.
    ///
    /// `compute` runs on subscribe and again after each commit that wrote a
    /// resource it read during its previous run; other commits deliver
    /// nothing.
    pub fn observe_dependent_value<T, F>(&self, compute: F) -> Observe<T>
    where
        T: 'static,
        F: Fn(&ResourceReader<'_>) -> T + 'static,
    {
        let store = self.store.clone();
        let commits = self.commits.clone();
        let compute = Rc::new(compute);
        Observe::new(move |subscriber: Subscriber<T>| {
            let reads: Rc<RefCell<BTreeSet<String>>> = Rc::default();
            let evaluate = {
                let (store, compute, reads) = (store.clone(), compute.clone(), reads.clone());
                Rc::new(move || {
                    let store = store.borrow();
                    let reader = ResourceReader::new(&store);
                    let value = compute(&reader);
                    *reads.borrow_mut() = reader.into_reads();
                    value
                })
            };

            let (rerun, sink) = (evaluate.clone(), subscriber.clone());
            let handle = commits.observe().subscribe(subscriber.forward(
                move |commit: Rc<TransactionCommit>| {
                    let touched = commit
                        .changes
                        .touches_resources(reads.borrow().iter().map(String::as_str));
                    if touched {
                        sink.next(rerun());
                    }
                },
            ));
            subscriber.next(evaluate());
            handle
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
