//! System scheduling: ordering constraints compiled into one execution order.
//!
//! Each system may declare that it runs `before` or `after` other systems, or
//! `during` another system. `during: X` brackets the system between two
//! synthetic markers that belong to `X`: the start marker precedes `X` and
//! everything running during it, the end marker follows them. Systems ordered
//! `after X` then wait for the whole span, and systems ordered `before X`
//! precede it.
//!
//! Constraints naming a system that is not declared are ignored with a
//! warning, so plugins can order themselves against optional peers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::ScheduleCycleError;

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// One kind of ordering constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Before,
    After,
    During,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Relation::Before => "before",
            Relation::After => "after",
            Relation::During => "during",
        })
    }
}

/// Ordering constraints of one system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSchedule {
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub during: Vec<String>,
}

impl SystemSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, system: impl Into<String>) -> Self {
        self.before.push(system.into());
        self
    }

    pub fn after(mut self, system: impl Into<String>) -> Self {
        self.after.push(system.into());
        self
    }

    pub fn during(mut self, system: impl Into<String>) -> Self {
        self.during.push(system.into());
        self
    }

    /// Every `(relation, target)` pair.
    pub fn constraints(&self) -> impl Iterator<Item = (Relation, &str)> + '_ {
        fn tagged(relation: Relation, names: &[String]) -> impl Iterator<Item = (Relation, &str)> + '_ {
            names.iter().map(move |n| (relation, n.as_str()))
        }
        tagged(Relation::Before, &self.before)
            .chain(tagged(Relation::After, &self.after))
            .chain(tagged(Relation::During, &self.during))
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty() && self.during.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Topological sort
// ---------------------------------------------------------------------------

/// Order `nodes` so that for every edge `(from, to)`, `from` comes first.
///
/// Among nodes that are ready, the most recently readied one runs next; ties
/// at the start resolve in input order. Edges naming a node that is not in
/// `nodes` are ignored. Duplicate nodes are kept once.
///
/// Fails with the first node, in input order, left on an unresolved cycle.
pub fn topological_sort<N>(nodes: &[N], edges: &[(N, N)]) -> Result<Vec<N>, ScheduleCycleError>
where
    N: Clone + Eq + Hash + fmt::Display,
{
    let mut index: HashMap<&N, usize> = HashMap::with_capacity(nodes.len());
    let mut unique: Vec<&N> = Vec::with_capacity(nodes.len());
    for node in nodes {
        index.entry(node).or_insert_with(|| {
            unique.push(node);
            unique.len() - 1
        });
    }

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); unique.len()];
    let mut pending: Vec<usize> = vec![0; unique.len()];
    for (from, to) in edges {
        if let (Some(&a), Some(&b)) = (index.get(from), index.get(to)) {
            successors[a].push(b);
            pending[b] += 1;
        }
    }

    let mut ready: Vec<usize> = (0..unique.len()).rev().filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(unique.len());
    while let Some(i) = ready.pop() {
        order.push(unique[i].clone());
        for &next in &successors[i] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(next);
            }
        }
    }

    if order.len() < unique.len() {
        let stuck = (0..unique.len()).find(|&i| pending[i] > 0).unwrap_or(0);
        return Err(ScheduleCycleError {
            node: unique[stuck].to_string(),
        });
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// A node of the scheduling graph. Markers display as the system owning them,
/// so a cycle through a span is reported under that system's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    System(String),
    Start(String),
    End(String),
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::System(name) | Node::Start(name) | Node::End(name) => f.write_str(name),
        }
    }
}

/// The compiled execution order of a set of systems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    order: Vec<String>,
}

impl Schedule {
    /// Compile `systems` into an order satisfying every constraint.
    pub fn compile<'a, I>(systems: I) -> Result<Self, ScheduleCycleError>
    where
        I: IntoIterator<Item = (&'a str, &'a SystemSchedule)>,
    {
        let systems: Vec<(&str, &SystemSchedule)> = systems.into_iter().collect();
        let declared: BTreeSet<&str> = systems.iter().map(|(name, _)| *name).collect();

        // Systems that something runs during get a start/end span.
        let spans: BTreeSet<&str> = systems
            .iter()
            .flat_map(|(_, s)| s.during.iter().map(String::as_str))
            .filter(|target| declared.contains(target))
            .collect();

        let first = |name: &str| {
            if spans.contains(name) {
                Node::Start(name.to_owned())
            } else {
                Node::System(name.to_owned())
            }
        };
        let last = |name: &str| {
            if spans.contains(name) {
                Node::End(name.to_owned())
            } else {
                Node::System(name.to_owned())
            }
        };

        let mut nodes = Vec::with_capacity(systems.len() + spans.len() * 2);
        let mut edges = Vec::new();
        for (name, _) in &systems {
            nodes.push(Node::System((*name).to_owned()));
        }
        for name in &spans {
            nodes.push(Node::Start((*name).to_owned()));
            nodes.push(Node::End((*name).to_owned()));
            edges.push((Node::Start((*name).to_owned()), Node::System((*name).to_owned())));
            edges.push((Node::System((*name).to_owned()), Node::End((*name).to_owned())));
        }

        for (name, schedule) in &systems {
            for (relation, target) in schedule.constraints() {
                if !declared.contains(target) {
                    tracing::warn!(
                        system = %name,
                        %relation,
                        constraint = target,
                        "schedule constraint names an undeclared system; ignored"
                    );
                    continue;
                }
                match relation {
                    Relation::Before => edges.push((last(*name), first(target))),
                    Relation::After => edges.push((last(target), first(*name))),
                    Relation::During => {
                        edges.push((Node::Start(target.to_owned()), first(*name)));
                        edges.push((last(*name), Node::End(target.to_owned())));
                    }
                }
            }
        }

        let order: Vec<String> = topological_sort(&nodes, &edges)?
            .into_iter()
            .filter_map(|node| match node {
                Node::System(name) => Some(name),
                Node::Start(_) | Node::End(_) => None,
            })
            .collect();

        tracing::debug!(order = ?order, "schedule compiled");
        Ok(Self { order })
    }

    /// System names in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of `system` in the order.
    pub fn position(&self, system: &str) -> Option<usize> {
        self.order.iter().position(|s| s == system)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
