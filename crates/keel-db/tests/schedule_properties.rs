//! Property tests for schedule compilation.
//!
//! Random acyclic constraint sets must compile to an order honoring every
//! edge; adding the reverse of any edge must be reported as a cycle.

use std::collections::BTreeMap;

use keel_db::prelude::*;
use proptest::prelude::*;

fn name(i: usize) -> String {
    format!("s{i:02}")
}

/// Edges `(i, j)` with `i < j`, so the graph is acyclic.
fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2..12usize).prop_flat_map(|n| {
        let edge = (0..n - 1).prop_flat_map(move |i| (Just(i), i + 1..n));
        (Just(n), prop::collection::vec(edge, 0..24))
    })
}

/// Express each edge either as `after` on the later system or `before` on
/// the earlier one.
fn declarations(
    n: usize,
    edges: &[(usize, usize)],
    use_before: &[bool],
) -> BTreeMap<String, SystemSchedule> {
    let mut systems: BTreeMap<String, SystemSchedule> =
        (0..n).map(|i| (name(i), SystemSchedule::new())).collect();
    for (k, &(i, j)) in edges.iter().enumerate() {
        if use_before.get(k).copied().unwrap_or(false) {
            if let Some(s) = systems.get_mut(&name(i)) {
                s.before.push(name(j));
            }
        } else if let Some(s) = systems.get_mut(&name(j)) {
            s.after.push(name(i));
        }
    }
    systems
}

fn compile(systems: &BTreeMap<String, SystemSchedule>) -> Result<Schedule, ScheduleCycleError> {
    Schedule::compile(systems.iter().map(|(n, s)| (n.as_str(), s)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn order_respects_every_edge(
        (n, edges) in dag(),
        use_before in prop::collection::vec(any::<bool>(), 24),
    ) {
        let schedule = compile(&declarations(n, &edges, &use_before)).unwrap();
        prop_assert_eq!(schedule.len(), n);
        for (i, j) in &edges {
            let (a, b) = (schedule.position(&name(*i)), schedule.position(&name(*j)));
            prop_assert!(a < b, "{} must run before {}", name(*i), name(*j));
        }
    }

    #[test]
    fn reversed_edge_is_a_cycle(
        (n, edges) in dag(),
        pick in any::<prop::sample::Index>(),
    ) {
        prop_assume!(!edges.is_empty());
        let (i, j) = edges[pick.index(edges.len())];
        let mut systems = declarations(n, &edges, &[]);
        if let Some(s) = systems.get_mut(&name(i)) {
            s.after.push(name(j));
        }
        let err = compile(&systems).unwrap_err();
        prop_assert!(systems.contains_key(&err.node));
    }

    #[test]
    fn unknown_targets_never_fail(
        (n, edges) in dag(),
        ghost in 100..200usize,
    ) {
        let mut systems = declarations(n, &edges, &[]);
        if let Some(s) = systems.get_mut(&name(0)) {
            s.after.push(name(ghost));
            s.during.push(name(ghost));
        }
        prop_assert!(compile(&systems).is_ok());
    }
}

#[test]
fn chain_then_closing_edge() {
    let chain = [
        ("a", SystemSchedule::new()),
        ("b", SystemSchedule::new().after("a")),
        ("c", SystemSchedule::new().after("b")),
    ];
    let schedule = Schedule::compile(chain.iter().map(|(n, s)| (*n, s))).unwrap();
    assert_eq!(schedule.order(), ["a", "b", "c"]);

    let cyclic = [
        ("a", SystemSchedule::new().after("c")),
        ("b", SystemSchedule::new().after("a")),
        ("c", SystemSchedule::new().after("b")),
    ];
    let err = Schedule::compile(cyclic.iter().map(|(n, s)| (*n, s))).unwrap_err();
    assert!(["a", "b", "c"].contains(&err.node.as_str()));
}
