//! Property tests for plugin merging.
//!
//! Plugins are drawn from a shared pool of declarations so that overlapping
//! structural keys are identical by construction. Merging must then be
//! associative, commutative on structural sections, and last-wins on
//! behavioral ones. A fresh declaration under a shared key must conflict.

use std::rc::Rc;
use std::sync::Arc;

use keel_db::prelude::*;
use proptest::prelude::*;
use serde_json::json;

const COMPONENTS: [&str; 5] = ["position", "velocity", "mass", "color", "tag"];
const RESOURCES: [&str; 3] = ["gravity", "time", "seed"];
const ACTIONS: [&str; 3] = ["reset", "pause", "spawn"];

/// One declaration per key, shared by every plugin built from it.
struct Pool {
    components: Vec<Arc<Schema>>,
    resources: Vec<Arc<Schema>>,
}

impl Pool {
    fn new() -> Self {
        Self {
            components: COMPONENTS.iter().map(|_| Schema::number().shared()).collect(),
            resources: RESOURCES
                .iter()
                .map(|_| Schema::number().with_default(json!(0)).shared())
                .collect(),
        }
    }

    /// A plugin declaring the keys selected by the bit masks. Actions are
    /// always fresh closures tagged with `id`.
    fn plugin(&self, shape: &PluginShape, id: usize) -> Plugin {
        let mut builder = Plugin::builder();
        for (i, name) in COMPONENTS.iter().enumerate() {
            if shape.components & (1 << i) != 0 {
                builder = builder.component(*name, self.components[i].clone());
            }
        }
        for (i, name) in RESOURCES.iter().enumerate() {
            if shape.resources & (1 << i) != 0 {
                builder = builder.resource(*name, self.resources[i].clone());
            }
        }
        for (i, name) in ACTIONS.iter().enumerate() {
            if shape.actions & (1 << i) != 0 {
                builder = builder.action(*name, move |_, _| Ok(json!(id)));
            }
        }
        builder.build().unwrap()
    }
}

#[derive(Debug, Clone)]
struct PluginShape {
    components: u8,
    resources: u8,
    actions: u8,
}

fn plugin_shape() -> impl Strategy<Value = PluginShape> {
    (0..32u8, 0..8u8, 0..8u8).prop_map(|(components, resources, actions)| PluginShape {
        components,
        resources,
        actions,
    })
}

/// Same keys and the very same declarations in every section.
fn assert_same(a: &Plugin, b: &Plugin) {
    assert_eq!(a.keys(Section::Components), b.keys(Section::Components));
    assert_eq!(a.keys(Section::Resources), b.keys(Section::Resources));
    assert_eq!(a.keys(Section::Actions), b.keys(Section::Actions));
    for (key, schema) in a.components() {
        assert!(Arc::ptr_eq(schema, &b.components()[key]));
    }
    for (key, schema) in a.resources() {
        assert!(Arc::ptr_eq(schema, &b.resources()[key]));
    }
    for (key, action) in a.actions() {
        assert!(Rc::ptr_eq(action, &b.actions()[key]));
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn combine_is_associative(a in plugin_shape(), b in plugin_shape(), c in plugin_shape()) {
        let pool = Pool::new();
        let (a, b, c) = (pool.plugin(&a, 0), pool.plugin(&b, 1), pool.plugin(&c, 2));

        let flat = combine(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let left = combine(&[combine(&[a.clone(), b.clone()]).unwrap(), c.clone()]).unwrap();
        let right = combine(&[a, combine(&[b, c]).unwrap()]).unwrap();

        assert_same(&flat, &left);
        assert_same(&flat, &right);
    }

    #[test]
    fn structural_sections_commute(a in plugin_shape(), b in plugin_shape()) {
        let pool = Pool::new();
        let (a, b) = (pool.plugin(&a, 0), pool.plugin(&b, 1));

        let ab = combine(&[a.clone(), b.clone()]).unwrap();
        let ba = combine(&[b, a]).unwrap();

        prop_assert_eq!(ab.keys(Section::Components), ba.keys(Section::Components));
        prop_assert_eq!(ab.keys(Section::Resources), ba.keys(Section::Resources));
        for (key, schema) in ab.components() {
            prop_assert!(Arc::ptr_eq(schema, &ba.components()[key]));
        }
    }

    #[test]
    fn later_plugins_win_behavioral_keys(a in plugin_shape(), b in plugin_shape()) {
        let pool = Pool::new();
        let (a, b) = (pool.plugin(&a, 0), pool.plugin(&b, 1));
        let merged = combine(&[a.clone(), b.clone()]).unwrap();

        for (key, action) in merged.actions() {
            let expected = b.actions().get(key).or_else(|| a.actions().get(key)).unwrap();
            prop_assert!(Rc::ptr_eq(action, expected));
        }
    }

    #[test]
    fn fresh_declaration_under_shared_key_conflicts(
        a in plugin_shape(),
        key in 0..COMPONENTS.len(),
    ) {
        let pool = Pool::new();
        let mut shape = a;
        shape.components |= 1 << key;
        let original = pool.plugin(&shape, 0);
        let redefined = Plugin::builder()
            .component(COMPONENTS[key], Schema::number().shared())
            .build()
            .unwrap();

        let err = combine(&[original, redefined]).unwrap_err();
        prop_assert_eq!(err.section, Section::Components);
        prop_assert_eq!(err.key, COMPONENTS[key]);
    }
}

// ---------------------------------------------------------------------------
// Examples
// ---------------------------------------------------------------------------

#[test]
fn same_schema_object_merges_and_distinct_one_conflicts() {
    let shared = Schema::vector(3).shared();
    let a = Plugin::builder().component("position", shared.clone()).build().unwrap();
    let b = Plugin::builder().component("position", shared.clone()).build().unwrap();
    assert!(combine(&[a.clone(), b]).is_ok());

    let c = Plugin::builder().component("position", Schema::vector(3).shared()).build().unwrap();
    let err = combine(&[a, c]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "plugin conflict: components.position must be the identical declaration across plugins"
    );
    assert!(err.section.is_structural());
}

#[test]
fn extended_plugins_share_archetype_declarations() {
    let base = Plugin::builder()
        .component("mass", Schema::number().shared())
        .archetype("Body", ["mass"])
        .build()
        .unwrap();
    let left = Plugin::builder().extends(&base).build().unwrap();
    let right = Plugin::builder()
        .extends(&base)
        .shared_archetype("Rock", base.archetypes()["Body"].clone())
        .build()
        .unwrap();

    let merged = combine(&[left, right]).unwrap();
    assert_eq!(merged.keys(Section::Archetypes), ["Body", "Rock"]);
    let db = Database::create(&merged).unwrap();
    assert_eq!(db.store().archetypes().count(), 2);
}
