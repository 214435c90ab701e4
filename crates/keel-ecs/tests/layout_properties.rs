//! Property tests for the layout compiler.
//!
//! Random nested struct schemas are compiled in both modes and checked for
//! the invariants every consumer of a layout relies on.

use keel_ecs::layout::{FieldType, StructLayout};
use keel_ecs::prelude::*;
use proptest::prelude::*;

fn scalar() -> impl Strategy<Value = Schema> {
    prop_oneof![
        Just(Schema::number()),
        Just(Schema::integer()),
        Just(Schema::unsigned()),
        Just(Schema::boolean()),
    ]
}

fn member() -> impl Strategy<Value = Schema> {
    let leaf = prop_oneof![
        scalar(),
        (scalar(), 2..=4usize).prop_map(|(item, len)| Schema::array(item, len)),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..5).prop_map(|fields| {
                Schema::object(
                    fields
                        .into_iter()
                        .enumerate()
                        .map(|(i, schema)| (format!("f{i}"), schema)),
                )
            }),
            (
                prop::collection::vec(inner, 1..3).prop_map(|fields| {
                    Schema::object(
                        fields
                            .into_iter()
                            .enumerate()
                            .map(|(i, schema)| (format!("e{i}"), schema)),
                    )
                }),
                1..4usize
            )
                .prop_map(|(element, len)| Schema::array(element, len)),
        ]
    })
}

fn struct_schema() -> impl Strategy<Value = Schema> {
    prop::collection::vec(member(), 1..6).prop_map(|fields| {
        Schema::object(
            fields
                .into_iter()
                .enumerate()
                .map(|(i, schema)| (format!("m{i}"), schema)),
        )
    })
}

/// Check size rounding and non-overlap, recursing into nested structs.
fn check(layout: &StructLayout, mode: LayoutMode) -> Result<(), TestCaseError> {
    let max_align = layout
        .fields
        .iter()
        .map(|(_, f)| f.ty.align())
        .max()
        .unwrap_or(4);
    prop_assert_eq!(layout.size % max_align, 0);
    if mode == LayoutMode::Aligned && layout.vector_element().is_none() {
        prop_assert_eq!(layout.size % 16, 0);
    }

    let mut ranges: Vec<(usize, usize)> = layout
        .fields
        .iter()
        .map(|(_, f)| (f.offset, f.offset + f.ty.size()))
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        prop_assert!(pair[0].1 <= pair[1].0, "fields overlap: {:?}", pair);
    }
    if let Some(&(_, end)) = ranges.last() {
        prop_assert!(end <= layout.size);
    }

    for (_, field) in &layout.fields {
        prop_assert_eq!(field.offset % field.ty.align(), 0);
        if let FieldType::Struct(inner) = &field.ty {
            check(inner, mode)?;
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1_000))]

    #[test]
    fn compiled_layouts_are_well_formed(schema in struct_schema()) {
        for mode in [LayoutMode::Packed, LayoutMode::Aligned] {
            let layout = compute_layout(&schema, mode).unwrap();
            check(&layout, mode)?;
        }
    }

    #[test]
    fn packed_never_exceeds_aligned(schema in struct_schema()) {
        let packed = compute_layout(&schema, LayoutMode::Packed).unwrap();
        let aligned = compute_layout(&schema, LayoutMode::Aligned).unwrap();
        prop_assert!(packed.size <= aligned.size);
    }

    #[test]
    fn struct_buffers_roundtrip_zero_values(schema in struct_schema()) {
        let shared = schema.clone().with_layout(LayoutMode::Aligned).shared();
        let mut buffer = create_typed_buffer(&shared, &StoreConfig::default()).unwrap();
        buffer.resize(1).unwrap();
        prop_assert_eq!(buffer.get(0).unwrap(), schema.zero_value());
        buffer.set(0, &schema.zero_value()).unwrap();
        prop_assert_eq!(buffer.as_bytes().unwrap().len(), compute_layout(&schema, LayoutMode::Aligned).unwrap().size);
    }
}

#[test]
fn vec3_aligned_has_padding_slot() {
    let layout = compute_layout(&Schema::vector(3), LayoutMode::Aligned).unwrap();
    assert_eq!(layout.size, 16);
    let offsets: Vec<usize> = layout.fields.iter().map(|(_, f)| f.offset).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
}
