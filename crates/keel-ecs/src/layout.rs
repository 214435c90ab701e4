//! Layout compiler: turns struct-shaped schemas into byte layouts.
//!
//! Every primitive occupies 4 bytes (`f32`, `i32`, `u32`, or a `u32`
//! boolean). A fixed-length array of 2 to 4 primitives is a *vector*; other
//! fixed-length arrays and objects are *structs* whose fields are placed in
//! declaration order, each at the running offset rounded up to the field's
//! own alignment.
//!
//! Two modes exist because the same schemas back both tightly packed storage
//! and GPU uniform buffers:
//!
//! | shape  | packed size / align | aligned size / align           |
//! |--------|---------------------|--------------------------------|
//! | scalar | 4 / 4               | 4 / 4                          |
//! | vec2   | 8 / 4               | 8 / 8                          |
//! | vec3   | 12 / 4              | 16 / 16 (offsets 0, 4, 8)      |
//! | vec4   | 16 / 4              | 16 / 16                        |
//! | struct | sum / max field     | rounded to max(field, 16)      |

use serde::{Deserialize, Serialize};

use crate::schema::{LayoutMode, Schema, SchemaKind};
use crate::LayoutError;

/// Byte size of every primitive.
pub const PRIMITIVE_SIZE: usize = 4;

/// Minimum struct alignment in [`LayoutMode::Aligned`].
const ALIGNED_STRUCT_ALIGN: usize = 16;

// ---------------------------------------------------------------------------
// Layout types
// ---------------------------------------------------------------------------

/// A 4-byte scalar stored in a struct buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    F32,
    I32,
    U32,
    /// Stored as a `u32` that is 0 or 1.
    Bool,
}

impl PrimitiveType {
    /// The primitive a schema maps to, if it is a scalar.
    pub fn of(schema: &Schema) -> Option<Self> {
        match schema.kind {
            SchemaKind::Number => Some(Self::F32),
            SchemaKind::Integer if schema.is_unsigned() => Some(Self::U32),
            SchemaKind::Integer => Some(Self::I32),
            SchemaKind::Boolean => Some(Self::Bool),
            _ => None,
        }
    }
}

/// Whether a layout came from an array or an object schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    Array,
    Object,
}

/// The type stored at a field offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldType {
    Primitive(PrimitiveType),
    Struct(Box<StructLayout>),
}

impl FieldType {
    pub fn size(&self) -> usize {
        match self {
            Self::Primitive(_) => PRIMITIVE_SIZE,
            Self::Struct(layout) => layout.size,
        }
    }

    pub fn align(&self) -> usize {
        match self {
            Self::Primitive(_) => PRIMITIVE_SIZE,
            Self::Struct(layout) => layout.align,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldLayout {
    /// Byte offset from the start of the enclosing struct.
    pub offset: usize,
    #[serde(rename = "type")]
    pub ty: FieldType,
}

/// The compiled byte layout of a struct-shaped schema.
///
/// For array layouts, fields are named `"0"`, `"1"`, ... in element order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructLayout {
    #[serde(rename = "type")]
    pub kind: LayoutKind,
    pub size: usize,
    pub align: usize,
    pub fields: Vec<(String, FieldLayout)>,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, layout)| layout)
    }

    /// Whether this is a vector: an array of 2 to 4 primitives.
    pub fn vector_element(&self) -> Option<(PrimitiveType, usize)> {
        if self.kind != LayoutKind::Array {
            return None;
        }
        let mut element = None;
        for (_, field) in &self.fields {
            match (&field.ty, element) {
                (FieldType::Primitive(p), None) => element = Some(*p),
                (FieldType::Primitive(p), Some(e)) if *p == e => {}
                _ => return None,
            }
        }
        element.map(|e| (e, self.fields.len()))
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Compute the byte layout of an object or fixed-length array schema.
pub fn compute_layout(schema: &Schema, mode: LayoutMode) -> Result<StructLayout, LayoutError> {
    match &schema.kind {
        SchemaKind::Object { properties } => struct_layout(properties, mode, "$"),
        SchemaKind::Array { .. } => array_layout(schema, mode, "$"),
        other => Err(LayoutError::NotAStruct {
            kind: other.name().to_owned(),
        }),
    }
}

fn field_type(schema: &Schema, mode: LayoutMode, path: &str) -> Result<FieldType, LayoutError> {
    if let Some(primitive) = PrimitiveType::of(schema) {
        return Ok(FieldType::Primitive(primitive));
    }
    match &schema.kind {
        SchemaKind::Object { properties } => Ok(FieldType::Struct(Box::new(struct_layout(
            properties, mode, path,
        )?))),
        SchemaKind::Array { .. } => Ok(FieldType::Struct(Box::new(array_layout(
            schema, mode, path,
        )?))),
        other => Err(LayoutError::UnsupportedType {
            path: path.to_owned(),
            kind: other.name().to_owned(),
        }),
    }
}

fn struct_layout(
    properties: &[(String, Schema)],
    mode: LayoutMode,
    path: &str,
) -> Result<StructLayout, LayoutError> {
    if properties.is_empty() {
        return Err(LayoutError::EmptyStruct {
            path: path.to_owned(),
        });
    }

    let mut fields = Vec::with_capacity(properties.len());
    let mut offset = 0;
    let mut max_align = PRIMITIVE_SIZE;
    for (name, schema) in properties {
        let ty = field_type(schema, mode, &format!("{path}.{name}"))?;
        let align = ty.align();
        offset = round_up(offset, align);
        let size = ty.size();
        fields.push((name.clone(), FieldLayout { offset, ty }));
        offset += size;
        max_align = max_align.max(align);
    }

    let align = match mode {
        LayoutMode::Aligned => max_align.max(ALIGNED_STRUCT_ALIGN),
        LayoutMode::Packed => max_align,
    };
    Ok(StructLayout {
        kind: LayoutKind::Object,
        size: round_up(offset, align),
        align,
        fields,
    })
}

fn array_layout(schema: &Schema, mode: LayoutMode, path: &str) -> Result<StructLayout, LayoutError> {
    let SchemaKind::Array { items, .. } = &schema.kind else {
        return Err(LayoutError::NotAStruct {
            kind: schema.kind.name().to_owned(),
        });
    };
    let len = schema
        .fixed_len()
        .ok_or_else(|| LayoutError::VariableLengthArray {
            path: path.to_owned(),
        })?;

    if let Some(primitive) = PrimitiveType::of(items) {
        if !(2..=4).contains(&len) {
            return Err(LayoutError::VectorLength {
                path: path.to_owned(),
                len,
            });
        }
        let packed = PRIMITIVE_SIZE * len;
        let (size, align) = match mode {
            LayoutMode::Aligned => {
                let padded = packed.next_power_of_two();
                (padded, padded)
            }
            LayoutMode::Packed => (packed, PRIMITIVE_SIZE),
        };
        let fields = (0..len)
            .map(|i| {
                (
                    i.to_string(),
                    FieldLayout {
                        offset: i * PRIMITIVE_SIZE,
                        ty: FieldType::Primitive(primitive),
                    },
                )
            })
            .collect();
        return Ok(StructLayout {
            kind: LayoutKind::Array,
            size,
            align,
            fields,
        });
    }

    if len == 0 {
        return Err(LayoutError::EmptyArray {
            path: path.to_owned(),
        });
    }
    let element = field_type(items, mode, &format!("{path}[]"))?;
    let align = match mode {
        LayoutMode::Aligned => element.align().max(ALIGNED_STRUCT_ALIGN),
        LayoutMode::Packed => element.align(),
    };
    let stride = round_up(element.size(), align);
    let fields = (0..len)
        .map(|i| {
            (
                i.to_string(),
                FieldLayout {
                    offset: i * stride,
                    ty: element.clone(),
                },
            )
        })
        .collect();
    Ok(StructLayout {
        kind: LayoutKind::Array,
        size: stride * len,
        align,
        fields,
    })
}

#[inline]
fn round_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(layout: &StructLayout) -> Vec<usize> {
        layout.fields.iter().map(|(_, f)| f.offset).collect()
    }

    fn nested(layout: &StructLayout, name: &str) -> StructLayout {
        match &layout.field(name).unwrap().ty {
            FieldType::Struct(inner) => (**inner).clone(),
            other => panic!("expected struct field, got {other:?}"),
        }
    }

    // -- scalar structs ------------------------------------------------------

    #[test]
    fn three_floats_round_to_sixteen_when_aligned() {
        let schema = Schema::object([
            ("a", Schema::number()),
            ("b", Schema::number()),
            ("c", Schema::number()),
        ]);
        let layout = compute_layout(&schema, LayoutMode::Aligned).unwrap();
        assert_eq!(layout.kind, LayoutKind::Object);
        assert_eq!(layout.size, 16);
        assert_eq!(offsets(&layout), vec![0, 4, 8]);

        let packed = compute_layout(&schema, LayoutMode::Packed).unwrap();
        assert_eq!(packed.size, 12);
        assert_eq!(offsets(&packed), vec![0, 4, 8]);
    }

    #[test]
    fn primitive_tags_follow_schema() {
        let schema = Schema::object([
            ("f", Schema::number()),
            ("i", Schema::integer()),
            ("u", Schema::unsigned()),
            ("b", Schema::boolean()),
        ]);
        let layout = compute_layout(&schema, LayoutMode::Packed).unwrap();
        let tags: Vec<FieldType> = layout.fields.iter().map(|(_, f)| f.ty.clone()).collect();
        assert_eq!(
            tags,
            vec![
                FieldType::Primitive(PrimitiveType::F32),
                FieldType::Primitive(PrimitiveType::I32),
                FieldType::Primitive(PrimitiveType::U32),
                FieldType::Primitive(PrimitiveType::Bool),
            ]
        );
    }

    // -- vectors -------------------------------------------------------------

    #[test]
    fn vec3_pads_to_vec4_when_aligned() {
        let layout = compute_layout(&Schema::vector(3), LayoutMode::Aligned).unwrap();
        assert_eq!(layout.kind, LayoutKind::Array);
        assert_eq!((layout.size, layout.align), (16, 16));
        assert_eq!(offsets(&layout), vec![0, 4, 8]);
        assert_eq!(layout.vector_element(), Some((PrimitiveType::F32, 3)));
    }

    #[test]
    fn vector_sizes_per_mode() {
        for (len, aligned, packed) in [(2, 8, 8), (3, 16, 12), (4, 16, 16)] {
            let schema = Schema::vector(len);
            assert_eq!(compute_layout(&schema, LayoutMode::Aligned).unwrap().size, aligned);
            assert_eq!(compute_layout(&schema, LayoutMode::Packed).unwrap().size, packed);
        }
    }

    #[test]
    fn vec2_after_scalar_is_aligned_to_eight() {
        let schema = Schema::object([("w", Schema::number()), ("uv", Schema::vector(2))]);
        let layout = compute_layout(&schema, LayoutMode::Aligned).unwrap();
        assert_eq!(offsets(&layout), vec![0, 8]);
        assert_eq!(layout.size, 16);
    }

    // -- nesting -------------------------------------------------------------

    #[test]
    fn nested_struct_is_placed_at_its_own_alignment() {
        let transform = Schema::object([
            ("position", Schema::vector(3)),
            ("scale", Schema::number()),
        ]);
        let schema = Schema::object([("transform", transform), ("id", Schema::unsigned())]);

        let layout = compute_layout(&schema, LayoutMode::Aligned).unwrap();
        let inner = nested(&layout, "transform");
        assert_eq!(inner.size, 32);
        assert_eq!(offsets(&inner), vec![0, 16]);
        assert_eq!(layout.field("id").unwrap().offset, 32);
        assert_eq!(layout.size, 48);
    }

    #[test]
    fn array_of_structs_uses_aligned_stride() {
        let point = Schema::object([("x", Schema::number()), ("y", Schema::number())]);
        let layout = compute_layout(&Schema::array(point, 2), LayoutMode::Aligned).unwrap();
        assert_eq!(layout.kind, LayoutKind::Array);
        assert_eq!(layout.size, 32);
        assert_eq!(offsets(&layout), vec![0, 16]);

        let point = Schema::object([("x", Schema::number()), ("y", Schema::number())]);
        let packed = compute_layout(&Schema::array(point, 2), LayoutMode::Packed).unwrap();
        assert_eq!(packed.size, 16);
        assert_eq!(offsets(&packed), vec![0, 8]);
    }

    // -- rejections ----------------------------------------------------------

    #[test]
    fn rejects_variable_length_arrays() {
        let err = compute_layout(&Schema::list(Schema::number()), LayoutMode::Aligned).unwrap_err();
        assert_eq!(err, LayoutError::VariableLengthArray { path: "$".into() });
    }

    #[test]
    fn rejects_string_members() {
        let schema = Schema::object([("name", Schema::string())]);
        let err = compute_layout(&schema, LayoutMode::Packed).unwrap_err();
        assert_eq!(
            err,
            LayoutError::UnsupportedType {
                path: "$.name".into(),
                kind: "string".into()
            }
        );
    }

    #[test]
    fn rejects_single_element_vectors() {
        let err = compute_layout(&Schema::vector(1), LayoutMode::Aligned).unwrap_err();
        assert_eq!(err, LayoutError::VectorLength { path: "$".into(), len: 1 });
        assert!(compute_layout(&Schema::vector(5), LayoutMode::Aligned).is_err());
    }

    #[test]
    fn rejects_scalars_at_the_root() {
        assert_eq!(
            compute_layout(&Schema::number(), LayoutMode::Packed).unwrap_err(),
            LayoutError::NotAStruct { kind: "number".into() }
        );
    }
}
