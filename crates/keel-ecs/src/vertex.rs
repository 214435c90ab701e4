//! GPU vertex buffer layouts derived from struct schemas.
//!
//! Each top-level field of a struct schema becomes one vertex attribute:
//! scalars map to `float32` / `sint32` / `uint32`, vectors to their `xN`
//! variants. Attribute offsets and the array stride come straight from the
//! compiled [`StructLayout`](crate::layout::StructLayout), so a struct buffer's
//! bytes can be uploaded unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::layout::{compute_layout, FieldType, PrimitiveType};
use crate::schema::{LayoutMode, Schema};
use crate::LayoutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
}

impl VertexFormat {
    fn of(primitive: PrimitiveType, count: usize) -> Option<Self> {
        use VertexFormat::*;
        let formats = match primitive {
            PrimitiveType::F32 => [Float32, Float32x2, Float32x3, Float32x4],
            PrimitiveType::I32 => [Sint32, Sint32x2, Sint32x3, Sint32x4],
            PrimitiveType::U32 | PrimitiveType::Bool => [Uint32, Uint32x2, Uint32x3, Uint32x4],
        };
        count.checked_sub(1).and_then(|i| formats.get(i)).copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexAttribute {
    pub format: VertexFormat,
    pub offset: usize,
    pub shader_location: u32,
}

/// A vertex buffer descriptor ready for pipeline creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexBufferLayout {
    pub array_stride: usize,
    pub step_mode: StepMode,
    /// Sorted by shader location.
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VertexLayoutOptions {
    /// Overrides the schema's own `layout`. Packed when neither is set.
    pub layout: Option<LayoutMode>,
    /// Explicit shader locations by field name. Fields without one are
    /// numbered 0, 1, 2, ... in declaration order.
    pub shader_locations: BTreeMap<String, u32>,
    pub step_mode: StepMode,
}

/// Derive a vertex buffer layout from a struct schema.
pub fn vertex_buffer_layout(
    schema: &Schema,
    options: &VertexLayoutOptions,
) -> Result<VertexBufferLayout, LayoutError> {
    let mode = options.layout.or(schema.layout).unwrap_or_default();
    let layout = compute_layout(schema, mode)?;

    let mut attributes = Vec::with_capacity(layout.fields.len());
    let mut next_location = 0;
    for (name, field) in &layout.fields {
        let format = match &field.ty {
            FieldType::Primitive(p) => VertexFormat::of(*p, 1),
            FieldType::Struct(inner) => inner
                .vector_element()
                .and_then(|(p, count)| VertexFormat::of(p, count)),
        }
        .ok_or_else(|| LayoutError::UnsupportedVertexField {
            field: name.clone(),
            reason: "only scalars and 2 to 4 element vectors are vertex attributes".to_owned(),
        })?;

        let shader_location = match options.shader_locations.get(name) {
            Some(&location) => location,
            None => {
                next_location += 1;
                next_location - 1
            }
        };
        attributes.push(VertexAttribute {
            format,
            offset: field.offset,
            shader_location,
        });
    }
    attributes.sort_by_key(|a| a.shader_location);

    Ok(VertexBufferLayout {
        array_stride: layout.size,
        step_mode: options.step_mode,
        attributes,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
