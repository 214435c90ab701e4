//! Typed buffers: the column storage behind every component.
//!
//! A [`TypedBuffer`] holds `len` valid elements in a backing store of
//! `capacity >= len` slots. Reads and writes are bounds-checked against
//! `len`. Growth is geometric and capped by the configured maximum length.
//!
//! [`create_typed_buffer`] chooses the most compact representation a schema
//! allows:
//!
//! - constant schemas get a [`ConstBuffer`] with no per-element storage,
//! - `number` / `integer` get a [`NumberBuffer`] of `f64`, `i32`, or `u32`,
//! - struct-shaped schemas get a [`StructBuffer`] laid out by
//!   [`compute_layout`],
//! - everything else falls back to an [`ArrayBuffer`] of JSON values.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::layout::{compute_layout, FieldType, LayoutKind, PrimitiveType, StructLayout};
use crate::schema::{describe_json, json_to_i64, number_to_json, Schema, SchemaKind};
use crate::store::StoreConfig;
use crate::{BufferError, LayoutError, ValueMismatch};

// ---------------------------------------------------------------------------
// TypedBuffer trait
// ---------------------------------------------------------------------------

/// Which specialization backs a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Number,
    Struct,
    Const,
    Array,
}

/// A growable, bounds-checked column of schema-typed values.
pub trait TypedBuffer: fmt::Debug + Send + Sync {
    fn kind(&self) -> BufferKind;

    /// Number of valid elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements the backing store holds without reallocating.
    fn capacity(&self) -> usize;

    /// Set the number of valid elements. Slots exposed by growing read as
    /// the zero value.
    fn resize(&mut self, len: usize) -> Result<(), BufferError>;

    fn get(&self, index: usize) -> Result<Value, BufferError>;

    fn set(&mut self, index: usize, value: &Value) -> Result<(), BufferError>;

    /// Copy elements `[start, end)` to `target`. Overlapping ranges are safe.
    fn copy_within(&mut self, target: usize, start: usize, end: usize) -> Result<(), BufferError>;

    /// Raw little-endian bytes of the valid elements, for buffers that have
    /// a binary representation.
    fn as_bytes(&self) -> Option<&[u8]>;

    /// An independent copy of this buffer.
    fn clone_box(&self) -> Box<dyn TypedBuffer>;

    fn iter(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        Box::new((0..self.len()).filter_map(move |i| self.get(i).ok()))
    }
}

/// Create the buffer best suited to `schema`.
///
/// A struct-shaped schema without a `layout` annotation uses packed layout;
/// if it cannot be laid out at all it falls back to an [`ArrayBuffer`]. When
/// the schema explicitly asks for a layout, a failure is returned instead.
pub fn create_typed_buffer(
    schema: &Arc<Schema>,
    config: &StoreConfig,
) -> Result<Box<dyn TypedBuffer>, LayoutError> {
    if let Some(constant) = &schema.constant {
        return Ok(Box::new(ConstBuffer::new(constant.clone(), config)));
    }
    match schema.kind {
        SchemaKind::Number => return Ok(Box::new(NumberBuffer::<f64>::new(config))),
        SchemaKind::Integer if schema.is_unsigned() => {
            return Ok(Box::new(NumberBuffer::<u32>::new(config)))
        }
        SchemaKind::Integer => return Ok(Box::new(NumberBuffer::<i32>::new(config))),
        _ => {}
    }

    match compute_layout(schema, schema.layout.unwrap_or_default()) {
        Ok(layout) => Ok(Box::new(StructBuffer::new(schema.clone(), layout, config))),
        Err(err) if schema.layout.is_some() => Err(err),
        Err(reason) => {
            tracing::trace!(kind = schema.kind.name(), %reason, "using array buffer");
            Ok(Box::new(ArrayBuffer::new(schema.clone(), config)))
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Capacity after growing from `current` to hold at least `needed` elements.
fn grown_capacity(
    current: usize,
    needed: usize,
    config: &StoreConfig,
) -> Result<usize, BufferError> {
    if needed > config.max_length {
        return Err(BufferError::CapacityExceeded {
            requested: needed,
            max: config.max_length,
        });
    }
    if needed <= current {
        return Ok(current);
    }
    let doubled = current.saturating_mul(2).max(config.initial_capacity);
    Ok(doubled.max(needed).min(config.max_length))
}

fn check_index(index: usize, len: usize) -> Result<(), BufferError> {
    if index < len {
        Ok(())
    } else {
        Err(BufferError::OutOfRange { index, len })
    }
}

fn check_range(target: usize, start: usize, end: usize, len: usize) -> Result<(), BufferError> {
    if end > len {
        return Err(BufferError::OutOfRange { index: end, len });
    }
    if start > end {
        return Err(BufferError::OutOfRange { index: start, len: end });
    }
    let last = target
        .checked_add(end - start)
        .ok_or(BufferError::OutOfRange { index: target, len })?;
    if last > len {
        return Err(BufferError::OutOfRange { index: last, len });
    }
    Ok(())
}

fn mismatch(expected: &str, value: &Value) -> BufferError {
    BufferError::InvalidValue(ValueMismatch {
        path: "$".to_owned(),
        expected: expected.to_owned(),
        found: describe_json(value),
    })
}

// ---------------------------------------------------------------------------
// NumberBuffer
// ---------------------------------------------------------------------------

/// A scalar that a [`NumberBuffer`] stores directly.
pub trait Scalar: bytemuck::Pod + fmt::Debug + Send + Sync {
    const NAME: &'static str;

    fn from_json(value: &Value) -> Option<Self>;

    fn to_json(self) -> Value;
}

impl Scalar for f64 {
    const NAME: &'static str = "number";

    fn from_json(value: &Value) -> Option<Self> {
        value.as_f64()
    }

    fn to_json(self) -> Value {
        number_to_json(self)
    }
}

impl Scalar for i32 {
    const NAME: &'static str = "integer";

    fn from_json(value: &Value) -> Option<Self> {
        json_to_i64(value).and_then(|n| i32::try_from(n).ok())
    }

    fn to_json(self) -> Value {
        Value::from(self)
    }
}

impl Scalar for u32 {
    const NAME: &'static str = "unsigned integer";

    fn from_json(value: &Value) -> Option<Self> {
        json_to_i64(value).and_then(|n| u32::try_from(n).ok())
    }

    fn to_json(self) -> Value {
        Value::from(self)
    }
}

/// Scalars stored contiguously.
#[derive(Debug, Clone)]
pub struct NumberBuffer<T: Scalar> {
    data: Vec<T>,
    len: usize,
    config: StoreConfig,
}

impl<T: Scalar> NumberBuffer<T> {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            data: Vec::new(),
            len: 0,
            config: config.clone(),
        }
    }

    /// The valid elements as a typed slice.
    pub fn as_slice(&self) -> &[T] {
        &self.data[..self.len]
    }
}

impl<T: Scalar> TypedBuffer for NumberBuffer<T> {
    fn kind(&self) -> BufferKind {
        BufferKind::Number
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn resize(&mut self, len: usize) -> Result<(), BufferError> {
        let capacity = grown_capacity(self.data.len(), len, &self.config)?;
        if capacity > self.data.len() {
            tracing::trace!(from = self.data.len(), to = capacity, ty = T::NAME, "grow buffer");
            self.data.resize(capacity, T::zeroed());
        }
        if len > self.len {
            self.data[self.len..len].fill(T::zeroed());
        }
        self.len = len;
        Ok(())
    }

    fn get(&self, index: usize) -> Result<Value, BufferError> {
        check_index(index, self.len)?;
        Ok(self.data[index].to_json())
    }

    fn set(&mut self, index: usize, value: &Value) -> Result<(), BufferError> {
        check_index(index, self.len)?;
        self.data[index] = T::from_json(value).ok_or_else(|| mismatch(T::NAME, value))?;
        Ok(())
    }

    fn copy_within(&mut self, target: usize, start: usize, end: usize) -> Result<(), BufferError> {
        check_range(target, start, end, self.len)?;
        self.data.copy_within(start..end, target);
        Ok(())
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        Some(bytemuck::cast_slice(self.as_slice()))
    }

    fn clone_box(&self) -> Box<dyn TypedBuffer> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// StructBuffer
// ---------------------------------------------------------------------------

/// One [`StructLayout`]-sized block of bytes per element.
#[derive(Debug, Clone)]
pub struct StructBuffer {
    schema: Arc<Schema>,
    layout: StructLayout,
    bytes: Vec<u8>,
    len: usize,
    capacity: usize,
    config: StoreConfig,
}

impl StructBuffer {
    pub fn new(schema: Arc<Schema>, layout: StructLayout, config: &StoreConfig) -> Self {
        Self {
            schema,
            layout,
            bytes: Vec::new(),
            len: 0,
            capacity: 0,
            config: config.clone(),
        }
    }

    pub fn layout(&self) -> &StructLayout {
        &self.layout
    }

    /// Bytes between consecutive elements.
    pub fn stride(&self) -> usize {
        self.layout.size
    }

    fn element(&self, index: usize) -> &[u8] {
        let stride = self.stride();
        &self.bytes[index * stride..(index + 1) * stride]
    }

    fn element_mut(&mut self, index: usize) -> &mut [u8] {
        let stride = self.stride();
        &mut self.bytes[index * stride..(index + 1) * stride]
    }

    /// Read one top-level field of element `index`.
    pub fn field(&self, index: usize, name: &str) -> Result<Value, BufferError> {
        check_index(index, self.len)?;
        let field = self
            .layout
            .field(name)
            .ok_or_else(|| BufferError::UnknownField { name: name.to_owned() })?;
        Ok(decode_field(self.element(index), field.offset, &field.ty))
    }

    /// Write one top-level field of element `index`.
    pub fn set_field(&mut self, index: usize, name: &str, value: &Value) -> Result<(), BufferError> {
        check_index(index, self.len)?;
        let schema = self
            .schema
            .property(name)
            .ok_or_else(|| BufferError::UnknownField { name: name.to_owned() })?;
        schema.validate(value)?;
        let field = self
            .layout
            .field(name)
            .ok_or_else(|| BufferError::UnknownField { name: name.to_owned() })?;
        let mut scratch = self.element(index).to_vec();
        encode_field(&mut scratch, field.offset, &field.ty, value)?;
        self.element_mut(index).copy_from_slice(&scratch);
        Ok(())
    }
}

impl TypedBuffer for StructBuffer {
    fn kind(&self) -> BufferKind {
        BufferKind::Struct
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn resize(&mut self, len: usize) -> Result<(), BufferError> {
        let capacity = grown_capacity(self.capacity, len, &self.config)?;
        let stride = self.stride();
        if capacity > self.capacity {
            tracing::trace!(from = self.capacity, to = capacity, stride, "grow struct buffer");
            self.bytes.resize(capacity * stride, 0);
            self.capacity = capacity;
        }
        if len > self.len {
            self.bytes[self.len * stride..len * stride].fill(0);
        }
        self.len = len;
        Ok(())
    }

    fn get(&self, index: usize) -> Result<Value, BufferError> {
        check_index(index, self.len)?;
        Ok(decode_struct(self.element(index), 0, &self.layout))
    }

    fn set(&mut self, index: usize, value: &Value) -> Result<(), BufferError> {
        check_index(index, self.len)?;
        self.schema.validate(value)?;
        let mut scratch = self.element(index).to_vec();
        encode_struct(&mut scratch, 0, &self.layout, value)?;
        self.element_mut(index).copy_from_slice(&scratch);
        Ok(())
    }

    fn copy_within(&mut self, target: usize, start: usize, end: usize) -> Result<(), BufferError> {
        check_range(target, start, end, self.len)?;
        let stride = self.stride();
        self.bytes
            .copy_within(start * stride..end * stride, target * stride);
        Ok(())
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        Some(&self.bytes[..self.len * self.stride()])
    }

    fn clone_box(&self) -> Box<dyn TypedBuffer> {
        Box::new(self.clone())
    }
}

fn field_value<'a>(value: &'a Value, kind: LayoutKind, name: &str) -> Option<&'a Value> {
    match kind {
        LayoutKind::Object => value.get(name),
        LayoutKind::Array => name.parse::<usize>().ok().and_then(|i| value.get(i)),
    }
}

fn decode_struct(bytes: &[u8], base: usize, layout: &StructLayout) -> Value {
    let fields = layout
        .fields
        .iter()
        .map(|(name, field)| (name, decode_field(bytes, base + field.offset, &field.ty)));
    match layout.kind {
        LayoutKind::Object => Value::Object(fields.map(|(n, v)| (n.clone(), v)).collect()),
        LayoutKind::Array => Value::Array(fields.map(|(_, v)| v).collect()),
    }
}

fn decode_field(bytes: &[u8], offset: usize, ty: &FieldType) -> Value {
    match ty {
        FieldType::Struct(layout) => decode_struct(bytes, offset, layout),
        FieldType::Primitive(primitive) => {
            let word = &bytes[offset..offset + 4];
            match primitive {
                PrimitiveType::F32 => {
                    number_to_json(f64::from(bytemuck::pod_read_unaligned::<f32>(word)))
                }
                PrimitiveType::I32 => Value::from(bytemuck::pod_read_unaligned::<i32>(word)),
                PrimitiveType::U32 => Value::from(bytemuck::pod_read_unaligned::<u32>(word)),
                PrimitiveType::Bool => Value::Bool(bytemuck::pod_read_unaligned::<u32>(word) != 0),
            }
        }
    }
}

fn encode_struct(
    bytes: &mut [u8],
    base: usize,
    layout: &StructLayout,
    value: &Value,
) -> Result<(), BufferError> {
    for (name, field) in &layout.fields {
        let child = field_value(value, layout.kind, name).unwrap_or(&Value::Null);
        encode_field(bytes, base + field.offset, &field.ty, child)?;
    }
    Ok(())
}

/// Write one field. Values the primitive cannot hold exactly (integers out
/// of range, floats that overflow `f32`) are rejected, not truncated.
fn encode_field(bytes: &mut [u8], offset: usize, ty: &FieldType, value: &Value) -> Result<(), BufferError> {
    let primitive = match ty {
        FieldType::Struct(layout) => return encode_struct(bytes, offset, layout, value),
        FieldType::Primitive(primitive) => primitive,
    };
    let word: [u8; 4] = match primitive {
        PrimitiveType::F32 => {
            let f = value
                .as_f64()
                .map(|f| f as f32)
                .filter(|f| f.is_finite())
                .ok_or_else(|| mismatch("finite 32-bit float", value))?;
            bytemuck::cast(f)
        }
        PrimitiveType::I32 => {
            let i = json_to_i64(value)
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| mismatch("32-bit integer", value))?;
            bytemuck::cast(i)
        }
        PrimitiveType::U32 => {
            let u = json_to_i64(value)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| mismatch("unsigned 32-bit integer", value))?;
            bytemuck::cast(u)
        }
        PrimitiveType::Bool => {
            let b = value.as_bool().ok_or_else(|| mismatch("boolean", value))?;
            bytemuck::cast(u32::from(b))
        }
    };
    bytes[offset..offset + 4].copy_from_slice(&word);
    Ok(())
}

// ---------------------------------------------------------------------------
// ConstBuffer
// ---------------------------------------------------------------------------

/// Every element is the same value; nothing is stored per element.
#[derive(Debug, Clone)]
pub struct ConstBuffer {
    value: Value,
    len: usize,
    config: StoreConfig,
}

impl ConstBuffer {
    pub fn new(value: Value, config: &StoreConfig) -> Self {
        Self {
            value,
            len: 0,
            config: config.clone(),
        }
    }
}

impl TypedBuffer for ConstBuffer {
    fn kind(&self) -> BufferKind {
        BufferKind::Const
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.config.max_length
    }

    fn resize(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.config.max_length {
            return Err(BufferError::CapacityExceeded {
                requested: len,
                max: self.config.max_length,
            });
        }
        self.len = len;
        Ok(())
    }

    fn get(&self, index: usize) -> Result<Value, BufferError> {
        check_index(index, self.len)?;
        Ok(self.value.clone())
    }

    /// Accepts only the constant itself.
    fn set(&mut self, index: usize, value: &Value) -> Result<(), BufferError> {
        check_index(index, self.len)?;
        if *value != self.value {
            return Err(mismatch(&format!("constant {}", self.value), value));
        }
        Ok(())
    }

    fn copy_within(&mut self, target: usize, start: usize, end: usize) -> Result<(), BufferError> {
        check_range(target, start, end, self.len)
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        None
    }

    fn clone_box(&self) -> Box<dyn TypedBuffer> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// ArrayBuffer
// ---------------------------------------------------------------------------

/// Generic fallback: one JSON value per element.
#[derive(Debug, Clone)]
pub struct ArrayBuffer {
    schema: Arc<Schema>,
    items: Vec<Value>,
    len: usize,
    config: StoreConfig,
}

impl ArrayBuffer {
    pub fn new(schema: Arc<Schema>, config: &StoreConfig) -> Self {
        Self {
            schema,
            items: Vec::new(),
            len: 0,
            config: config.clone(),
        }
    }
}

impl TypedBuffer for ArrayBuffer {
    fn kind(&self) -> BufferKind {
        BufferKind::Array
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.items.len()
    }

    fn resize(&mut self, len: usize) -> Result<(), BufferError> {
        let capacity = grown_capacity(self.items.len(), len, &self.config)?;
        if capacity > self.items.len() {
            self.items.resize(capacity, Value::Null);
        }
        if len > self.len {
            let zero = self.schema.zero_value();
            self.items[self.len..len].fill(zero);
        }
        if len < self.len {
            self.items[len..self.len].fill(Value::Null);
        }
        self.len = len;
        Ok(())
    }

    fn get(&self, index: usize) -> Result<Value, BufferError> {
        check_index(index, self.len)?;
        Ok(self.items[index].clone())
    }

    fn set(&mut self, index: usize, value: &Value) -> Result<(), BufferError> {
        check_index(index, self.len)?;
        self.schema.validate(value)?;
        self.items[index] = value.clone();
        Ok(())
    }

    fn copy_within(&mut self, target: usize, start: usize, end: usize) -> Result<(), BufferError> {
        check_range(target, start, end, self.len)?;
        let moved = self.items[start..end].to_vec();
        self.items[target..target + moved.len()].clone_from_slice(&moved);
        Ok(())
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        None
    }

    fn clone_box(&self) -> Box<dyn TypedBuffer> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
