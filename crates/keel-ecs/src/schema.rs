//! Declarative value schemas.
//!
//! A [`Schema`] describes the shape of a component, resource, or nested field:
//! a primitive (`number`, `integer`, `boolean`, `string`), a fixed or
//! variable length array, or an object with ordered properties. Schemas are
//! shared as `Arc<Schema>`; two plugins agree on a component only when they
//! hold the *same* `Arc` (see [`same_schema`]), never merely equal ones.
//!
//! The serialized form follows the JSON-schema vocabulary
//! (`{"type": "array", "items": ..., "minItems": 3, "maxItems": 3}`), so
//! schemas can be loaded from configuration files.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ValueMismatch;

// ---------------------------------------------------------------------------
// LayoutMode
// ---------------------------------------------------------------------------

/// How a struct-shaped schema is laid out in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    /// Fields back to back at their natural size and alignment.
    #[default]
    Packed,
    /// GPU uniform-buffer rules: vec3 padded to vec4, structs rounded to 16 bytes.
    #[serde(rename = "std140")]
    Aligned,
}

// ---------------------------------------------------------------------------
// SchemaKind
// ---------------------------------------------------------------------------

/// The structural part of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchemaKind {
    /// Any JSON value. Only storable in array buffers.
    Any,
    Number,
    Integer,
    Boolean,
    String,
    Array {
        items: Box<Schema>,
        #[serde(default, rename = "minItems", skip_serializing_if = "Option::is_none")]
        min_items: Option<usize>,
        #[serde(default, rename = "maxItems", skip_serializing_if = "Option::is_none")]
        max_items: Option<usize>,
    },
    Object {
        /// Properties in declaration order. Layout follows this order.
        #[serde(with = "ordered_properties")]
        properties: Vec<(String, Schema)>,
    },
}

/// `properties` as a JSON-schema map, keeping declaration order both ways.
mod ordered_properties {
    use std::fmt;

    use serde::de::{Error, MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    use super::Schema;

    pub fn serialize<S: Serializer>(
        properties: &[(String, Schema)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(properties.len()))?;
        for (name, schema) in properties {
            map.serialize_entry(name, schema)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Schema)>, D::Error> {
        struct PropertiesVisitor;

        impl<'de> Visitor<'de> for PropertiesVisitor {
            type Value = Vec<(String, Schema)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from property name to schema")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut properties: Vec<(String, Schema)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, schema)) = access.next_entry::<String, Schema>()? {
                    if properties.iter().any(|(existing, _)| *existing == name) {
                        return Err(A::Error::custom(format!("duplicate property '{name}'")));
                    }
                    properties.push((name, schema));
                }
                Ok(properties)
            }
        }

        deserializer.deserialize_map(PropertiesVisitor)
    }
}

impl SchemaKind {
    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Array { .. } => "array",
            Self::Object { .. } => "object",
        }
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// A recursive description of a value's shape plus storage annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(flatten)]
    pub kind: SchemaKind,
    /// Initial value for resources and omitted archetype components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Byte layout used when the schema is stored in a struct buffer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutMode>,
    /// Transient resources are reset to their default instead of snapshotted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
    /// Every value of this schema equals this constant.
    #[serde(default, rename = "const", skip_serializing_if = "Option::is_none")]
    pub constant: Option<Value>,
    /// Inclusive lower bound for numeric schemas. `integer` with a
    /// non-negative minimum is stored unsigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
}

impl Schema {
    fn of(kind: SchemaKind) -> Self {
        Self {
            kind,
            default: None,
            layout: None,
            transient: false,
            constant: None,
            minimum: None,
        }
    }

    pub fn any() -> Self {
        Self::of(SchemaKind::Any)
    }

    pub fn number() -> Self {
        Self::of(SchemaKind::Number)
    }

    pub fn integer() -> Self {
        Self::of(SchemaKind::Integer)
    }

    /// An integer with `minimum: 0`, stored as `u32`.
    pub fn unsigned() -> Self {
        Self::integer().with_minimum(0.0)
    }

    pub fn boolean() -> Self {
        Self::of(SchemaKind::Boolean)
    }

    pub fn string() -> Self {
        Self::of(SchemaKind::String)
    }

    /// A fixed-length array of `len` items.
    pub fn array(items: Schema, len: usize) -> Self {
        Self::of(SchemaKind::Array {
            items: Box::new(items),
            min_items: Some(len),
            max_items: Some(len),
        })
    }

    /// An array without a fixed length. Never struct-layoutable.
    pub fn list(items: Schema) -> Self {
        Self::of(SchemaKind::Array {
            items: Box::new(items),
            min_items: None,
            max_items: None,
        })
    }

    /// A `len`-element vector of 32-bit floats.
    pub fn vector(len: usize) -> Self {
        Self::array(Self::number(), len)
    }

    /// An object whose properties are laid out in the given order.
    pub fn object<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        Self::of(SchemaKind::Object {
            properties: properties
                .into_iter()
                .map(|(name, schema)| (name.into(), schema))
                .collect(),
        })
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_layout(mut self, layout: LayoutMode) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Pin every value of this schema to `value`.
    pub fn constant(mut self, value: Value) -> Self {
        self.constant = Some(value);
        self
    }

    /// Wrap in an `Arc` so the schema can be shared by identity.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    // -- introspection ------------------------------------------------------

    /// Length of a fixed-length array (`minItems == maxItems`).
    pub fn fixed_len(&self) -> Option<usize> {
        match &self.kind {
            SchemaKind::Array {
                min_items: Some(min),
                max_items: Some(max),
                ..
            } if min == max => Some(*min),
            _ => None,
        }
    }

    /// Whether an `integer` schema is constrained to non-negative values.
    pub fn is_unsigned(&self) -> bool {
        matches!(self.kind, SchemaKind::Integer) && self.minimum.is_some_and(|m| m >= 0.0)
    }

    /// Look up a nested schema by property name (objects) or element index
    /// (arrays).
    pub fn property(&self, name: &str) -> Option<&Schema> {
        match &self.kind {
            SchemaKind::Object { properties } => properties
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, schema)| schema),
            SchemaKind::Array { items, .. } => {
                let index: usize = name.parse().ok()?;
                match self.fixed_len() {
                    Some(len) if index >= len => None,
                    _ => Some(items),
                }
            }
            _ => None,
        }
    }

    /// The explicitly declared initial value, if any.
    pub fn explicit_default(&self) -> Option<Value> {
        self.default.clone().or_else(|| self.constant.clone())
    }

    /// The explicit default, or the natural zero value for the shape.
    pub fn default_value(&self) -> Value {
        self.explicit_default().unwrap_or_else(|| self.zero_value())
    }

    /// The natural zero value: `0`, `false`, `""`, zero-filled arrays and
    /// objects, `null` for `any` and variable-length arrays become `[]`.
    pub fn zero_value(&self) -> Value {
        match &self.kind {
            SchemaKind::Any => Value::Null,
            SchemaKind::Number | SchemaKind::Integer => Value::from(0),
            SchemaKind::Boolean => Value::Bool(false),
            SchemaKind::String => Value::String(String::new()),
            SchemaKind::Array { items, .. } => {
                let len = self.fixed_len().unwrap_or(0);
                Value::Array((0..len).map(|_| items.default_value()).collect())
            }
            SchemaKind::Object { properties } => Value::Object(
                properties
                    .iter()
                    .map(|(name, schema)| (name.clone(), schema.default_value()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    // -- validation ---------------------------------------------------------

    /// Check that `value` matches this schema.
    pub fn validate(&self, value: &Value) -> Result<(), ValueMismatch> {
        self.validate_at("$", value)
    }

    fn validate_at(&self, path: &str, value: &Value) -> Result<(), ValueMismatch> {
        let mismatch = |expected: String| ValueMismatch {
            path: path.to_owned(),
            expected,
            found: describe_json(value),
        };

        if let Some(constant) = &self.constant {
            if constant != value {
                return Err(mismatch(format!("constant {constant}")));
            }
            return Ok(());
        }

        match &self.kind {
            SchemaKind::Any => {}
            SchemaKind::Number => {
                let n = value.as_f64().ok_or_else(|| mismatch("number".to_owned()))?;
                self.check_minimum(n, mismatch)?;
            }
            SchemaKind::Integer => {
                let n = json_to_i64(value).ok_or_else(|| mismatch("integer".to_owned()))?;
                self.check_minimum(n as f64, mismatch)?;
            }
            SchemaKind::Boolean => {
                if !value.is_boolean() {
                    return Err(mismatch("boolean".to_owned()));
                }
            }
            SchemaKind::String => {
                if !value.is_string() {
                    return Err(mismatch("string".to_owned()));
                }
            }
            SchemaKind::Array {
                items,
                min_items,
                max_items,
            } => {
                let elements = value
                    .as_array()
                    .ok_or_else(|| mismatch("array".to_owned()))?;
                let too_short = min_items.is_some_and(|min| elements.len() < min);
                let too_long = max_items.is_some_and(|max| elements.len() > max);
                if too_short || too_long {
                    return Err(mismatch(match (min_items, max_items) {
                        (Some(min), Some(max)) if min == max => format!("array of length {min}"),
                        (min, max) => format!(
                            "array with length in [{}, {}]",
                            min.unwrap_or(0),
                            max.map_or_else(|| "inf".to_owned(), |m| m.to_string())
                        ),
                    }));
                }
                for (i, element) in elements.iter().enumerate() {
                    items.validate_at(&format!("{path}[{i}]"), element)?;
                }
            }
            SchemaKind::Object { properties } => {
                let object = value
                    .as_object()
                    .ok_or_else(|| mismatch("object".to_owned()))?;
                for (name, schema) in properties {
                    let child_path = format!("{path}.{name}");
                    match object.get(name) {
                        Some(child) => schema.validate_at(&child_path, child)?,
                        None => {
                            return Err(ValueMismatch {
                                path: child_path,
                                expected: schema.kind.name().to_owned(),
                                found: "nothing".to_owned(),
                            })
                        }
                    }
                }
                if let Some(extra) = object
                    .keys()
                    .find(|key| !properties.iter().any(|(name, _)| name == *key))
                {
                    return Err(ValueMismatch {
                        path: format!("{path}.{extra}"),
                        expected: "no such property".to_owned(),
                        found: describe_json(&object[extra]),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_minimum(
        &self,
        n: f64,
        mismatch: impl FnOnce(String) -> ValueMismatch,
    ) -> Result<(), ValueMismatch> {
        match self.minimum {
            Some(min) if n < min => Err(mismatch(format!("{} >= {min}", self.kind.name()))),
            _ => Ok(()),
        }
    }
}

/// Whether two shared schemas are the same object (not merely equal).
#[inline]
pub fn same_schema(a: &Arc<Schema>, b: &Arc<Schema>) -> bool {
    Arc::ptr_eq(a, b)
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Describe a JSON value for error messages (`number 3`, `string "x"`, ...).
pub fn describe_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {s:?}"),
        Value::Array(a) => format!("array of length {}", a.len()),
        Value::Object(_) => "object".to_owned(),
    }
}

/// Read an integer from JSON, accepting integral floats such as `3.0`.
pub fn json_to_i64(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    (f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER).then_some(f as i64)
}

/// 2^53: integers beyond this are not exactly representable as `f64`.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Convert a float to JSON the way a JavaScript number prints: integral
/// values become JSON integers so `1.0` and `1` compare equal after a
/// round-trip through storage.
pub fn number_to_json(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
