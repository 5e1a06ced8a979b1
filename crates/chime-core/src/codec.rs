//! Conversion between JSON documents and typed values.
//!
//! Non-primitive values travel in envelope form `{"typename": N, "value": V}`.
//! The server envelope-encodes non-primitive returns; the client decodes the
//! envelope symmetrically. Primitives stay bare.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    /// An envelope named a type that is not registered.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A JSON value could not be coerced to the requested type.
    #[error("cannot convert {got} to {want}")]
    Unconvertible {
        /// JSON type of the offending value.
        got: String,
        /// Wire name of the requested type.
        want: String,
    },

    /// A typed value has no JSON representation.
    #[error("value cannot be encoded: {0}")]
    Unencodable(String),
}

/// Tag describing a declared parameter or return type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    /// No value (return type of procedures).
    Void,
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// Unsigned 64-bit integer.
    UInt,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    Str,
    /// Heterogeneous list.
    List,
    /// String-keyed map.
    Map,
    /// A registered user-defined type, carried in envelope form.
    Named(String),
}

impl TypeTag {
    /// Canonical name used in wire signatures.
    #[must_use]
    pub fn wire_name(&self) -> &str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::Str => "string",
            Self::List => "list",
            Self::Map => "map",
            Self::Named(name) => name,
        }
    }
}

/// A typed value as handled by services and the correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Float.
    Float(f64),
    /// String.
    Str(String),
    /// List of values.
    List(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// A value of a registered user-defined type.
    Named {
        /// Registered type name.
        typename: String,
        /// Underlying value (a map or a string).
        value: Box<Value>,
    },
}

impl Value {
    /// Short name of the value's kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Named { .. } => "named",
        }
    }

    /// Boolean content, if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Signed integer content of `Int` or an in-range `UInt`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Unsigned integer content of `UInt` or a non-negative `Int`.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(n) => Some(*n),
            Self::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Float content of any numeric value.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(n) => Some(*n as f64),
            Self::UInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// String content, if this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

/// Underlying shape a registered named type takes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedShape {
    /// The value part of the envelope is a map.
    Map,
    /// The value part of the envelope is a string.
    Str,
}

/// Registry of user-defined type names known to one peer.
///
/// Both the client and the server own a registry; an envelope naming an
/// unregistered type is unconvertible on the typed decode path.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, NamedShape>,
}

impl TypeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named type. Re-registering the same name is a no-op.
    pub fn register(&mut self, name: impl Into<String>, shape: NamedShape) {
        let name = name.into();
        if let Some(existing) = self.types.get(&name) {
            if *existing != shape {
                tracing::warn!("type '{}' already registered with a different shape", name);
            }
            return;
        }
        self.types.insert(name, shape);
    }

    /// Look up the declared shape of a named type.
    #[must_use]
    pub fn shape_of(&self, name: &str) -> Option<NamedShape> {
        self.types.get(name).copied()
    }
}

/// Returns the envelope members `(typename, value)` when `json` is in
/// envelope form.
fn as_envelope(json: &serde_json::Value) -> Option<(&str, &serde_json::Value)> {
    let obj = json.as_object()?;
    let typename = obj.get("typename")?.as_str()?;
    let value = obj.get("value")?;
    Some((typename, value))
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn unconvertible(json: &serde_json::Value, want: &TypeTag) -> CodecError {
    CodecError::Unconvertible {
        got: json_kind(json).to_string(),
        want: want.wire_name().to_string(),
    }
}

/// Decode `json` against a declared type tag.
///
/// Envelope form is recognised first: the named type must be registered, and
/// when the target itself is a named type the names must agree. Raw JSON is
/// coerced with natural mappings and range checks.
///
/// # Errors
///
/// Returns [`CodecError::UnknownType`] for an envelope naming an unregistered
/// type and [`CodecError::Unconvertible`] when coercion fails.
pub fn decode(
    json: &serde_json::Value,
    target: &TypeTag,
    registry: &TypeRegistry,
) -> Result<Value, CodecError> {
    if let Some((typename, inner)) = as_envelope(json) {
        let shape = registry
            .shape_of(typename)
            .ok_or_else(|| CodecError::UnknownType(typename.to_string()))?;
        if let TypeTag::Named(want) = target {
            if want != typename {
                return Err(unconvertible(json, target));
            }
        } else {
            return Err(unconvertible(json, target));
        }
        return decode_named(typename, inner, shape, registry);
    }

    match target {
        TypeTag::Void => match json {
            serde_json::Value::Null => Ok(Value::Null),
            _ => Err(unconvertible(json, target)),
        },
        TypeTag::Bool => json
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| unconvertible(json, target)),
        TypeTag::Int => decode_int(json).ok_or_else(|| unconvertible(json, target)),
        TypeTag::UInt => decode_uint(json).ok_or_else(|| unconvertible(json, target)),
        TypeTag::Float => json
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| unconvertible(json, target)),
        TypeTag::Str => json
            .as_str()
            .map(|s| Value::Str(s.to_string()))
            .ok_or_else(|| unconvertible(json, target)),
        TypeTag::List => match json {
            serde_json::Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| decode_any(item, registry))
                    .collect();
                Ok(Value::List(items))
            }
            _ => Err(unconvertible(json, target)),
        },
        TypeTag::Map => match json {
            serde_json::Value::Object(members) => Ok(Value::Map(decode_members(members, registry))),
            _ => Err(unconvertible(json, target)),
        },
        TypeTag::Named(name) => {
            // Bare (non-envelope) JSON against a named target: accept the
            // declared underlying shape directly.
            let shape = registry
                .shape_of(name)
                .ok_or_else(|| CodecError::UnknownType(name.clone()))?;
            decode_named(name, json, shape, registry)
        }
    }
}

fn decode_named(
    typename: &str,
    inner: &serde_json::Value,
    shape: NamedShape,
    registry: &TypeRegistry,
) -> Result<Value, CodecError> {
    let value = match (shape, inner) {
        (NamedShape::Map, serde_json::Value::Object(members)) => {
            Value::Map(decode_members(members, registry))
        }
        (NamedShape::Str, serde_json::Value::String(s)) => Value::Str(s.clone()),
        _ => {
            return Err(unconvertible(inner, &TypeTag::Named(typename.to_string())));
        }
    };
    Ok(Value::Named {
        typename: typename.to_string(),
        value: Box::new(value),
    })
}

fn decode_int(json: &serde_json::Value) -> Option<Value> {
    if let Some(n) = json.as_i64() {
        return Some(Value::Int(n));
    }
    // Integral floats coerce, matching number -> int with range checks.
    let f = json.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        #[allow(clippy::cast_possible_truncation)]
        return Some(Value::Int(f as i64));
    }
    None
}

fn decode_uint(json: &serde_json::Value) -> Option<Value> {
    if let Some(n) = json.as_u64() {
        return Some(Value::UInt(n));
    }
    let f = json.as_f64()?;
    if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        return Some(Value::UInt(f as u64));
    }
    None
}

fn decode_members(
    members: &serde_json::Map<String, serde_json::Value>,
    registry: &TypeRegistry,
) -> BTreeMap<String, Value> {
    members
        .iter()
        .map(|(key, val)| (key.clone(), decode_any(val, registry)))
        .collect()
}

/// Decode `json` without a declared target type.
///
/// Used for notification parameters and untyped results. Envelopes naming a
/// registered type decode to [`Value::Named`]; envelopes naming an unknown
/// type degrade gracefully to the raw map rather than failing, so a peer can
/// still observe a result it has no local type for.
#[must_use]
pub fn decode_any(json: &serde_json::Value, registry: &TypeRegistry) -> Value {
    if let Some((typename, inner)) = as_envelope(json) {
        if let Some(shape) = registry.shape_of(typename) {
            if let Ok(named) = decode_named(typename, inner, shape, registry) {
                return named;
            }
        }
    }

    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            Value::List(items.iter().map(|item| decode_any(item, registry)).collect())
        }
        serde_json::Value::Object(members) => Value::Map(decode_members(members, registry)),
    }
}

/// Encode a typed value as JSON.
///
/// Named values produce the envelope form; the enveloped value must render as
/// a map, a list, or a string (preferred in that order).
///
/// # Errors
///
/// Returns [`CodecError::Unencodable`] for values with no JSON representation
/// (non-finite floats, named values wrapping a bare primitive).
pub fn encode(value: &Value) -> Result<serde_json::Value, CodecError> {
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(json!(b)),
        Value::Int(n) => Ok(json!(n)),
        Value::UInt(n) => Ok(json!(n)),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| CodecError::Unencodable(format!("non-finite float {f}"))),
        Value::Str(s) => Ok(json!(s)),
        Value::List(items) => {
            let items: Result<Vec<_>, _> = items.iter().map(encode).collect();
            Ok(serde_json::Value::Array(items?))
        }
        Value::Map(members) => {
            let mut obj = serde_json::Map::new();
            for (key, val) in members {
                obj.insert(key.clone(), encode(val)?);
            }
            Ok(serde_json::Value::Object(obj))
        }
        Value::Named { typename, value } => {
            let inner = encode(value)?;
            if !matches!(
                inner,
                serde_json::Value::Object(_)
                    | serde_json::Value::Array(_)
                    | serde_json::Value::String(_)
            ) {
                return Err(CodecError::Unencodable(format!(
                    "named type '{typename}' wraps a {}, expected map, list, or string",
                    value.kind()
                )));
            }
            Ok(json!({ "typename": typename, "value": inner }))
        }
    }
}

/// Encode a return value against its declared type.
///
/// When the declared return type is named and the value is not already in
/// named form, the envelope is applied here; everything else encodes bare.
///
/// # Errors
///
/// Propagates [`CodecError::Unencodable`] from [`encode`].
pub fn encode_return(value: &Value, declared: &TypeTag) -> Result<serde_json::Value, CodecError> {
    match (declared, value) {
        (TypeTag::Named(_), Value::Named { .. }) => encode(value),
        (TypeTag::Named(name), other) => encode(&Value::Named {
            typename: name.clone(),
            value: Box::new(other.clone()),
        }),
        _ => encode(value),
    }
}

/// Encode a positional parameter list as a JSON array.
///
/// # Errors
///
/// Propagates [`CodecError::Unencodable`] from [`encode`].
pub fn encode_params(params: &[Value]) -> Result<serde_json::Value, CodecError> {
    let items: Result<Vec<_>, _> = params.iter().map(encode).collect();
    Ok(serde_json::Value::Array(items?))
}
