//! Core types for the object store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable identity of a tracked instance.
///
/// Every tracking set and the identity cache are keyed by this value, never by
/// memory address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    /// Fresh random identity.
    pub fn new() -> Self {
        ObjectId(Uuid::new_v4())
    }

    /// Fixed identity, mostly useful for tests and fixtures.
    pub const fn from_u128(value: u128) -> Self {
        ObjectId(Uuid::from_u128(value))
    }

    /// Parse from the hyphenated string form.
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(ObjectId(Uuid::parse_str(s)?))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Small integer standing in for a domain type on disk and on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag(pub i32);

impl TypeTag {
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        TypeTag(i32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a persisted record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub tag: TypeTag,
    pub id: ObjectId,
}

impl ObjectKey {
    pub fn new(tag: TypeTag, id: ObjectId) -> Self {
        Self { tag, id }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tag, self.id)
    }
}

/// Content digest of an encoded record (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Compute digest from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Digest(arr))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Scalar data persisted inline with a record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Id(ObjectId),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Id(_) => "id",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::Id(v)
    }
}

/// Conversion between a Rust field type and a [`Value`].
///
/// Implemented for the scalar types a domain entity may expose as a plain
/// property, and for `Option` of any of them (`None` maps to [`Value::Null`]).
pub trait PlainValue: Sized {
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch(expected: &'static str, found: &Value) -> StoreError {
    StoreError::ValueMismatch {
        expected,
        found: found.kind_name(),
    }
}

impl PlainValue for Value {
    fn into_value(self) -> Value {
        self
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl PlainValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl PlainValue for i64 {
    fn into_value(self) -> Value {
        Value::Int(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(v) => Ok(v),
            other => Err(mismatch("int", &other)),
        }
    }
}

impl PlainValue for i32 {
    fn into_value(self) -> Value {
        Value::Int(self as i64)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(v) => i32::try_from(v).map_err(|_| StoreError::ValueMismatch {
                expected: "int (32-bit)",
                found: "int (out of range)",
            }),
            other => Err(mismatch("int", &other)),
        }
    }
}

impl PlainValue for f64 {
    fn into_value(self) -> Value {
        Value::Float(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            other => Err(mismatch("float", &other)),
        }
    }
}

impl PlainValue for String {
    fn into_value(self) -> Value {
        Value::Text(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(v) => Ok(v),
            other => Err(mismatch("text", &other)),
        }
    }
}

impl PlainValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(v) => Ok(v),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl PlainValue for ObjectId {
    fn into_value(self) -> Value {
        Value::Id(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Id(v) => Ok(v),
            other => Err(mismatch("id", &other)),
        }
    }
}

impl<T: PlainValue> PlainValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// How a property participates in the object graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Scalar data persisted inline.
    Plain,
    /// A single nested tracked instance.
    Reference,
    /// An ordered collection of tracked instances.
    Association,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyKind::Plain => "plain",
            PropertyKind::Reference => "reference",
            PropertyKind::Association => "association",
        };
        f.write_str(name)
    }
}

/// The current value of one property, shaped by its kind.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Plain(Value),
    Reference(Option<ObjectId>),
    Association(Vec<ObjectId>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Plain(_) => PropertyKind::Plain,
            PropertyValue::Reference(_) => PropertyKind::Reference,
            PropertyValue::Association(_) => PropertyKind::Association,
        }
    }

    /// Tracked instances this value points at, in order.
    pub fn children(&self) -> Vec<ObjectId> {
        match self {
            PropertyValue::Plain(_) => Vec::new(),
            PropertyValue::Reference(target) => target.iter().copied().collect(),
            PropertyValue::Association(items) => items.clone(),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        PropertyValue::Plain(v)
    }
}

impl From<Option<ObjectId>> for PropertyValue {
    fn from(target: Option<ObjectId>) -> Self {
        PropertyValue::Reference(target)
    }
}

impl From<Vec<ObjectId>> for PropertyValue {
    fn from(items: Vec<ObjectId>) -> Self {
        PropertyValue::Association(items)
    }
}

/// Identity of a tracking session within one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    /// Live instances in the identity cache.
    pub cached_instances: u64,
    /// Record files currently on disk.
    pub persisted_records: u64,
    /// Records materialized from disk.
    pub loads: u64,
    pub adds: u64,
    pub updates: u64,
    pub deletes: u64,
    /// Updates whose encoded record matched the last written digest.
    pub skipped_writes: u64,
}
