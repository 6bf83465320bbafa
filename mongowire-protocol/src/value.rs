//! Document values and element type tags.

use crate::document::{Document, Selector};
use crate::error::ProtocolError;
use crate::oid::ObjectId;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

/// Element type tag, the first byte of every encoded element.
///
/// The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    /// Terminates a document; carries no name.
    EndOfObject = 0x00,
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    Regex = 0x0B,
    DbRef = 0x0C,
    /// A string the server treats as executable code.
    Code = 0x0D,
    Symbol = 0x0E,
    Int32 = 0x10,
}

impl TryFrom<u8> for ElementType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ElementType::EndOfObject),
            0x01 => Ok(ElementType::Double),
            0x02 => Ok(ElementType::String),
            0x03 => Ok(ElementType::Document),
            0x04 => Ok(ElementType::Array),
            0x05 => Ok(ElementType::Binary),
            0x06 => Ok(ElementType::Undefined),
            0x07 => Ok(ElementType::ObjectId),
            0x08 => Ok(ElementType::Boolean),
            0x09 => Ok(ElementType::DateTime),
            0x0A => Ok(ElementType::Null),
            0x0B => Ok(ElementType::Regex),
            0x0C => Ok(ElementType::DbRef),
            0x0D => Ok(ElementType::Code),
            0x0E => Ok(ElementType::Symbol),
            0x10 => Ok(ElementType::Int32),
            other => Err(other),
        }
    }
}

/// A UTC timestamp with millisecond precision.
///
/// Stored as raw milliseconds so that any value read off the wire survives a
/// round trip, including ones outside chrono's representable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDateTime(i64);

impl UtcDateTime {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub const fn timestamp_millis(&self) -> i64 {
        self.0
    }

    /// Converts to a chrono timestamp, if representable.
    pub fn to_chrono(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl From<DateTime<Utc>> for UtcDateTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl fmt::Display for UtcDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_chrono() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// A regular expression as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Regex {
    pub pattern: String,
    /// Option letters such as `i` and `m`.
    pub options: String,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            options: options.into(),
        }
    }

    /// Option letters with duplicates removed, in ascending order.
    pub fn normalized_options(&self) -> String {
        let mut chars: Vec<char> = self.options.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        chars.into_iter().collect()
    }
}

/// A reference to a document in another collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbRef {
    /// Fully qualified `db.collection` name.
    pub namespace: String,
    pub id: ObjectId,
}

impl DbRef {
    pub fn new(namespace: impl Into<String>, id: ObjectId) -> Self {
        Self {
            namespace: namespace.into(),
            id,
        }
    }
}

/// A document field value.
///
/// Integers and floats are distinct variants; the caller picks one and the
/// codec never converts between them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    /// Encoded on the wire as a document keyed `"0"`, `"1"`, ...
    Array(Vec<Value>),
    Binary(Vec<u8>),
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    DateTime(UtcDateTime),
    Null,
    Regex(Regex),
    DbRef(DbRef),
    Code(String),
    Symbol(String),
    Int32(i32),
}

impl Value {
    /// Builds an array value from anything convertible.
    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    /// Returns the wire tag this value encodes with (ignoring key-specific overrides).
    pub fn element_type(&self) -> ElementType {
        match self {
            Value::Double(_) => ElementType::Double,
            Value::String(_) => ElementType::String,
            Value::Document(_) => ElementType::Document,
            Value::Array(_) => ElementType::Array,
            Value::Binary(_) => ElementType::Binary,
            Value::Undefined => ElementType::Undefined,
            Value::ObjectId(_) => ElementType::ObjectId,
            Value::Boolean(_) => ElementType::Boolean,
            Value::DateTime(_) => ElementType::DateTime,
            Value::Null => ElementType::Null,
            Value::Regex(_) => ElementType::Regex,
            Value::DbRef(_) => ElementType::DbRef,
            Value::Code(_) => ElementType::Code,
            Value::Symbol(_) => ElementType::Symbol,
            Value::Int32(_) => ElementType::Int32,
        }
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Document(_) => "document",
            Value::Array(_) => "array",
            Value::Binary(_) => "binary",
            Value::Undefined => "undefined",
            Value::ObjectId(_) => "objectid",
            Value::Boolean(_) => "boolean",
            Value::DateTime(_) => "datetime",
            Value::Null => "null",
            Value::Regex(_) => "regex",
            Value::DbRef(_) => "dbref",
            Value::Code(_) => "code",
            Value::Symbol(_) => "symbol",
            Value::Int32(_) => "int32",
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value of either numeric variant.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Integral value of either numeric variant; doubles must be whole.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Double(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    /// String contents of `String`, `Code`, and `Symbol` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Code(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_document_mut(&mut self) -> Option<&mut Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<UtcDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts an `i64` into `Int32` when it fits, `Double` otherwise.
    pub fn from_i64(v: i64) -> Self {
        match i32::try_from(v) {
            Ok(small) => Value::Int32(small),
            Err(_) => Value::Double(v as f64),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Double(f64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Int32(i32::from(v))
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int32(i32::from(v))
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int32(i32::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int32(i32::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::from_i64(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::from_i64(v)
    }
}

impl From<isize> for Value {
    fn from(v: isize) -> Self {
        Value::from_i64(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        match i64::try_from(v) {
            Ok(v) => Value::from_i64(v),
            Err(_) => Value::Double(v as f64),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<UtcDateTime> for Value {
    fn from(v: UtcDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v.into())
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Selector> for Value {
    fn from(v: Selector) -> Self {
        Value::Document(v.into_document())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<Regex> for Value {
    fn from(v: Regex) -> Self {
        Value::Regex(v)
    }
}

impl From<DbRef> for Value {
    fn from(v: DbRef) -> Self {
        Value::DbRef(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

impl TryFrom<Value> for Document {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Document(doc) => Ok(doc),
            other => Err(ProtocolError::UnsupportedType {
                key: String::new(),
                found: other.type_name(),
            }),
        }
    }
}
