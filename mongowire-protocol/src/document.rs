//! Ordered documents and their selector and modifier variants.
//!
//! A [`Document`] keeps its keys in first-insertion order. Re-putting an
//! existing key replaces the value in place, so the key keeps its original
//! position. Command documents rely on this: the command name must be the
//! first key.

use crate::error::ProtocolError;
use crate::oid::ObjectId;
use crate::value::Value;
use std::fmt;
use std::ops::Deref;

/// Key whose string values are sent as executable code.
pub const WHERE_KEY: &str = "$where";

/// Update operators accepted as top-level modifier keys.
pub const MODIFIER_OPERATORS: [&str; 7] = [
    "$inc", "$set", "$unset", "$push", "$pushAll", "$pull", "$pullAll",
];

/// Validates a key for insertion into a plain document.
pub fn validate_key(key: &str) -> Result<(), ProtocolError> {
    if key.is_empty() {
        return Err(ProtocolError::InvalidKey {
            key: key.to_string(),
            reason: "key must not be empty",
        });
    }
    if key.starts_with('$') {
        return Err(ProtocolError::InvalidKey {
            key: key.to_string(),
            reason: "key must not start with '$'",
        });
    }
    if key.contains('.') {
        return Err(ProtocolError::InvalidKey {
            key: key.to_string(),
            reason: "key must not contain '.'",
        });
    }
    check_cstring(key)
}

/// Validates a selector key: operators and dotted paths are allowed.
pub fn validate_selector_key(key: &str) -> Result<(), ProtocolError> {
    if key.is_empty() {
        return Err(ProtocolError::InvalidKey {
            key: key.to_string(),
            reason: "key must not be empty",
        });
    }
    check_cstring(key)
}

pub(crate) fn check_cstring(s: &str) -> Result<(), ProtocolError> {
    if s.as_bytes().contains(&0) {
        return Err(ProtocolError::InvalidCString(s.to_string()));
    }
    Ok(())
}

/// An ordered key/value document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Inserts or overwrites a value after validating the key.
    ///
    /// A new key is appended; an existing key keeps its position.
    pub fn put(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<&mut Self, ProtocolError> {
        let key = key.into();
        validate_key(&key)?;
        self.insert_unchecked(key, value.into());
        Ok(self)
    }

    /// Builder form of [`put`](Self::put).
    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self, ProtocolError> {
        self.put(key, value)?;
        Ok(self)
    }

    /// Inserts a key at the front, moving it there if already present.
    pub fn put_first(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<&mut Self, ProtocolError> {
        let key = key.into();
        validate_key(&key)?;
        self.remove(&key);
        self.entries.insert(0, (key, value.into()));
        Ok(self)
    }

    /// Checks every top-level key against the plain-document rules.
    ///
    /// Documents decoded from the wire or converted from selectors skip
    /// validation, so this is the check to run before storing one.
    pub fn validate_keys(&self) -> Result<(), ProtocolError> {
        self.keys().try_for_each(validate_key)
    }

    /// Inserts without key validation. Returns the previous value, if any.
    pub(crate) fn insert_unchecked(&mut self, key: String, value: Value) -> Option<Value> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Removes a key, keeping the order of the remaining keys.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Keys in first-insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn first_key(&self) -> Option<&str> {
        self.entries.first().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Copies every entry of `other` into this document.
    ///
    /// Keys already present are overwritten in place; new keys are appended
    /// in `other`'s order. Keys are validated as for [`put`](Self::put).
    pub fn merge(&mut self, other: Document) -> Result<(), ProtocolError> {
        for (key, value) in other.entries {
            validate_key(&key)?;
            self.insert_unchecked(key, value);
        }
        Ok(())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Value::as_i32)
    }

    /// Numeric field as `f64`, accepting either numeric variant.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Integral field as `i64`, accepting either numeric variant.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Value::as_document)
    }

    pub fn get_array(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_array)
    }

    pub fn get_object_id(&self, key: &str) -> Option<ObjectId> {
        self.get(key).and_then(Value::as_object_id)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::json::to_json(self))
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A document used as a query filter.
///
/// Keys may start with `$` and contain `.`, so operator expressions and
/// dotted field paths are expressible. Keys must still be non-empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector(Document);

impl Selector {
    /// The empty selector, matching every document.
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-field equality selector.
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Result<Self, ProtocolError> {
        Self::new().with(key, value)
    }

    /// Wraps a boolean expression in a `$where` function.
    ///
    /// A blank expression yields the empty selector.
    pub fn where_clause(expr: &str) -> Self {
        let expr = expr.trim();
        let mut selector = Self::new();
        if !expr.is_empty() {
            selector.0.insert_unchecked(
                WHERE_KEY.to_string(),
                Value::String(format!("function() {{ return {};}}", expr)),
            );
        }
        selector
    }

    pub fn put(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<&mut Self, ProtocolError> {
        let key = key.into();
        validate_selector_key(&key)?;
        self.0.insert_unchecked(key, value.into());
        Ok(self)
    }

    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self, ProtocolError> {
        self.put(key, value)?;
        Ok(self)
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_document(self) -> Document {
        self.0
    }
}

impl Deref for Selector {
    type Target = Document;

    fn deref(&self) -> &Document {
        &self.0
    }
}

impl From<Document> for Selector {
    /// Plain document keys are a subset of selector keys.
    fn from(doc: Document) -> Self {
        Self(doc)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An update document made of operator keys such as `$set` and `$inc`.
///
/// Every top-level key must be one of [`MODIFIER_OPERATORS`] and map to a
/// document of field changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modifier(Document);

impl Modifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operator with its field document, replacing any previous one.
    pub fn put(
        &mut self,
        operator: impl Into<String>,
        fields: impl Into<Value>,
    ) -> Result<&mut Self, ProtocolError> {
        let operator = operator.into();
        let fields = fields.into();
        validate_modifier_entry(&operator, &fields)?;
        self.0.insert_unchecked(operator, fields);
        Ok(self)
    }

    pub fn with(
        mut self,
        operator: impl Into<String>,
        fields: impl Into<Value>,
    ) -> Result<Self, ProtocolError> {
        self.put(operator, fields)?;
        Ok(self)
    }

    /// Adds one `field: value` pair under `$set`.
    pub fn set(
        self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self, ProtocolError> {
        self.with_field("$set", field.into(), value.into())
    }

    /// Adds one `field: amount` pair under `$inc`.
    pub fn inc(
        self,
        field: impl Into<String>,
        amount: impl Into<Value>,
    ) -> Result<Self, ProtocolError> {
        self.with_field("$inc", field.into(), amount.into())
    }

    /// Adds `field: 1` under `$unset`.
    pub fn unset(self, field: impl Into<String>) -> Result<Self, ProtocolError> {
        self.with_field("$unset", field.into(), Value::Int32(1))
    }

    fn with_field(
        mut self,
        operator: &str,
        field: String,
        value: Value,
    ) -> Result<Self, ProtocolError> {
        // Field paths may be dotted.
        validate_selector_key(&field)?;
        match self.0.get_mut(operator) {
            Some(Value::Document(fields)) => {
                fields.insert_unchecked(field, value);
            }
            _ => {
                let mut fields = Document::new();
                fields.insert_unchecked(field, value);
                self.0
                    .insert_unchecked(operator.to_string(), Value::Document(fields));
            }
        }
        Ok(self)
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_document(self) -> Document {
        self.0
    }
}

impl Deref for Modifier {
    type Target = Document;

    fn deref(&self) -> &Document {
        &self.0
    }
}

impl TryFrom<Document> for Modifier {
    type Error = ProtocolError;

    fn try_from(doc: Document) -> Result<Self, Self::Error> {
        for (key, value) in doc.iter() {
            validate_modifier_entry(key, value)?;
        }
        Ok(Self(doc))
    }
}

fn validate_modifier_entry(operator: &str, fields: &Value) -> Result<(), ProtocolError> {
    if !MODIFIER_OPERATORS.contains(&operator) {
        return Err(ProtocolError::InvalidModifier(format!(
            "unsupported operator {:?}",
            operator
        )));
    }
    if !matches!(fields, Value::Document(_)) {
        return Err(ProtocolError::InvalidModifier(format!(
            "value for {} must be a document, found {}",
            operator,
            fields.type_name()
        )));
    }
    Ok(())
}

/// The second document of an update request.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Replace the matched document wholesale.
    Replace(Document),
    /// Apply update operators to the matched document.
    Modify(Modifier),
}

impl Update {
    pub fn as_document(&self) -> &Document {
        match self {
            Update::Replace(doc) => doc,
            Update::Modify(modifier) => modifier.as_document(),
        }
    }
}

impl From<Document> for Update {
    fn from(doc: Document) -> Self {
        Update::Replace(doc)
    }
}

impl From<Modifier> for Update {
    fn from(modifier: Modifier) -> Self {
        Update::Modify(modifier)
    }
}
