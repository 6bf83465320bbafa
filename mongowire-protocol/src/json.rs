//! Conversion between documents and `serde_json` values.
//!
//! Types without a JSON counterpart use `$`-prefixed wrapper objects:
//! `{"$oid": "<hex>"}`, `{"$date": <ms>}`, `{"$binary": "<hex>"}`,
//! `{"$regex": .., "$options": ..}`, `{"$ref": .., "$id": ..}`,
//! `{"$code": ..}`, `{"$symbol": ..}` and `{"$undefined": true}`.

use crate::document::{validate_selector_key, Document};
use crate::error::ProtocolError;
use crate::oid::ObjectId;
use crate::value::{DbRef, Regex, UtcDateTime, Value};
use serde_json::{Map, Number, Value as Json};

/// Renders a document as a JSON object, keeping key order.
pub fn to_json(doc: &Document) -> Json {
    let mut map = Map::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        map.insert(key.to_string(), value_to_json(value));
    }
    Json::Object(map)
}

/// Renders a single value.
pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Double(v) => Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null),
        Value::Int32(v) => Json::from(*v),
        Value::String(s) => Json::String(s.clone()),
        Value::Boolean(b) => Json::Bool(*b),
        Value::Null => Json::Null,
        Value::Document(doc) => to_json(doc),
        Value::Array(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Binary(bytes) => wrapper("$binary", Json::String(hex::encode(bytes))),
        Value::Undefined => wrapper("$undefined", Json::Bool(true)),
        Value::ObjectId(id) => wrapper("$oid", Json::String(id.to_hex())),
        Value::DateTime(dt) => wrapper("$date", Json::from(dt.timestamp_millis())),
        Value::Regex(re) => {
            let mut map = Map::new();
            map.insert("$regex".into(), Json::String(re.pattern.clone()));
            map.insert("$options".into(), Json::String(re.options.clone()));
            Json::Object(map)
        }
        Value::DbRef(r) => {
            let mut map = Map::new();
            map.insert("$ref".into(), Json::String(r.namespace.clone()));
            map.insert("$id".into(), Json::String(r.id.to_hex()));
            Json::Object(map)
        }
        Value::Code(s) => wrapper("$code", Json::String(s.clone())),
        Value::Symbol(s) => wrapper("$symbol", Json::String(s.clone())),
    }
}

fn wrapper(key: &str, inner: Json) -> Json {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), inner);
    Json::Object(map)
}

/// Builds a document from a JSON object.
///
/// Keys are checked as selector keys: they must be non-empty and free of
/// NUL bytes, but may carry operators or dotted paths.
pub fn from_json(json: &Json) -> Result<Document, ProtocolError> {
    match json {
        Json::Object(map) => object_to_document(map),
        other => Err(ProtocolError::UnsupportedType {
            key: String::new(),
            found: json_type_name(other),
        }),
    }
}

/// Parses JSON text into a document.
pub fn from_json_str(text: &str) -> Result<Document, ProtocolError> {
    let json: Json = serde_json::from_str(text)?;
    from_json(&json)
}

/// Converts a single JSON value.
pub fn value_from_json(json: &Json) -> Result<Value, ProtocolError> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => number_to_value(n),
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Array(
            items
                .iter()
                .map(value_from_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Json::Object(map) => match extended_value(map)? {
            Some(value) => value,
            None => Value::Document(object_to_document(map)?),
        },
    })
}

fn object_to_document(map: &Map<String, Json>) -> Result<Document, ProtocolError> {
    let mut doc = Document::with_capacity(map.len());
    for (key, value) in map {
        validate_selector_key(key)?;
        doc.insert_unchecked(key.clone(), value_from_json(value)?);
    }
    Ok(doc)
}

fn number_to_value(n: &Number) -> Value {
    match n.as_i64().and_then(|v| i32::try_from(v).ok()) {
        Some(v) => Value::Int32(v),
        None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
    }
}

/// Recognises the wrapper objects produced by [`value_to_json`].
fn extended_value(map: &Map<String, Json>) -> Result<Option<Value>, ProtocolError> {
    let mut keys = map.keys().map(String::as_str);
    let (first, second) = (keys.next(), keys.next());
    if keys.next().is_some() {
        return Ok(None);
    }

    let value = match (first, second, map.values().next()) {
        (Some("$oid"), None, Some(Json::String(hex))) => Value::ObjectId(hex.parse()?),
        (Some("$date"), None, Some(Json::Number(ms))) => match ms.as_i64() {
            Some(ms) => Value::DateTime(UtcDateTime::from_millis(ms)),
            None => return Ok(None),
        },
        (Some("$binary"), None, Some(Json::String(encoded))) => {
            let bytes = hex::decode(encoded).map_err(|_| ProtocolError::UnsupportedType {
                key: "$binary".to_string(),
                found: "non-hex string",
            })?;
            Value::Binary(bytes)
        }
        (Some("$undefined"), None, Some(Json::Bool(true))) => Value::Undefined,
        (Some("$code"), None, Some(Json::String(s))) => Value::Code(s.clone()),
        (Some("$symbol"), None, Some(Json::String(s))) => Value::Symbol(s.clone()),
        (Some("$regex"), Some("$options"), _) => {
            match (map.get("$regex"), map.get("$options")) {
                (Some(Json::String(pattern)), Some(Json::String(options))) => {
                    Value::Regex(Regex::new(pattern.as_str(), options.as_str()))
                }
                _ => return Ok(None),
            }
        }
        (Some("$ref"), Some("$id"), _) => match (map.get("$ref"), map.get("$id")) {
            (Some(Json::String(ns)), Some(Json::String(id))) => {
                Value::DbRef(DbRef::new(ns.as_str(), id.parse::<ObjectId>()?))
            }
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn json_type_name(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
