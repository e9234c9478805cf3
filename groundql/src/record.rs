//! Normalized index records.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One indexed document. `(collection, path)` is the primary key.
///
/// Field maps are ordered, so serializing the same record twice always
/// produces the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub collection: String,
    pub path: String,
    pub template: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// SHA-256 of the raw content the record was built from
    pub content_hash: String,
}

impl DocumentRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Corrupt {
            key: format!("{}/{}", self.collection, self.path),
            message: e.to_string(),
        })
    }

    pub fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            message: e.to_string(),
        })
    }

    /// Plain JSON form of every stored field
    pub fn fields_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

/// A field value tagged by its field kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum FieldValue {
    String(String),
    Number(f64),
    Boolean(bool),
    /// Canonical UTC form `YYYY-MM-DDTHH:MM:SS.mmmZ`
    Datetime(String),
    RichText(serde_json::Value),
    Reference(RefTarget),
    List(Vec<FieldValue>),
    Object(ObjectValue),
}

/// Identity of a referenced document. Resolved lazily on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTarget {
    /// The allowed collection owning `path`, if any matched at index time
    pub collection: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    pub template: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl FieldValue {
    /// Plain JSON form: references collapse to their target path, objects to
    /// their field map.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::String(s) | FieldValue::Datetime(s) => Value::String(s.clone()),
            FieldValue::Number(n) => number_to_json(*n),
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::RichText(v) => v.clone(),
            FieldValue::Reference(target) => Value::String(target.path.clone()),
            FieldValue::List(items) => Value::Array(items.iter().map(FieldValue::to_json).collect()),
            FieldValue::Object(object) => Value::Object(
                object
                    .fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Every reference in this value, with its dotted field path.
    pub fn references<'a>(&'a self, field_path: &str, out: &mut Vec<(String, &'a RefTarget)>) {
        match self {
            FieldValue::Reference(target) => out.push((field_path.to_string(), target)),
            FieldValue::List(items) => {
                for item in items {
                    item.references(field_path, out);
                }
            }
            FieldValue::Object(object) => {
                for (name, value) in &object.fields {
                    value.references(&format!("{field_path}.{name}"), out);
                }
            }
            _ => {}
        }
    }
}

/// Integral values render as JSON integers, everything else as floats.
pub fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}
