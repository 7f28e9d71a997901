//! Structured cache keys with a canonical lookup form.
//!
//! A [`CacheKey`] is an ordered list of JSON values such as
//! `["projects", {"status": "current"}]`. Equality and hashing go through the
//! canonical serialization, in which object members are sorted by name at
//! every depth, so `{"a":1,"b":2}` and `{"b":2,"a":1}` address the same entry.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier of one cached resource.
#[derive(Clone)]
pub struct CacheKey {
    parts: Vec<Value>,
    /// Canonical form of each part, computed once for prefix matching.
    part_forms: Vec<String>,
    canonical: String,
}

impl CacheKey {
    /// Build a key from its parts.
    pub fn new(parts: Vec<Value>) -> Self {
        let part_forms: Vec<String> = parts.iter().map(canonical_json).collect();
        let canonical = format!("[{}]", part_forms.join(","));
        Self {
            parts,
            part_forms,
            canonical,
        }
    }

    /// Single-part key naming a resource collection.
    pub fn root(resource: impl Into<String>) -> Self {
        Self::new(vec![Value::String(resource.into())])
    }

    /// Return a new key with `part` appended.
    pub fn with(&self, part: impl Into<Value>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(part.into());
        Self::new(parts)
    }

    /// The structured parts, as supplied.
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// Canonical serialized form used as the map key.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// First part when it is a string (the resource name by convention).
    pub fn resource(&self) -> Option<&str> {
        self.parts.first().and_then(Value::as_str)
    }

    /// Filter object carried by the key, if any part is an object.
    pub fn filter(&self) -> Option<&serde_json::Map<String, Value>> {
        self.parts.iter().skip(1).find_map(Value::as_object)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// True when `prefix`'s parts equal the leading parts of this key.
    ///
    /// Every key is a prefix of itself; the empty key is a prefix of all keys.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        prefix.part_forms.len() <= self.part_forms.len()
            && prefix
                .part_forms
                .iter()
                .zip(&self.part_forms)
                .all(|(a, b)| a == b)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.canonical)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl From<&str> for CacheKey {
    fn from(resource: &str) -> Self {
        Self::root(resource)
    }
}

impl From<Vec<Value>> for CacheKey {
    fn from(parts: Vec<Value>) -> Self {
        Self::new(parts)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.parts.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts = Vec::<Value>::deserialize(deserializer)?;
        Ok(Self::new(parts))
    }
}

/// Serialize a JSON value with object members sorted by name at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> = map.iter().collect();
            members.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, member)) in members.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
