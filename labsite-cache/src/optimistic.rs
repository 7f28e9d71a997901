//! Pure helpers for optimistic patches over cached JSON.
//!
//! Each helper takes the entry's current data and returns the patched data,
//! or `None` when the entry should be left alone.

use labsite_core::{record_id, temporary_id, CacheKey};
use serde_json::{Map, Value};

/// Fields of a record about to be created, with the temporary id it is shown
/// under until the server assigns a real one.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub fields: Value,
    pub temp_id: String,
}

impl Draft {
    pub fn new(fields: Value) -> Self {
        Self {
            fields,
            temp_id: temporary_id(),
        }
    }

    /// The fields plus `id` and `_id` set to the temporary id.
    pub fn provisional_record(&self) -> Value {
        let mut record = match &self.fields {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        record.insert("id".to_string(), Value::String(self.temp_id.clone()));
        record.insert("_id".to_string(), Value::String(self.temp_id.clone()));
        Value::Object(record)
    }
}

/// Whether `record` belongs in the list cached under `key`.
///
/// Every field of the key's filter object must equal the record's field.
/// Keys without a filter match everything.
pub fn filter_matches(key: &CacheKey, record: &Value) -> bool {
    match key.filter() {
        Some(filter) => filter
            .iter()
            .all(|(field, wanted)| record.get(field) == Some(wanted)),
        None => true,
    }
}

/// Put `record` at the front of a cached list.
pub fn prepend_record(current: Option<&Value>, record: &Value) -> Option<Value> {
    let items = current?.as_array()?;
    let mut next = Vec::with_capacity(items.len() + 1);
    next.push(record.clone());
    next.extend(items.iter().cloned());
    Some(Value::Array(next))
}

/// Drop the record whose `id` or `_id` is `id` from a cached list.
pub fn remove_record(current: Option<&Value>, id: &str) -> Option<Value> {
    let items = current?.as_array()?;
    Some(Value::Array(
        items
            .iter()
            .filter(|item| !has_id(item, id))
            .cloned()
            .collect(),
    ))
}

/// Shallow-merge `fields` into the record with the given id, in a list or a
/// single cached record. Returns `None` when no record matches.
pub fn merge_record(current: Option<&Value>, id: &str, fields: &Value) -> Option<Value> {
    match current? {
        Value::Array(items) => {
            let mut matched = false;
            let next = items
                .iter()
                .map(|item| {
                    if has_id(item, id) {
                        matched = true;
                        merge_fields(item, fields)
                    } else {
                        item.clone()
                    }
                })
                .collect();
            matched.then_some(Value::Array(next))
        }
        record @ Value::Object(_) if has_id(record, id) => Some(merge_fields(record, fields)),
        _ => None,
    }
}

/// Shallow-merge `fields` over a cached object, or start from an empty one.
pub fn merge_object(current: Option<&Value>, fields: &Value) -> Option<Value> {
    match current {
        Some(record @ Value::Object(_)) => Some(merge_fields(record, fields)),
        None | Some(Value::Null) => Some(merge_fields(&Value::Object(Map::new()), fields)),
        Some(_) => None,
    }
}

fn has_id(record: &Value, id: &str) -> bool {
    if record_id(record).as_deref() == Some(id) {
        return true;
    }
    match record.get("_id") {
        Some(Value::String(legacy)) => legacy == id,
        _ => false,
    }
}

fn merge_fields(record: &Value, fields: &Value) -> Value {
    let mut merged = record.as_object().cloned().unwrap_or_default();
    if let Some(fields) = fields.as_object() {
        for (name, value) in fields {
            merged.insert(name.clone(), value.clone());
        }
    }
    Value::Object(merged)
}
