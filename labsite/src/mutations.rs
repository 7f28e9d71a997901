//! Mutation descriptors for the admin console's edits.
//!
//! Creates show a provisional record (temporary id) at the top of every
//! cached list whose filter it matches; updates merge fields in place and
//! drop the record from filtered lists it no longer belongs to; deletes hide
//! the record at once. Each descriptor affects its resource's root key, so
//! on success every cached query of that resource is refetched.

use crate::resources::{meta_key, meta_path, Resource};
use labsite_cache::{
    filter_matches, merge_object, merge_record, prepend_record, remove_record, Draft,
    MutationDescriptor,
};
use labsite_client::Transport;
use labsite_core::{record_id, CacheKey, LabError, LabResult};
use serde_json::{Map, Value};

/// Field changes for one existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEdit {
    pub id: String,
    pub fields: Value,
}

impl RecordEdit {
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Request body from form fields plus the uploaded image URL, if any.
///
/// Create and update accept at most one attachment, so `urls` holds zero or
/// one entries.
fn request_body(fields: &Value, resource: Resource, urls: &[String]) -> LabResult<Value> {
    let mut body = match fields {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(LabError::invalid_request(format!(
                "{} fields must be a JSON object, got {}",
                resource, other
            )))
        }
    };
    match urls {
        [] => {}
        [url] => {
            body.insert(resource.image_field().to_string(), Value::String(url.clone()));
        }
        _ => {
            return Err(LabError::invalid_request(format!(
                "{} takes one image, got {} uploaded files",
                resource,
                urls.len()
            )))
        }
    }
    Ok(Value::Object(body))
}

/// `POST /api/<resource>` with an optimistic provisional record.
pub fn create(transport: &Transport, resource: Resource) -> MutationDescriptor<Draft> {
    let transport = transport.clone();
    MutationDescriptor::new(move |draft: Draft, urls: Vec<String>| {
        let transport = transport.clone();
        async move {
            let body = request_body(&draft.fields, resource, &urls)?;
            transport.post(&resource.collection_path(), body).await
        }
    })
    .with_max_attachments(1)
    .with_optimistic(|key: &CacheKey, current: Option<&Value>, draft: &Draft| {
        let record = draft.provisional_record();
        if filter_matches(key, &record) {
            prepend_record(current, &record)
        } else {
            None
        }
    })
    .affecting(resource.root_key())
}

/// `PUT /api/<resource>/:id`, merging the fields into cached copies.
pub fn update(transport: &Transport, resource: Resource) -> MutationDescriptor<RecordEdit> {
    let transport = transport.clone();
    MutationDescriptor::new(move |edit: RecordEdit, urls: Vec<String>| {
        let transport = transport.clone();
        async move {
            let body = request_body(&edit.fields, resource, &urls)?;
            transport.put(&resource.record_path(&edit.id), body).await
        }
    })
    .with_max_attachments(1)
    .with_optimistic(apply_edit)
    .affecting(resource.root_key())
}

/// Merge an edit into a cached list or record. A list filtered on a field
/// the edit changes loses the record.
fn apply_edit(key: &CacheKey, current: Option<&Value>, edit: &RecordEdit) -> Option<Value> {
    let merged = merge_record(current, &edit.id, &edit.fields)?;
    let Value::Array(items) = &merged else {
        return Some(merged);
    };
    let moved_out = items.iter().any(|item| {
        record_id(item).as_deref() == Some(edit.id.as_str()) && !filter_matches(key, item)
    });
    if moved_out {
        remove_record(Some(&merged), &edit.id)
    } else {
        Some(merged)
    }
}

/// `DELETE /api/<resource>/:id`, hiding the record immediately.
pub fn delete(transport: &Transport, resource: Resource) -> MutationDescriptor<String> {
    let transport = transport.clone();
    MutationDescriptor::new(move |id: String, _urls: Vec<String>| {
        let transport = transport.clone();
        async move { transport.delete(&resource.record_path(&id)).await }
    })
    .with_max_attachments(0)
    .with_optimistic(|_: &CacheKey, current: Option<&Value>, id: &String| {
        remove_record(current, id)
    })
    .affecting(resource.root_key())
}

/// `PUT /api/meta/:page` with the changed fields merged over the cached text.
pub fn update_meta(transport: &Transport, page: &str) -> MutationDescriptor<Value> {
    let transport = transport.clone();
    let path = meta_path(page);
    MutationDescriptor::new(move |fields: Value, _urls: Vec<String>| {
        let transport = transport.clone();
        let path = path.clone();
        async move { transport.put(&path, fields).await }
    })
    .with_max_attachments(0)
    .with_optimistic(|_: &CacheKey, current: Option<&Value>, fields: &Value| {
        merge_object(current, fields)
    })
    .affecting(meta_key(page))
}
