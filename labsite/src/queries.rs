//! Query descriptors for each backend resource.
//!
//! Each builder captures a clone of the [`Transport`] in its fetch closure and
//! checks the payload's shape with a transform, so a malformed response
//! surfaces as a `TransformError` on the entry instead of at every reader.

use crate::resources::{meta_key, meta_path, path_key, projects_key, Resource};
use labsite_cache::QueryDescriptor;
use labsite_client::{RequestOptions, Transport};
use labsite_core::{
    decode_record, decode_records, GalleryImage, LabResult, NewsItem, PageMeta, Project,
    ProjectStatus, Publication, TeamMember,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Keep the payload as JSON after confirming it decodes as `Vec<T>`.
fn validate_list<T: DeserializeOwned>(payload: Value) -> LabResult<Value> {
    decode_records::<T>(&payload)?;
    Ok(payload)
}

/// `GET /api/projects`, optionally filtered by status.
pub fn projects(transport: &Transport, status: Option<ProjectStatus>) -> QueryDescriptor {
    let transport = transport.clone();
    QueryDescriptor::new(projects_key(status), move || {
        let transport = transport.clone();
        async move {
            let mut options = RequestOptions::get();
            if let Some(status) = status {
                options = options.query("status", status.as_str());
            }
            transport
                .request(&Resource::Projects.collection_path(), options)
                .await
        }
    })
    .with_transform(validate_list::<Project>)
}

/// `GET /api/<resource>` for the unfiltered collections.
pub fn collection(transport: &Transport, resource: Resource) -> QueryDescriptor {
    let descriptor = list_query(transport, resource);
    match resource {
        Resource::Projects => descriptor.with_transform(validate_list::<Project>),
        Resource::News => descriptor.with_transform(validate_list::<NewsItem>),
        Resource::Gallery => descriptor.with_transform(validate_list::<GalleryImage>),
        Resource::Publications => descriptor.with_transform(validate_list::<Publication>),
        Resource::Team => descriptor.with_transform(validate_list::<TeamMember>),
    }
}

fn list_query(transport: &Transport, resource: Resource) -> QueryDescriptor {
    let transport = transport.clone();
    QueryDescriptor::new(resource.root_key(), move || {
        let transport = transport.clone();
        async move { transport.get(&resource.collection_path()).await }
    })
}

/// `GET /api/meta/:page`. A page with no saved text reads as `{}`.
pub fn page_meta(transport: &Transport, page: &str) -> QueryDescriptor {
    let transport = transport.clone();
    let path = meta_path(page);
    QueryDescriptor::new(meta_key(page), move || {
        let transport = transport.clone();
        let path = path.clone();
        async move { transport.get(&path).await }
    })
    .with_transform(|payload| {
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        decode_record::<PageMeta>(&payload)?;
        Ok(payload)
    })
}

/// Any GET path, cached under its own key.
pub fn raw(transport: &Transport, path: &str) -> QueryDescriptor {
    let transport = transport.clone();
    let owned = path.to_string();
    QueryDescriptor::new(path_key(path), move || {
        let transport = transport.clone();
        let path = owned.clone();
        async move { transport.get(&path).await }
    })
}
