//! The lab backend's resource catalogue: REST paths and cache keys.
//!
//! Every path lives under `/api` and is resolved against the configured
//! base URL by the transport. Cache keys start with the resource name so a
//! write can invalidate a whole resource through its root key.

use labsite_core::{CacheKey, ProjectStatus};
use serde_json::json;
use std::fmt;

const API_PREFIX: &str = "/api";

/// Collections served by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Projects,
    News,
    Gallery,
    Publications,
    Team,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Projects,
        Resource::News,
        Resource::Gallery,
        Resource::Publications,
        Resource::Team,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::News => "news",
            Self::Gallery => "gallery",
            Self::Publications => "publications",
            Self::Team => "team",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|resource| resource.name().eq_ignore_ascii_case(value))
    }

    /// Whether the admin console can create, edit and delete records.
    pub fn is_editable(self) -> bool {
        matches!(self, Self::Projects | Self::News | Self::Gallery)
    }

    /// Field that receives the uploaded file's URL.
    pub fn image_field(self) -> &'static str {
        match self {
            Self::Gallery => "url",
            Self::Team => "photo",
            _ => "image",
        }
    }

    pub fn collection_path(self) -> String {
        format!("{}/{}", API_PREFIX, self.name())
    }

    /// Path of one record. The id is percent-encoded as a single segment.
    pub fn record_path(self, id: &str) -> String {
        format!("{}/{}/{}", API_PREFIX, self.name(), urlencoding::encode(id))
    }

    /// Prefix of every cached query of this resource.
    pub fn root_key(self) -> CacheKey {
        CacheKey::root(self.name())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `["projects", {"status": ...}]`, or the bare root for all projects.
pub fn projects_key(status: Option<ProjectStatus>) -> CacheKey {
    match status {
        Some(status) => Resource::Projects
            .root_key()
            .with(json!({ "status": status.as_str() })),
        None => Resource::Projects.root_key(),
    }
}

pub fn meta_root_key() -> CacheKey {
    CacheKey::root("meta")
}

pub fn meta_key(page: &str) -> CacheKey {
    meta_root_key().with(page)
}

pub fn meta_path(page: &str) -> String {
    format!("{}/meta/{}", API_PREFIX, urlencoding::encode(page))
}

/// Key for an arbitrary GET path, used by the CLI.
pub fn path_key(path: &str) -> CacheKey {
    CacheKey::root("path").with(path)
}
