//! Labsite - the data layer of the lab website.
//!
//! [`LabClient`] is the application root. It owns one
//! [`CacheStore`](labsite_cache::CacheStore) and exposes the lab's resources
//! (projects, news, gallery, publications, team, page meta) as cached
//! queries and optimistic mutations.
//!
//! ```no_run
//! # async fn demo() -> labsite_core::LabResult<()> {
//! use labsite::{LabClient, Resource};
//! use labsite_core::{LabConfig, ProjectStatus};
//!
//! let client = LabClient::new(LabConfig::for_base_url("https://lab.example.edu"))?;
//! let current = client.projects(Some(ProjectStatus::Current)).await?;
//! client.delete(Resource::Projects).mutate_async(current[0].id().to_string()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod mutations;
pub mod queries;
pub mod resources;
pub mod telemetry;

pub use client::LabClient;
pub use mutations::RecordEdit;
pub use resources::{meta_key, meta_path, path_key, projects_key, Resource};
pub use telemetry::{init_logging, LogFormat};
