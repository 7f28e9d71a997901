//! Labsite Core - shared types for the lab website data layer.
//!
//! Cache keys, the error taxonomy, configuration, content records, the
//! category-ordering utility and the collaborator traits the other crates
//! implement. This crate performs no I/O beyond reading a config file.

pub mod config;
pub mod content;
pub mod error;
pub mod key;
pub mod ordering;
pub mod traits;

pub use config::{ApiConfig, CacheSettings, LabConfig, RetrySettings};
pub use content::{
    decode_record, decode_records, is_temporary_id, ordered_project_categories, record_id,
    temporary_id, GalleryImage, NewsItem, PageMeta, Project, ProjectStatus, Publication,
    TeamMember, TEMP_ID_PREFIX,
};
pub use error::{ConfigError, LabError, LabResult};
pub use key::{canonical_json, CacheKey};
pub use ordering::{apply_category_order, distinct_in_order};
pub use traits::{Attachment, FileUploader, TokenProvider};
