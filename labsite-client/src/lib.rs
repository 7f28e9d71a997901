//! HTTP client layer for the lab backend: JSON transport, bearer-token
//! sources and the multipart uploader.

pub mod auth;
pub mod transport;
pub mod upload;

pub use auth::{SessionToken, StaticToken};
pub use transport::{
    alias_ids, parse_payload, resolve_url, server_message, unwrap_payload, RequestOptions,
    Transport,
};
pub use upload::{extract_urls, HttpUploader};
