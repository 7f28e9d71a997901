//! Collaborator traits implemented outside the cache layer.
//!
//! The mutation executor uploads attachments through a [`FileUploader`] and
//! the transport asks a [`TokenProvider`] for the bearer token. Both live here
//! so the cache crate does not depend on the HTTP client.

use crate::error::LabResult;
use async_trait::async_trait;

/// A file attached to a mutation, uploaded before the write is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Uploads files and returns the URLs the backend stored them under.
///
/// Implementations must return one URL per stored file, in upload order.
#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload(&self, files: &[Attachment]) -> LabResult<Vec<String>>;
}

/// Source of the bearer token attached to backend requests.
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` for anonymous requests.
    fn bearer_token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}
