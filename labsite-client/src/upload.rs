//! Multipart upload collaborator.

use crate::transport::Transport;
use async_trait::async_trait;
use labsite_core::{ApiConfig, Attachment, FileUploader, LabError, LabResult};
use reqwest::multipart::{Form, Part};
use serde_json::Value;

/// Uploads attachments in one batched multipart request.
#[derive(Clone)]
pub struct HttpUploader {
    transport: Transport,
    path: String,
    field: String,
}

impl HttpUploader {
    pub fn new(transport: Transport, path: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
            field: field.into(),
        }
    }

    pub fn from_config(transport: Transport, config: &ApiConfig) -> Self {
        Self::new(transport, config.upload_path.clone(), config.upload_field.clone())
    }

    fn build_form(&self, files: &[Attachment]) -> LabResult<Form> {
        let mut form = Form::new();
        for file in files {
            let mut part = Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
            if let Some(content_type) = &file.content_type {
                part = part.mime_str(content_type).map_err(|e| LabError::UploadFailed {
                    status: None,
                    reason: format!("content type {}: {}", content_type, e),
                })?;
            }
            form = form.part(self.field.clone(), part);
        }
        Ok(form)
    }
}

#[async_trait]
impl FileUploader for HttpUploader {
    async fn upload(&self, files: &[Attachment]) -> LabResult<Vec<String>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let form = self.build_form(files)?;
        let response = self
            .transport
            .send_multipart(&self.path, form)
            .await
            .map_err(LabError::into_upload_failure)?;
        let urls = extract_urls(&response)?;
        tracing::debug!(files = files.len(), urls = urls.len(), "upload complete");
        Ok(urls)
    }
}

/// Accepts `{ "urls": [...] }`, a bare array of URLs, or `{ "url": "..." }`.
pub fn extract_urls(response: &Value) -> LabResult<Vec<String>> {
    let list = match response {
        Value::Array(items) => Some(items),
        Value::Object(map) => match (map.get("urls"), map.get("url")) {
            (Some(Value::Array(items)), _) => Some(items),
            (_, Some(Value::String(url))) => return Ok(vec![url.clone()]),
            _ => None,
        },
        _ => None,
    };

    let list = list.ok_or_else(|| LabError::UploadFailed {
        status: None,
        reason: "response carried no URLs".to_string(),
    })?;

    list.iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| LabError::UploadFailed {
                    status: None,
                    reason: format!("non-string URL in response: {}", item),
                })
        })
        .collect()
}
