//! Error types for labsite operations

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or LABSITE_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for the data layer.
///
/// Errors are `Clone` because a single in-flight fetch can be awaited by
/// many readers, each of which receives its own copy of the outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LabError {
    #[error("Request failed with status {status}{}", format_server_message(.message))]
    RequestFailed {
        status: u16,
        message: Option<String>,
    },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Upload failed: {reason}")]
    UploadFailed { status: Option<u16>, reason: String },

    #[error("Transform failed: {reason}")]
    TransformError { reason: String },

    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

fn format_server_message(message: &Option<String>) -> String {
    match message {
        Some(message) => format!(": {}", message),
        None => String::new(),
    }
}

impl LabError {
    pub fn request_failed(status: u16, message: Option<String>) -> Self {
        Self::RequestFailed { status, message }
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    pub fn transform(reason: impl Into<String>) -> Self {
        Self::TransformError {
            reason: reason.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Convert any failure of the upload step into `UploadFailed`, keeping
    /// the HTTP status when there was one.
    pub fn into_upload_failure(self) -> Self {
        match self {
            Self::UploadFailed { .. } => self,
            Self::RequestFailed { status, message } => Self::UploadFailed {
                status: Some(status),
                reason: message.unwrap_or_else(|| format!("HTTP {}", status)),
            },
            other => Self::UploadFailed {
                status: None,
                reason: other.to_string(),
            },
        }
    }

    /// HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RequestFailed { status, .. } => Some(*status),
            Self::UploadFailed { status, .. } => *status,
            _ => None,
        }
    }

    /// True for the "not found" class of failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RequestFailed { status: 404, .. })
    }

    /// True for caller-supplied transform failures.
    pub fn is_transform(&self) -> bool {
        matches!(self, Self::TransformError { .. })
    }
}

/// Result type alias for labsite operations.
pub type LabResult<T> = Result<T, LabError>;

// =============================================================================
// TESTS
// =============================================================================
