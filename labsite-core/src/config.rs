//! Configuration loading for the labsite data layer.
//!
//! The `[api]` table is required. `[cache]` and `[retry]` fall back to the
//! defaults below when omitted.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "LABSITE_CONFIG";
pub const BASE_URL_ENV: &str = "LABSITE_API_BASE_URL";
pub const TOKEN_ENV: &str = "LABSITE_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabConfig {
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    #[serde(default = "default_upload_field")]
    pub upload_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// How long fetched data is served without refetching.
    pub stale_time_ms: u64,
    /// How long an entry with no subscribers is kept before eviction.
    pub gc_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

fn default_upload_path() -> String {
    "/api/upload".to_string()
}

fn default_upload_field() -> String {
    "file".to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stale_time_ms: 0,
            gc_time_ms: 5 * 60 * 1000,
        }
    }
}

impl CacheSettings {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout_ms: 10_000,
            token: None,
            upload_path: default_upload_path(),
            upload_field: default_upload_field(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl LabConfig {
    /// Config for a backend at `base_url` with default cache and retry settings.
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiConfig::new(base_url),
            cache: CacheSettings::default(),
            retry: RetrySettings::default(),
        }
    }

    /// Load from `--config <path>` or `LABSITE_CONFIG`, apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let mut config = Self::from_path(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.trim().is_empty() {
                self.api.base_url = base_url;
            }
        }
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.api.token = Some(token);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.api.base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "api.base_url",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.api.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.api.upload_path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.upload_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.api.upload_field.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.upload_field",
                reason: "must not be empty".to_string(),
            });
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff_ms",
                reason: "must be >= initial_backoff_ms".to_string(),
            });
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[api]
base_url = "https://lab.example.edu"
request_timeout_ms = 5000
token = "secret"

[cache]
stale_time_ms = 60000
gc_time_ms = 120000

[retry]
max_retries = 2
initial_backoff_ms = 250
max_backoff_ms = 4000
multiplier = 1.5
"#;

    #[test]
    fn test_parse_full_config() {
        let config = LabConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.api.base_url, "https://lab.example.edu");
        assert_eq!(config.api.token.as_deref(), Some("secret"));
        assert_eq!(config.api.upload_path, "/api/upload");
        assert_eq!(config.api.upload_field, "file");
        assert_eq!(config.cache.stale_time(), Duration::from_secs(60));
        assert_eq!(config.retry.max_retries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_and_retry_default_when_omitted() {
        let config = LabConfig::from_toml_str(
            "[api]\nbase_url = \"http://localhost:4000\"\nrequest_timeout_ms = 1000\n",
        )
        .unwrap();
        assert_eq!(config.cache, CacheSettings::default());
        assert_eq!(config.retry, RetrySettings::default());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = LabConfig::from_toml_str(
            "[api]\nbase_url = \"http://x\"\nrequest_timeout_ms = 1\nbogus = 1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_api_table_rejected() {
        assert!(LabConfig::from_toml_str("[cache]\nstale_time_ms = 1\ngc_time_ms = 1\n").is_err());
    }

    #[test]
    fn test_from_path_reports_io_errors() {
        let err = LabConfig::from_path(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labsite.toml");
        std::fs::write(&path, FULL).unwrap();
        let config = LabConfig::from_path(&path).unwrap();
        assert_eq!(config.api.request_timeout(), Duration::from_secs(5));
    }
}
