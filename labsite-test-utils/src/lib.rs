//! Labsite Test Utilities
//!
//! Shared test infrastructure for the labsite workspace:
//! - Proptest generators for keys and records
//! - A scripted fetcher and a mock uploader
//! - An in-process mock of the REST backend
//! - Fixtures for common scenarios

pub mod backend;

pub use axum::http::Method;
pub use backend::{MockBackend, RecordedRequest};

pub use labsite_core::{
    ApiConfig, Attachment, CacheKey, CacheSettings, FileUploader, LabConfig, LabError, LabResult,
    RetrySettings,
};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// SCRIPTED FETCHER
// ============================================================================

/// A fetch function with a scripted sequence of outcomes.
///
/// Each call pops the next scripted outcome; once the script is exhausted
/// the last outcome repeats. Every call is counted.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    calls: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<(LabResult<Value>, Duration)>>>,
    last: Arc<Mutex<Option<(LabResult<Value>, Duration)>>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always succeed with `value`.
    pub fn returning(value: Value) -> Self {
        Self::new().then_ok(value)
    }

    pub fn then_ok(self, value: Value) -> Self {
        self.then(Ok(value), Duration::ZERO)
    }

    pub fn then_err(self, error: LabError) -> Self {
        self.then(Err(error), Duration::ZERO)
    }

    /// Succeed with `value` after `delay`.
    pub fn then_ok_after(self, value: Value, delay: Duration) -> Self {
        self.then(Ok(value), delay)
    }

    pub fn then(self, outcome: LabResult<Value>, delay: Duration) -> Self {
        lock(&self.script).push_back((outcome, delay));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fetch(&self) -> impl Future<Output = LabResult<Value>> + Send + 'static {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();
        let (outcome, delay) = match next {
            Some(step) => {
                *lock(&self.last) = Some(step.clone());
                step
            }
            None => lock(&self.last)
                .clone()
                .unwrap_or_else(|| (Err(LabError::internal("fetcher has no script")), Duration::ZERO)),
        };
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
    }
}

// ============================================================================
// MOCK UPLOADER
// ============================================================================

/// Records uploads and hands back deterministic URLs, or fails on demand.
#[derive(Debug, Clone, Default)]
pub struct MockUploader {
    uploads: Arc<Mutex<Vec<Vec<String>>>>,
    failure: Arc<Mutex<Option<LabError>>>,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent upload fails with `error`.
    pub fn failing(error: LabError) -> Self {
        let uploader = Self::new();
        *lock(&uploader.failure) = Some(error);
        uploader
    }

    /// File names of each upload batch, in call order.
    pub fn uploads(&self) -> Vec<Vec<String>> {
        lock(&self.uploads).clone()
    }
}

#[async_trait]
impl FileUploader for MockUploader {
    async fn upload(&self, files: &[Attachment]) -> LabResult<Vec<String>> {
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error.into_upload_failure());
        }
        let names: Vec<String> = files.iter().map(|f| f.file_name.clone()).collect();
        lock(&self.uploads).push(names.clone());
        Ok(names.iter().map(|n| format!("/uploads/{}", n)).collect())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and content records.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    pub fn arb_resource() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("projects".to_string()),
            Just("news".to_string()),
            Just("gallery".to_string()),
            Just("publications".to_string()),
            Just("team".to_string()),
        ]
    }

    /// A small filter object such as `{ "status": "current" }`.
    pub fn arb_filter() -> impl Strategy<Value = Map<String, Value>> {
        prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,8}", 0..4).prop_map(|fields| {
            fields
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect()
        })
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_resource(), prop::option::of(arb_filter())).prop_map(|(resource, filter)| {
            let key = CacheKey::root(resource);
            match filter {
                Some(filter) => key.with(Value::Object(filter)),
                None => key,
            }
        })
    }

    pub fn arb_category() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("Robotics".to_string()),
            Just("Vision".to_string()),
            Just("Language".to_string()),
            Just("Systems".to_string()),
            "[A-Z][a-z]{2,8}",
        ]
    }

    /// A project record with a server-style id.
    pub fn arb_project() -> impl Strategy<Value = Value> {
        (
            "[a-z0-9]{6,12}",
            "[A-Za-z ]{1,24}",
            prop_oneof![Just("current"), Just("past")],
            arb_category(),
        )
            .prop_map(|(id, title, status, category)| {
                json!({
                    "id": id,
                    "title": title,
                    "status": status,
                    "category": category,
                })
            })
    }

    /// Projects with pairwise distinct ids.
    pub fn arb_project_list(max: usize) -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec(arb_project(), 0..max).prop_map(|records| {
            records
                .into_iter()
                .enumerate()
                .map(|(i, mut record)| {
                    record["id"] = Value::String(format!("p{}", i));
                    record
                })
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use serde_json::json;

    pub fn project(id: &str, title: &str, status: &str) -> Value {
        json!({
            "id": id,
            "title": title,
            "description": format!("{} description", title),
            "status": status,
            "category": "Robotics",
        })
    }

    /// `current` projects followed by `past` projects, ids `c0.. / p0..`.
    pub fn projects(current: usize, past: usize) -> Vec<Value> {
        let current = (0..current).map(|i| project(&format!("c{}", i), &format!("Current {}", i), "current"));
        let past = (0..past).map(|i| project(&format!("p{}", i), &format!("Past {}", i), "past"));
        current.chain(past).collect()
    }

    pub fn news_item(id: &str, title: &str, date: &str) -> Value {
        json!({ "id": id, "title": title, "body": "", "date": date })
    }

    pub fn gallery_image(id: &str, url: &str, category: &str) -> Value {
        json!({ "id": id, "url": url, "caption": "", "category": category })
    }

    /// Config pointing at `base_url` with fast retries and no staleness.
    pub fn config_for(base_url: &str) -> LabConfig {
        let mut config = LabConfig::for_base_url(base_url);
        config.retry = RetrySettings {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        };
        config
    }

    pub fn attachment(name: &str) -> Attachment {
        Attachment::new(name, name.as_bytes().to_vec()).with_content_type("image/png")
    }
}
