//! Retry policy for failed fetches.

use labsite_core::{LabError, RetrySettings};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether failure number `failures` (1-based) should be retried.
pub type RetryPredicate = Arc<dyn Fn(u32, &LabError) -> bool + Send + Sync>;

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// Delay before retrying after failure number `failures` (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

impl From<&RetrySettings> for Backoff {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.initial_backoff_ms),
            max: Duration::from_millis(settings.max_backoff_ms),
            multiplier: settings.multiplier,
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    predicate: RetryPredicate,
    backoff: Backoff,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

/// False for errors no retry can fix: not-found and transform failures.
pub fn is_retryable(error: &LabError) -> bool {
    !(error.is_not_found() || error.is_transform())
}

impl RetryPolicy {
    /// Never retry.
    pub fn never() -> Self {
        Self::custom(
            Arc::new(|_: u32, _: &LabError| false),
            Backoff::from(&RetrySettings::default()),
        )
    }

    /// Retry retryable errors up to `max_retries` times.
    pub fn bounded(max_retries: u32, backoff: Backoff) -> Self {
        Self::custom(
            Arc::new(move |failures: u32, error: &LabError| {
                failures <= max_retries && is_retryable(error)
            }),
            backoff,
        )
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::bounded(settings.max_retries, Backoff::from(settings))
    }

    pub fn custom(predicate: RetryPredicate, backoff: Backoff) -> Self {
        Self { predicate, backoff }
    }

    pub fn should_retry(&self, failures: u32, error: &LabError) -> bool {
        (self.predicate)(failures, error)
    }

    pub fn delay(&self, failures: u32) -> Duration {
        self.backoff.delay(failures)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}
