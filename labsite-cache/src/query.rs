//! Read path: read-through fetches, in-flight deduplication and observers.
//!
//! A fetch runs as a spawned task so it completes (and is cached) even when
//! every caller waiting on it has gone away. Concurrent readers of one key
//! share a single `Shared` future; only the last-issued fetch for a key may
//! write its result to the store.

use crate::retry::RetryPolicy;
use crate::store::{CacheEntry, CacheStore, EntryStatus, Listener, RefetchHook, Subscription};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use labsite_core::{CacheKey, LabError, LabResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, LabResult<Value>> + Send + Sync>;

/// Post-processing applied to fetched data before it is stored.
pub type TransformFn = Arc<dyn Fn(Value) -> LabResult<Value> + Send + Sync>;

/// Everything needed to read one key: how to fetch it and how long to trust it.
///
/// Unset timings and retry fall back to the client's defaults.
#[derive(Clone)]
pub struct QueryDescriptor {
    key: CacheKey,
    fetch: FetchFn,
    stale_time: Option<Duration>,
    gc_time: Option<Duration>,
    retry: Option<RetryPolicy>,
    transform: Option<TransformFn>,
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("retry", &self.retry)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl QueryDescriptor {
    pub fn new<F, Fut>(key: CacheKey, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LabResult<Value>> + Send + 'static,
    {
        Self::from_fetch_fn(key, Arc::new(move || fetch().boxed()))
    }

    pub fn from_fetch_fn(key: CacheKey, fetch: FetchFn) -> Self {
        Self {
            key,
            fetch,
            stale_time: None,
            gc_time: None,
            retry: None,
            transform: None,
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Post-process fetched data. Failures surface as
    /// [`LabError::TransformError`] and are never retried.
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> LabResult<Value> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

type SharedFetch = Shared<BoxFuture<'static, LabResult<Arc<Value>>>>;

/// Read-through access to the [`CacheStore`].
#[derive(Clone)]
pub struct QueryClient {
    store: CacheStore,
    inflight: Arc<Mutex<HashMap<String, (u64, SharedFetch)>>>,
    retry: RetryPolicy,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("store", &self.store)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl QueryClient {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for descriptors that do not set one.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    fn stale_time(&self, descriptor: &QueryDescriptor) -> Duration {
        descriptor
            .stale_time
            .unwrap_or_else(|| self.store.settings().stale_time())
    }

    fn gc_time(&self, descriptor: &QueryDescriptor) -> Duration {
        descriptor
            .gc_time
            .unwrap_or_else(|| self.store.settings().gc_time())
    }

    /// Return fresh cached data, or fetch it.
    ///
    /// Readers arriving while a fetch for the key is in flight wait for that
    /// fetch instead of starting another.
    pub async fn fetch(&self, descriptor: &QueryDescriptor) -> LabResult<Arc<Value>> {
        match self.ensure_fresh(descriptor) {
            Ok(data) => Ok(data),
            Err(pending) => pending.await,
        }
    }

    /// Fetch unconditionally, superseding any fetch in flight for the key.
    pub async fn refetch(&self, descriptor: &QueryDescriptor) -> LabResult<Arc<Value>> {
        self.start(descriptor, true).await
    }

    /// Bind an observer to the descriptor's key.
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe(&self, descriptor: QueryDescriptor) -> QueryObserver {
        let (state, receiver) = watch::channel(QueryState::default());
        let mut observer = QueryObserver {
            client: self.clone(),
            descriptor,
            state: Arc::new(state),
            receiver,
            subscription: None,
        };
        observer.bind();
        observer
    }

    /// Fresh data, or the fetch that will produce it.
    fn ensure_fresh(&self, descriptor: &QueryDescriptor) -> Result<Arc<Value>, SharedFetch> {
        let stale_time = self.stale_time(descriptor);
        match self.store.lookup_fresh(&descriptor.key, stale_time) {
            Some(data) => {
                tracing::trace!(key = %descriptor.key, "cache hit");
                Ok(data)
            }
            None => Err(self.start(descriptor, false)),
        }
    }

    fn start(&self, descriptor: &QueryDescriptor, force: bool) -> SharedFetch {
        let key = &descriptor.key;
        let mut inflight = lock(&self.inflight);
        if !force {
            if let Some((generation, pending)) = inflight.get(key.canonical()) {
                if self.store.fetch_generation(key) == Some(*generation) {
                    tracing::trace!(key = %key, "joining in-flight fetch");
                    return pending.clone();
                }
            }
        }

        let generation = self.store.begin_fetch(key, self.gc_time(descriptor));
        let pending = self.spawn_fetch(descriptor, generation);
        inflight.insert(key.canonical().to_string(), (generation, pending.clone()));
        pending
    }

    fn spawn_fetch(&self, descriptor: &QueryDescriptor, generation: u64) -> SharedFetch {
        let store = self.store.clone();
        let inflight = Arc::clone(&self.inflight);
        let key = descriptor.key.clone();
        let fetch = Arc::clone(&descriptor.fetch);
        let transform = descriptor.transform.clone();
        let retry = descriptor.retry.clone().unwrap_or_else(|| self.retry.clone());

        tracing::debug!(key = %key, generation, "starting fetch");
        let task = tokio::spawn(async move {
            let outcome = run_fetch(&key, &fetch, transform.as_ref(), &retry)
                .await
                .map(Arc::new);
            store.complete_fetch(&key, generation, &outcome);
            let mut inflight = lock(&inflight);
            if inflight
                .get(key.canonical())
                .is_some_and(|(current, _)| *current == generation)
            {
                inflight.remove(key.canonical());
            }
            outcome
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(LabError::internal(format!("fetch task failed: {}", e))))
        }
        .boxed()
        .shared()
    }
}

async fn run_fetch(
    key: &CacheKey,
    fetch: &FetchFn,
    transform: Option<&TransformFn>,
    retry: &RetryPolicy,
) -> LabResult<Value> {
    let mut failures = 0u32;
    loop {
        let attempt = fetch().await.and_then(|data| match transform {
            Some(transform) => transform(data).map_err(|e| match e {
                LabError::TransformError { .. } => e,
                other => LabError::transform(other.to_string()),
            }),
            None => Ok(data),
        });

        let error = match attempt {
            Ok(data) => return Ok(data),
            Err(error) => error,
        };
        failures += 1;
        if error.is_transform() || !retry.should_retry(failures, &error) {
            tracing::warn!(key = %key, failures, error = %error, "fetch failed");
            return Err(error);
        }
        let delay = retry.delay(failures);
        tracing::debug!(
            key = %key,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying fetch"
        );
        tokio::time::sleep(delay).await;
    }
}

/// What an observer currently knows about its key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub data: Option<Arc<Value>>,
    pub error: Option<LabError>,
    /// Fetching with nothing to show yet.
    pub is_loading: bool,
    pub is_fetching: bool,
    pub status: EntryStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_fetching: false,
            status: EntryStatus::Stale,
            updated_at: None,
        }
    }
}

impl QueryState {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        let is_fetching = entry.status == EntryStatus::Loading;
        Self {
            data: entry.data.clone(),
            error: entry.error.clone(),
            is_loading: is_fetching && entry.data.is_none(),
            is_fetching,
            status: entry.status,
            updated_at: entry.updated_at,
        }
    }

    /// No fetch in flight and a fetch has produced data or an error.
    pub fn is_settled(&self) -> bool {
        !self.is_fetching && matches!(self.status, EntryStatus::Fresh | EntryStatus::Error)
    }
}

/// A live binding to one key.
///
/// State updates arrive through a watch channel. Dropping the observer
/// unsubscribes; a fetch it started still completes and is cached.
pub struct QueryObserver {
    client: QueryClient,
    descriptor: QueryDescriptor,
    state: Arc<watch::Sender<QueryState>>,
    receiver: watch::Receiver<QueryState>,
    subscription: Option<Subscription>,
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.descriptor.key)
            .field("state", &*self.receiver.borrow())
            .finish()
    }
}

impl QueryObserver {
    /// Subscribe with the current descriptor. The new registration lands
    /// before the old one is released, so the entry never looks inactive.
    fn bind(&mut self) {
        let state = Arc::clone(&self.state);
        let listener: Listener = Arc::new(move |entry: &CacheEntry| {
            state.send_replace(QueryState::from_entry(entry));
        });
        let client = self.client.clone();
        let descriptor = self.descriptor.clone();
        let refetch: RefetchHook = Arc::new(move || {
            let _ = client.ensure_fresh(&descriptor);
        });

        let store = self.client.store();
        let subscription = store.subscribe_with_refetch(&self.descriptor.key, listener, refetch);
        if let Some(entry) = store.get(&self.descriptor.key) {
            self.state.send_replace(QueryState::from_entry(&entry));
        }
        self.subscription = Some(subscription);

        if self.client.ensure_fresh(&self.descriptor).is_ok() {
            if let Some(entry) = store.get(&self.descriptor.key) {
                self.state.send_replace(QueryState::from_entry(&entry));
            }
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.descriptor.key
    }

    pub fn state(&self) -> QueryState {
        self.receiver.borrow().clone()
    }

    pub fn data(&self) -> Option<Arc<Value>> {
        self.receiver.borrow().data.clone()
    }

    /// A receiver for the observer's state, for use in `select!` loops.
    pub fn watch(&self) -> watch::Receiver<QueryState> {
        self.receiver.clone()
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> QueryState {
        // The sender lives as long as `self`, so this cannot fail.
        let _ = self.receiver.changed().await;
        self.receiver.borrow_and_update().clone()
    }

    /// Wait until no fetch is in flight and data or an error is present.
    pub async fn settled(&mut self) -> QueryState {
        let settled = self
            .receiver
            .wait_for(QueryState::is_settled)
            .await
            .map(|state| state.clone());
        settled.unwrap_or_else(|_| self.state())
    }

    /// Force a fetch for the bound key.
    pub async fn refetch(&self) -> LabResult<Arc<Value>> {
        self.client.refetch(&self.descriptor).await
    }

    /// Rebind to a new descriptor, fetching if its key has no fresh data.
    ///
    /// Later invalidations refetch through the new descriptor even when the
    /// key is unchanged.
    pub fn set_descriptor(&mut self, descriptor: QueryDescriptor) {
        self.descriptor = descriptor;
        self.bind();
    }
}
