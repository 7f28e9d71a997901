//! Read path behavior: deduplication, staleness, retry, supersession,
//! observers and garbage collection. Timing runs on tokio's paused clock.

use futures_util::future::join_all;
use futures_util::poll;
use labsite_cache::{
    Backoff, CacheStore, EntryStatus, QueryClient, QueryDescriptor, RetryPolicy,
};
use labsite_core::{CacheKey, CacheSettings, LabError};
use labsite_test_utils::ScriptedFetcher;
use serde_json::{json, Value};
use std::time::Duration;

fn projects_key() -> CacheKey {
    CacheKey::root("projects").with(json!({"status": "current"}))
}

fn descriptor(key: CacheKey, fetcher: &ScriptedFetcher) -> QueryDescriptor {
    let fetcher = fetcher.clone();
    QueryDescriptor::new(key, move || fetcher.fetch())
}

fn fast_backoff() -> Backoff {
    Backoff {
        initial: Duration::from_millis(100),
        max: Duration::from_secs(1),
        multiplier: 2.0,
    }
}

fn store_with_gc(gc_ms: u64) -> CacheStore {
    CacheStore::new(CacheSettings {
        stale_time_ms: 0,
        gc_time_ms: gc_ms,
    })
}

// ============================================================================
// DEDUPLICATION AND STALENESS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_first_read_fetches_once() {
    let fetcher = ScriptedFetcher::returning(json!([1, 2, 3]));
    let client = QueryClient::new(CacheStore::default());

    let data = client
        .fetch(&descriptor(projects_key(), &fetcher))
        .await
        .unwrap();
    assert_eq!(*data, json!([1, 2, 3]));
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(client.store().stats().fetches, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_fetch() {
    let fetcher =
        ScriptedFetcher::new().then_ok_after(json!(["shared"]), Duration::from_millis(50));
    let client = QueryClient::new(CacheStore::default());
    let query = descriptor(projects_key(), &fetcher);

    let results = join_all((0..8).map(|_| client.fetch(&query))).await;
    assert_eq!(fetcher.calls(), 1);
    for result in results {
        assert_eq!(*result.unwrap(), json!(["shared"]));
    }
}

#[tokio::test(start_paused = true)]
async fn test_reads_within_stale_time_hit_cache() {
    let fetcher = ScriptedFetcher::returning(json!(["v"]));
    let client = QueryClient::new(CacheStore::default());
    let query = descriptor(projects_key(), &fetcher).with_stale_time(Duration::from_secs(1));

    client.fetch(&query).await.unwrap();
    tokio::time::advance(Duration::from_millis(500)).await;
    client.fetch(&query).await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    tokio::time::advance(Duration::from_millis(500)).await;
    client.fetch(&query).await.unwrap();
    assert_eq!(fetcher.calls(), 2);

    let stats = client.store().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_stale_time_always_refetches() {
    let fetcher = ScriptedFetcher::returning(json!([]));
    let client = QueryClient::new(CacheStore::default());
    let query = descriptor(projects_key(), &fetcher);

    client.fetch(&query).await.unwrap();
    client.fetch(&query).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_member_order_does_not_split_entries() {
    let fetcher = ScriptedFetcher::returning(json!([]));
    let client = QueryClient::new(CacheStore::default());
    let a = CacheKey::new(vec![json!("projects"), json!({"status": "past", "page": 1})]);
    let b = CacheKey::new(vec![json!("projects"), json!({"page": 1, "status": "past"})]);

    client
        .fetch(&descriptor(a, &fetcher).with_stale_time(Duration::from_secs(60)))
        .await
        .unwrap();
    client
        .fetch(&descriptor(b, &fetcher).with_stale_time(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(client.store().len(), 1);
}

// ============================================================================
// RETRY AND TRANSFORM
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let fetcher = ScriptedFetcher::new()
        .then_err(LabError::request_failed(503, None))
        .then_err(LabError::network("reset"))
        .then_ok(json!(["ok"]));
    let client = QueryClient::new(CacheStore::default());
    let query =
        descriptor(projects_key(), &fetcher).with_retry(RetryPolicy::bounded(3, fast_backoff()));

    let data = client.fetch(&query).await.unwrap();
    assert_eq!(*data, json!(["ok"]));
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_not_retried() {
    let fetcher = ScriptedFetcher::new()
        .then_err(LabError::request_failed(404, Some("gone".into())))
        .then_ok(json!([]));
    let client = QueryClient::new(CacheStore::default());
    let query =
        descriptor(projects_key(), &fetcher).with_retry(RetryPolicy::bounded(3, fast_backoff()));

    let err = client.fetch(&query).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(fetcher.calls(), 1);
    let entry = client.store().get(&projects_key()).unwrap();
    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.error, Some(err));
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let fetcher = ScriptedFetcher::new().then_err(LabError::request_failed(500, None));
    let client = QueryClient::new(CacheStore::default());
    let query =
        descriptor(projects_key(), &fetcher).with_retry(RetryPolicy::bounded(2, fast_backoff()));

    let started = tokio::time::Instant::now();
    let err = client.fetch(&query).await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert_eq!(fetcher.calls(), 3);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_transform_failure_is_not_retried() {
    let fetcher = ScriptedFetcher::returning(json!({"unexpected": true}));
    let client = QueryClient::new(CacheStore::default());
    let query = descriptor(projects_key(), &fetcher)
        .with_retry(RetryPolicy::bounded(5, fast_backoff()))
        .with_transform(|data: Value| match data {
            Value::Array(_) => Ok(data),
            _ => Err(LabError::transform("expected a list")),
        });

    let err = client.fetch(&query).await.unwrap_err();
    assert!(err.is_transform());
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transform_failure_ignores_custom_retry_predicate() {
    let fetcher = ScriptedFetcher::returning(json!({"unexpected": true}));
    let client = QueryClient::new(CacheStore::default());
    let retry_everything = RetryPolicy::custom(
        std::sync::Arc::new(|failures: u32, _: &LabError| failures <= 3),
        fast_backoff(),
    );
    let query = descriptor(projects_key(), &fetcher)
        .with_retry(retry_everything)
        .with_transform(|_: Value| Err(LabError::transform("bad")));

    let err = client.fetch(&query).await.unwrap_err();
    assert_eq!(err, LabError::transform("bad"));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transform_result_is_cached() {
    let fetcher = ScriptedFetcher::returning(json!([3, 1, 2]));
    let client = QueryClient::new(CacheStore::default());
    let query = descriptor(projects_key(), &fetcher).with_transform(|data: Value| {
        let mut items = data.as_array().cloned().unwrap_or_default();
        items.sort_by_key(|v| v.as_i64());
        Ok(Value::Array(items))
    });

    client.fetch(&query).await.unwrap();
    assert_eq!(
        client.store().data(&projects_key()).as_deref(),
        Some(&json!([1, 2, 3]))
    );
}

// ============================================================================
// SUPERSESSION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_last_issued_fetch_wins() {
    let fetcher = ScriptedFetcher::new()
        .then_ok_after(json!("slow"), Duration::from_millis(200))
        .then_ok_after(json!("fast"), Duration::from_millis(10));
    let client = QueryClient::new(CacheStore::default());
    let query = descriptor(projects_key(), &fetcher);

    let first = client.fetch(&query);
    tokio::pin!(first);
    assert!(poll!(&mut first).is_pending());

    let second = client.refetch(&query).await.unwrap();
    assert_eq!(*second, json!("fast"));

    first.await.unwrap();
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(
        client.store().data(&projects_key()).as_deref(),
        Some(&json!("fast"))
    );
}

// ============================================================================
// OBSERVERS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_observer_loads_then_settles() {
    let fetcher = ScriptedFetcher::new().then_ok_after(json!([1, 2]), Duration::from_millis(20));
    let client = QueryClient::new(CacheStore::default());

    let mut observer = client.observe(descriptor(projects_key(), &fetcher));
    let state = observer.state();
    assert!(state.is_loading);
    assert!(state.is_fetching);

    let state = observer.settled().await;
    assert!(!state.is_loading);
    assert_eq!(state.data.as_deref(), Some(&json!([1, 2])));
    assert_eq!(state.status, EntryStatus::Fresh);
}

#[tokio::test(start_paused = true)]
async fn test_observer_surfaces_error() {
    let fetcher = ScriptedFetcher::new().then_err(LabError::request_failed(404, None));
    let client = QueryClient::new(CacheStore::default());

    let mut observer = client.observe(descriptor(projects_key(), &fetcher));
    let state = observer.settled().await;
    assert_eq!(state.status, EntryStatus::Error);
    assert!(state.error.unwrap().is_not_found());
    assert!(!state.is_loading);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_refetches_observed_entry() {
    let fetcher = ScriptedFetcher::new()
        .then_ok(json!(["before"]))
        .then_ok_after(json!(["after"]), Duration::from_millis(5));
    let client = QueryClient::new(CacheStore::default());
    let mut observer = client.observe(descriptor(projects_key(), &fetcher));
    observer.settled().await;

    client.store().invalidate(&CacheKey::root("projects"));
    let state = observer.state();
    assert!(state.is_fetching);
    assert!(!state.is_loading);
    assert_eq!(state.data.as_deref(), Some(&json!(["before"])));

    let state = observer.settled().await;
    assert_eq!(state.data.as_deref(), Some(&json!(["after"])));
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_entry_refetches_lazily() {
    let fetcher = ScriptedFetcher::returning(json!([]));
    let client = QueryClient::new(CacheStore::default());
    let query = descriptor(projects_key(), &fetcher).with_stale_time(Duration::from_secs(60));

    client.fetch(&query).await.unwrap();
    client.store().invalidate(&projects_key());
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(
        client.store().get(&projects_key()).unwrap().status,
        EntryStatus::Stale
    );

    client.fetch(&query).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_set_descriptor_rebinds_to_new_key() {
    let current = ScriptedFetcher::returning(json!(["current"]));
    let past = ScriptedFetcher::returning(json!(["past"]));
    let client = QueryClient::new(CacheStore::default());

    let mut observer = client.observe(descriptor(projects_key(), &current));
    observer.settled().await;

    let past_key = CacheKey::root("projects").with(json!({"status": "past"}));
    observer.set_descriptor(descriptor(past_key.clone(), &past));
    assert_eq!(observer.key(), &past_key);
    let state = observer.settled().await;
    assert_eq!(state.data.as_deref(), Some(&json!(["past"])));

    let old = client.store().get(&projects_key()).unwrap();
    assert_eq!(old.subscriber_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_set_descriptor_on_same_key_refetches_with_new_fetcher() {
    let old = ScriptedFetcher::returning(json!(["old"]));
    let new = ScriptedFetcher::returning(json!(["new"]));
    let client = QueryClient::new(CacheStore::default());
    let minute = Duration::from_secs(60);

    let mut observer = client.observe(descriptor(projects_key(), &old).with_stale_time(minute));
    observer.settled().await;
    observer.set_descriptor(descriptor(projects_key(), &new).with_stale_time(minute));
    assert_eq!(new.calls(), 0);
    assert_eq!(client.store().get(&projects_key()).unwrap().subscriber_count, 1);

    client.store().invalidate(&projects_key());
    let state = observer.settled().await;
    assert_eq!(state.data.as_deref(), Some(&json!(["new"])));
    assert_eq!(old.calls(), 1);
    assert_eq!(new.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_observer_fetch_still_cached() {
    let fetcher = ScriptedFetcher::new().then_ok_after(json!(["late"]), Duration::from_millis(50));
    let client = QueryClient::new(CacheStore::default());

    drop(client.observe(descriptor(projects_key(), &fetcher)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let entry = client.store().get(&projects_key()).unwrap();
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert_eq!(entry.data.as_deref(), Some(&json!(["late"])));
}

// ============================================================================
// GARBAGE COLLECTION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_inactive_entry_evicted_after_gc_time() {
    let fetcher = ScriptedFetcher::returning(json!([]));
    let client = QueryClient::new(store_with_gc(1_000));

    let mut observer = client.observe(descriptor(projects_key(), &fetcher));
    observer.settled().await;
    drop(observer);

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(client.store().contains(&projects_key()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.store().contains(&projects_key()));
    assert_eq!(client.store().stats().evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_cancels_eviction() {
    let fetcher = ScriptedFetcher::returning(json!([]));
    let client = QueryClient::new(store_with_gc(1_000));

    let mut observer = client.observe(descriptor(projects_key(), &fetcher));
    observer.settled().await;
    drop(observer);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let observer = client.observe(descriptor(projects_key(), &fetcher));
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(client.store().contains(&projects_key()));

    drop(observer);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(!client.store().contains(&projects_key()));
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_fetch_entry_is_collected() {
    let fetcher = ScriptedFetcher::returning(json!([]));
    let client = QueryClient::new(store_with_gc(300));

    client
        .fetch(&descriptor(projects_key(), &fetcher))
        .await
        .unwrap();
    assert!(client.store().contains(&projects_key()));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.store().is_empty());
}
