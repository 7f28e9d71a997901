//! Key-addressed store of query results.
//!
//! The store owns every [`CacheEntry`]. Readers get cloned entries whose
//! `data` is a shared `Arc<Value>`; data is only ever replaced wholesale.
//! Listeners registered through [`CacheStore::subscribe`] are invoked after
//! the store lock is released, once per change to their key.

use chrono::{DateTime, Utc};
use labsite_core::{CacheKey, CacheSettings, LabError, LabResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Fetch lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Fresh,
    Stale,
    Loading,
    Error,
}

impl EntryStatus {
    /// Whether the fetch lifecycle allows moving from `self` to `next`.
    ///
    /// Direct writes (`set`, `patch`, `prime`) bypass this table and always
    /// land in `Fresh`.
    pub fn can_transition_to(self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, next),
            (Loading, Fresh)
                | (Loading, Error)
                | (Loading, Stale)
                | (Fresh, Stale)
                | (Stale, Loading)
                | (Error, Loading)
                | (Error, Stale)
        ) || self == next
    }
}

/// One cached query result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data: Option<Arc<Value>>,
    /// Monotonic time of the last successful fetch or direct write.
    pub fetched_at: Option<Instant>,
    /// Wall-clock time of the last data change.
    pub updated_at: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub error: Option<LabError>,
    pub subscriber_count: usize,
}

impl CacheEntry {
    fn new(key: CacheKey, status: EntryStatus) -> Self {
        Self {
            key,
            data: None,
            fetched_at: None,
            updated_at: None,
            status,
            error: None,
            subscriber_count: 0,
        }
    }

    /// Time since the last successful fetch or write.
    pub fn age(&self) -> Option<Duration> {
        self.fetched_at.map(|at| at.elapsed())
    }

    /// True when the entry is `Fresh` and younger than `stale_time`.
    pub fn is_fresh_within(&self, stale_time: Duration) -> bool {
        self.status == EntryStatus::Fresh && self.age().is_some_and(|age| age < stale_time)
    }
}

/// The data-bearing part of an entry, captured before an optimistic patch.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub data: Option<Arc<Value>>,
    pub fetched_at: Option<Instant>,
    pub status: EntryStatus,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads answered from a fresh entry.
    pub hits: u64,
    /// Reads that needed a fetch.
    pub misses: u64,
    /// Fetches started.
    pub fetches: u64,
    /// Entries removed by garbage collection or `remove`.
    pub evictions: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Callback invoked with the updated entry.
pub type Listener = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

/// Hook an observer registers so invalidation can refetch its entry.
pub type RefetchHook = Arc<dyn Fn() + Send + Sync>;

struct Slot {
    entry: CacheEntry,
    listeners: Vec<(u64, Listener)>,
    refetch_hooks: Vec<(u64, RefetchHook)>,
    fetch_generation: u64,
    gc_generation: u64,
    gc_time: Duration,
    inactive_since: Option<Instant>,
}

impl Slot {
    fn new(key: CacheKey, status: EntryStatus, gc_time: Duration) -> Self {
        Self {
            entry: CacheEntry::new(key, status),
            listeners: Vec::new(),
            refetch_hooks: Vec::new(),
            fetch_generation: 0,
            gc_generation: 0,
            gc_time,
            inactive_since: Some(Instant::now()),
        }
    }

    fn transition(&mut self, next: EntryStatus) {
        if !self.entry.status.can_transition_to(next) {
            tracing::debug!(
                key = %self.entry.key,
                from = ?self.entry.status,
                to = ?next,
                "unexpected status transition"
            );
        }
        self.entry.status = next;
    }

    fn write(&mut self, data: Arc<Value>) {
        self.entry.data = Some(data);
        self.entry.fetched_at = Some(Instant::now());
        self.entry.updated_at = Some(Utc::now());
        self.entry.status = EntryStatus::Fresh;
        self.entry.error = None;
    }

    fn listeners(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn is_collectable(&self) -> bool {
        self.entry.subscriber_count == 0 && self.entry.status != EntryStatus::Loading
    }
}

/// Listener calls gathered under the lock and made after releasing it.
#[derive(Default)]
struct Notifications {
    calls: Vec<(Vec<Listener>, CacheEntry)>,
    hooks: Vec<RefetchHook>,
}

impl Notifications {
    fn push(&mut self, slot: &Slot) {
        if !slot.listeners.is_empty() {
            self.calls.push((slot.listeners(), slot.entry.clone()));
        }
    }

    fn dispatch(self) {
        for (listeners, entry) in self.calls {
            for listener in listeners {
                listener(&entry);
            }
        }
        for hook in self.hooks {
            hook();
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    settings: CacheSettings,
    next_subscription: AtomicU64,
    counters: Counters,
}

/// Shared handle to the cache. Clones refer to the same store.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("settings", &self.inner.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(CacheSettings::default())
    }
}

impl CacheStore {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                settings,
                next_subscription: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The entry for `key`, if present. No side effects.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.slots().get(key.canonical()).map(|slot| slot.entry.clone())
    }

    /// Cached data for `key`, if any.
    pub fn data(&self, key: &CacheKey) -> Option<Arc<Value>> {
        self.slots()
            .get(key.canonical())
            .and_then(|slot| slot.entry.data.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots().contains_key(key.canonical())
    }

    /// Replace the data of an existing entry and mark it `Fresh`.
    ///
    /// Returns `false` (and does nothing) when `key` has no entry.
    pub fn set(&self, key: &CacheKey, data: Value) -> bool {
        self.write_shared(key, Arc::new(data))
    }

    fn write_shared(&self, key: &CacheKey, data: Arc<Value>) -> bool {
        let mut notifications = Notifications::default();
        {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(key.canonical()) else {
                return false;
            };
            slot.write(data);
            notifications.push(slot);
        }
        notifications.dispatch();
        true
    }

    /// Compute new data from the current data and store it.
    ///
    /// The read, the updater and the write happen under one lock, so
    /// concurrent patches never lose each other's changes. The updater must
    /// not call back into the store. Returning `None` leaves the entry
    /// untouched. Returns whether a write happened.
    pub fn patch<F>(&self, key: &CacheKey, updater: F) -> bool
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let mut notifications = Notifications::default();
        {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(key.canonical()) else {
                return false;
            };
            let Some(next) = updater(slot.entry.data.as_deref()) else {
                return false;
            };
            slot.write(Arc::new(next));
            notifications.push(slot);
        }
        notifications.dispatch();
        true
    }

    /// Create the entry if needed and store `data` in it.
    pub fn prime(&self, key: &CacheKey, data: Value) {
        let gc_time = self.inner.settings.gc_time();
        self.slots()
            .entry(key.canonical().to_string())
            .or_insert_with(|| Slot::new(key.clone(), EntryStatus::Fresh, gc_time));
        self.schedule_gc_if_inactive(key);
        self.set(key, data);
    }

    /// Mark every entry under `prefix` stale.
    ///
    /// Entries with subscribers are refetched immediately through their
    /// observers' refetch hooks; a fetch in flight for a matching entry is
    /// superseded and its result discarded. Returns the number of entries
    /// marked.
    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        let mut notifications = Notifications::default();
        let mut marked = 0;
        {
            let mut slots = self.slots();
            for slot in slots.values_mut() {
                if !slot.entry.key.starts_with(prefix) {
                    continue;
                }
                if slot.entry.status == EntryStatus::Loading {
                    slot.fetch_generation += 1;
                }
                slot.transition(EntryStatus::Stale);
                marked += 1;
                notifications.push(slot);
                if slot.entry.subscriber_count > 0 {
                    if let Some((_, hook)) = slot.refetch_hooks.last() {
                        notifications.hooks.push(Arc::clone(hook));
                    }
                }
            }
        }
        tracing::debug!(
            prefix = %prefix,
            marked,
            refetching = notifications.hooks.len(),
            "invalidated cache entries"
        );
        notifications.dispatch();
        marked
    }

    /// Register `listener` for changes to `key`, creating the entry if absent.
    pub fn subscribe(&self, key: &CacheKey, listener: Listener) -> Subscription {
        self.register(key, listener, None)
    }

    /// Like [`CacheStore::subscribe`], also registering a hook that
    /// invalidation calls to refetch the entry.
    pub fn subscribe_with_refetch(
        &self,
        key: &CacheKey,
        listener: Listener,
        refetch: RefetchHook,
    ) -> Subscription {
        self.register(key, listener, Some(refetch))
    }

    fn register(
        &self,
        key: &CacheKey,
        listener: Listener,
        refetch: Option<RefetchHook>,
    ) -> Subscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let gc_time = self.inner.settings.gc_time();
        let mut slots = self.slots();
        let slot = slots
            .entry(key.canonical().to_string())
            .or_insert_with(|| Slot::new(key.clone(), EntryStatus::Stale, gc_time));
        slot.entry.subscriber_count += 1;
        slot.gc_generation += 1;
        slot.inactive_since = None;
        slot.listeners.push((id, listener));
        if let Some(hook) = refetch {
            slot.refetch_hooks.push((id, hook));
        }
        Subscription {
            store: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
            active: true,
        }
    }

    /// Existing keys under `prefix`, in canonical order.
    pub fn keys_matching(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .slots()
            .values()
            .filter(|slot| slot.entry.key.starts_with(prefix))
            .map(|slot| slot.entry.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Evict `key` regardless of subscribers. Returns whether it existed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.slots().remove(key.canonical()).is_some();
        if removed {
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "removed cache entry");
        }
        removed
    }

    /// Evict every inactive entry whose GC delay has elapsed.
    ///
    /// Delayed eviction normally runs on the tokio runtime; this sweep
    /// covers stores used without one. Returns the number evicted.
    pub fn collect_garbage(&self) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| {
            let expired = slot.is_collectable()
                && slot
                    .inactive_since
                    .is_some_and(|since| since.elapsed() >= slot.gc_time);
            !expired
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            self.inner
                .counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, "collected inactive cache entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        self.slots().get(key.canonical()).map(|slot| EntrySnapshot {
            key: slot.entry.key.clone(),
            data: slot.entry.data.clone(),
            fetched_at: slot.entry.fetched_at,
            status: slot.entry.status,
        })
    }

    /// Put a snapshotted entry back. A fetch in flight keeps its `Loading`
    /// status.
    pub fn restore(&self, snapshot: &EntrySnapshot) -> bool {
        let mut notifications = Notifications::default();
        {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(snapshot.key.canonical()) else {
                return false;
            };
            slot.entry.data = snapshot.data.clone();
            slot.entry.fetched_at = snapshot.fetched_at;
            slot.entry.updated_at = Some(Utc::now());
            if slot.entry.status != EntryStatus::Loading {
                slot.entry.status = snapshot.status;
            }
            notifications.push(slot);
        }
        notifications.dispatch();
        true
    }

    // ------------------------------------------------------------------
    // Fetch bookkeeping used by the query layer
    // ------------------------------------------------------------------

    /// Data of a fresh entry, counting the read as a hit or miss.
    ///
    /// A `Fresh` entry older than `stale_time` is marked `Stale`.
    pub(crate) fn lookup_fresh(&self, key: &CacheKey, stale_time: Duration) -> Option<Arc<Value>> {
        let mut slots = self.slots();
        let fresh = slots.get_mut(key.canonical()).and_then(|slot| {
            if slot.entry.is_fresh_within(stale_time) {
                return slot.entry.data.clone();
            }
            if slot.entry.status == EntryStatus::Fresh {
                slot.transition(EntryStatus::Stale);
            }
            None
        });
        let counter = if fresh.is_some() {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        fresh
    }

    /// Generation of the fetch currently accepted for `key`.
    pub(crate) fn fetch_generation(&self, key: &CacheKey) -> Option<u64> {
        self.slots()
            .get(key.canonical())
            .map(|slot| slot.fetch_generation)
    }

    /// Start a fetch for `key`, creating the entry in `Loading` if absent.
    ///
    /// Any earlier fetch for the key is superseded. Returns the new fetch's
    /// generation.
    pub(crate) fn begin_fetch(&self, key: &CacheKey, gc_time: Duration) -> u64 {
        let mut notifications = Notifications::default();
        let generation = {
            let mut slots = self.slots();
            let slot = slots
                .entry(key.canonical().to_string())
                .or_insert_with(|| Slot::new(key.clone(), EntryStatus::Loading, gc_time));
            slot.gc_time = gc_time;
            slot.fetch_generation += 1;
            if slot.entry.status == EntryStatus::Fresh {
                slot.transition(EntryStatus::Stale);
            }
            slot.transition(EntryStatus::Loading);
            notifications.push(slot);
            slot.fetch_generation
        };
        self.inner.counters.fetches.fetch_add(1, Ordering::Relaxed);
        notifications.dispatch();
        generation
    }

    /// Record a fetch outcome if `generation` is still the accepted one.
    ///
    /// Returns `false` when the fetch was superseded (or its entry evicted)
    /// and the outcome was discarded.
    pub(crate) fn complete_fetch(
        &self,
        key: &CacheKey,
        generation: u64,
        outcome: &LabResult<Arc<Value>>,
    ) -> bool {
        let mut notifications = Notifications::default();
        {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(key.canonical()) else {
                return false;
            };
            if slot.fetch_generation != generation {
                tracing::debug!(
                    key = %key,
                    generation,
                    current = slot.fetch_generation,
                    "discarding superseded fetch result"
                );
                return false;
            }
            match outcome {
                Ok(data) => {
                    slot.transition(EntryStatus::Fresh);
                    slot.write(Arc::clone(data));
                }
                Err(error) => {
                    slot.transition(EntryStatus::Error);
                    slot.entry.error = Some(error.clone());
                }
            }
            notifications.push(slot);
        }
        notifications.dispatch();
        self.schedule_gc_if_inactive(key);
        true
    }

    fn schedule_gc_if_inactive(&self, key: &CacheKey) {
        let scheduled = {
            let mut slots = self.slots();
            match slots.get_mut(key.canonical()) {
                Some(slot) if slot.entry.subscriber_count == 0 => {
                    slot.gc_generation += 1;
                    slot.inactive_since = Some(Instant::now());
                    Some((slot.gc_generation, slot.gc_time))
                }
                _ => None,
            }
        };
        if let Some((generation, gc_time)) = scheduled {
            spawn_gc(Arc::downgrade(&self.inner), key.clone(), generation, gc_time);
        }
    }
}

/// Evict `key` after `gc_time` unless it was resubscribed in the meantime.
///
/// Without a runtime the entry waits for [`CacheStore::collect_garbage`].
fn spawn_gc(store: Weak<Inner>, key: CacheKey, generation: u64, gc_time: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        tokio::time::sleep(gc_time).await;
        let Some(inner) = store.upgrade() else {
            return;
        };
        let mut slots = inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        let expired = slots
            .get(key.canonical())
            .is_some_and(|slot| slot.gc_generation == generation && slot.is_collectable());
        if expired {
            slots.remove(key.canonical());
            inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "evicted inactive cache entry");
        }
    });
}

/// Registration handle returned by [`CacheStore::subscribe`].
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    store: Weak<Inner>,
    key: CacheKey,
    id: u64,
    active: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let store = CacheStore { inner };
        {
            let mut slots = store.slots();
            let Some(slot) = slots.get_mut(self.key.canonical()) else {
                return;
            };
            slot.listeners.retain(|(id, _)| *id != self.id);
            slot.refetch_hooks.retain(|(id, _)| *id != self.id);
            slot.entry.subscriber_count = slot.entry.subscriber_count.saturating_sub(1);
        }
        store.schedule_gc_if_inactive(&self.key);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn key(parts: Value) -> CacheKey {
        match parts {
            Value::Array(parts) => CacheKey::new(parts),
            other => CacheKey::new(vec![other]),
        }
    }

    fn counting_listener() -> (Listener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener: Listener = Arc::new(move |_: &CacheEntry| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (listener, count)
    }

    #[test]
    fn test_set_on_missing_key_is_noop() {
        let store = CacheStore::default();
        assert!(!store.set(&key(json!("projects")), json!([])));
        assert!(store.get(&key(json!("projects"))).is_none());
    }

    #[test]
    fn test_prime_then_get() {
        let store = CacheStore::default();
        let k = key(json!(["projects", {"status": "current"}]));
        store.prime(&k, json!([1, 2]));
        let entry = store.get(&k).unwrap();
        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(entry.data.as_deref(), Some(&json!([1, 2])));
        assert!(entry.updated_at.is_some());
    }

    #[test]
    fn test_subscribe_creates_entry_and_counts() {
        let store = CacheStore::default();
        let k = key(json!("news"));
        let (listener, _) = counting_listener();
        let first = store.subscribe(&k, Arc::clone(&listener));
        let second = store.subscribe(&k, listener);
        assert_eq!(store.get(&k).unwrap().subscriber_count, 2);
        drop(first);
        assert_eq!(store.get(&k).unwrap().subscriber_count, 1);
        second.unsubscribe();
        assert_eq!(store.get(&k).unwrap().subscriber_count, 0);
    }

    #[test]
    fn test_listener_called_on_set_and_not_after_unsubscribe() {
        let store = CacheStore::default();
        let k = key(json!("team"));
        let (listener, count) = counting_listener();
        let sub = store.subscribe(&k, listener);
        store.set(&k, json!([]));
        store.patch(&k, |_| Some(json!(["x"])));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        sub.unsubscribe();
        store.set(&k, json!([]));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_patch_sees_current_data() {
        let store = CacheStore::default();
        let k = key(json!("gallery"));
        store.prime(&k, json!([1]));
        store.patch(&k, |current| {
            let mut items = current.and_then(Value::as_array).cloned().unwrap_or_default();
            items.push(json!(2));
            Some(Value::Array(items))
        });
        assert_eq!(store.data(&k).as_deref(), Some(&json!([1, 2])));
        assert!(!store.patch(&k, |_| None));
    }

    #[test]
    fn test_concurrent_patches_keep_every_change() {
        let store = CacheStore::default();
        let k = key(json!("projects"));
        store.prime(&k, json!([]));

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let store = store.clone();
                let k = k.clone();
                scope.spawn(move || {
                    for n in 0..50 {
                        store.patch(&k, |current| {
                            let mut items =
                                current.and_then(Value::as_array).cloned().unwrap_or_default();
                            items.push(json!(format!("{}-{}", worker, n)));
                            Some(Value::Array(items))
                        });
                    }
                });
            }
        });

        assert_eq!(store.data(&k).unwrap().as_array().unwrap().len(), 400);
    }

    #[test]
    fn test_invalidate_prefix_marks_matching_only() {
        let store = CacheStore::default();
        let current = key(json!(["projects", {"status": "current"}]));
        let past = key(json!(["projects", {"status": "past"}]));
        let news = key(json!(["news"]));
        for k in [&current, &past, &news] {
            store.prime(k, json!([]));
        }
        assert_eq!(store.invalidate(&key(json!(["projects"]))), 2);
        assert_eq!(store.get(&current).unwrap().status, EntryStatus::Stale);
        assert_eq!(store.get(&past).unwrap().status, EntryStatus::Stale);
        assert_eq!(store.get(&news).unwrap().status, EntryStatus::Fresh);
    }

    #[test]
    fn test_invalidate_calls_refetch_hook_only_when_subscribed() {
        let store = CacheStore::default();
        let k = key(json!("publications"));
        store.prime(&k, json!([]));
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&hook_calls);
        let (listener, _) = counting_listener();
        let sub = store.subscribe_with_refetch(
            &k,
            listener,
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
        );
        store.invalidate(&k);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        drop(sub);
        store.invalidate(&k);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_superseded_fetch_is_discarded() {
        let store = CacheStore::default();
        let k = key(json!("projects"));
        let gc = Duration::from_secs(60);
        let first = store.begin_fetch(&k, gc);
        let second = store.begin_fetch(&k, gc);
        assert!(!store.complete_fetch(&k, first, &Ok(Arc::new(json!("old")))));
        assert!(store.complete_fetch(&k, second, &Ok(Arc::new(json!("new")))));
        assert_eq!(store.data(&k).as_deref(), Some(&json!("new")));
    }

    #[test]
    fn test_invalidate_during_fetch_discards_result() {
        let store = CacheStore::default();
        let k = key(json!("projects"));
        let generation = store.begin_fetch(&k, Duration::from_secs(60));
        store.invalidate(&k);
        assert!(!store.complete_fetch(&k, generation, &Ok(Arc::new(json!([])))));
        let entry = store.get(&k).unwrap();
        assert_eq!(entry.status, EntryStatus::Stale);
        assert!(entry.data.is_none());
    }

    #[test]
    fn test_failed_fetch_keeps_previous_data() {
        let store = CacheStore::default();
        let k = key(json!("news"));
        store.prime(&k, json!(["cached"]));
        let generation = store.begin_fetch(&k, Duration::from_secs(60));
        let err = LabError::request_failed(503, None);
        store.complete_fetch(&k, generation, &Err(err.clone()));
        let entry = store.get(&k).unwrap();
        assert_eq!(entry.status, EntryStatus::Error);
        assert_eq!(entry.error, Some(err));
        assert_eq!(entry.data.as_deref(), Some(&json!(["cached"])));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let store = CacheStore::default();
        let k = key(json!("gallery"));
        store.prime(&k, json!(["a"]));
        let snapshot = store.snapshot(&k).unwrap();
        store.set(&k, json!(["a", "b"]));
        assert!(store.restore(&snapshot));
        assert_eq!(store.data(&k).as_deref(), Some(&json!(["a"])));
    }

    #[test]
    fn test_keys_matching_and_remove() {
        let store = CacheStore::default();
        let a = key(json!(["projects", {"status": "past"}]));
        let b = key(json!(["projects", {"status": "current"}]));
        store.prime(&a, json!([]));
        store.prime(&b, json!([]));
        store.prime(&key(json!("team")), json!([]));
        assert_eq!(store.keys_matching(&key(json!("projects"))), vec![b.clone(), a]);
        assert!(store.remove(&b));
        assert!(!store.remove(&b));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_collect_garbage_without_runtime() {
        let store = CacheStore::new(CacheSettings {
            stale_time_ms: 0,
            gc_time_ms: 0,
        });
        let k = key(json!("news"));
        let (listener, _) = counting_listener();
        let sub = store.subscribe(&k, listener);
        assert_eq!(store.collect_garbage(), 0);
        drop(sub);
        assert_eq!(store.collect_garbage(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_status_transition_table() {
        use EntryStatus::*;
        assert!(Loading.can_transition_to(Fresh));
        assert!(Fresh.can_transition_to(Stale));
        assert!(Stale.can_transition_to(Loading));
        assert!(Error.can_transition_to(Loading));
        assert!(!Fresh.can_transition_to(Error));
        assert!(!Stale.can_transition_to(Fresh));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < 0.001);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
