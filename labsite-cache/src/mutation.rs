//! Write path: optimistic patch, upload, write, then rollback or invalidate.
//!
//! One call runs through
//! `Idle -> OptimisticallyApplied -> (Uploading ->) Submitting -> Settled*`.
//! Every entry under the descriptor's affected key prefixes is snapshotted
//! before it is patched; the snapshot restores them if any later step fails
//! and is dropped once the call settles.
//!
//! Everything after the optimistic patch runs as a spawned task, so a call
//! whose caller stops waiting still settles: it is rolled back or
//! invalidated exactly as if it had been awaited. A rollback that overlaps
//! another write also invalidates its keys, since its snapshot may predate
//! (or contain) the other write's changes.

use crate::store::{CacheStore, EntrySnapshot};
use futures_util::future::{BoxFuture, FutureExt};
use labsite_core::{Attachment, CacheKey, FileUploader, LabError, LabResult};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Performs the write, given the call's variables and the uploaded file URLs.
pub type MutateFn<V> =
    Arc<dyn Fn(V, Vec<String>) -> BoxFuture<'static, LabResult<Value>> + Send + Sync>;

/// Computes an entry's optimistic data from `(key, current data, variables)`.
pub type OptimisticFn<V> =
    Arc<dyn Fn(&CacheKey, Option<&Value>, &V) -> Option<Value> + Send + Sync>;

/// Called after the snapshot has been restored.
pub type RollbackFn<V> = Arc<dyn Fn(&V, &LabError) + Send + Sync>;

pub struct MutationDescriptor<V> {
    mutate: MutateFn<V>,
    optimistic: Option<OptimisticFn<V>>,
    on_rollback: Option<RollbackFn<V>>,
    affected_keys: Vec<CacheKey>,
    max_attachments: Option<usize>,
}

impl<V> Clone for MutationDescriptor<V> {
    fn clone(&self) -> Self {
        Self {
            mutate: Arc::clone(&self.mutate),
            optimistic: self.optimistic.clone(),
            on_rollback: self.on_rollback.clone(),
            affected_keys: self.affected_keys.clone(),
            max_attachments: self.max_attachments,
        }
    }
}

impl<V> fmt::Debug for MutationDescriptor<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDescriptor")
            .field("affected_keys", &self.affected_keys)
            .field("optimistic", &self.optimistic.is_some())
            .field("on_rollback", &self.on_rollback.is_some())
            .field("max_attachments", &self.max_attachments)
            .finish()
    }
}

impl<V: 'static> MutationDescriptor<V> {
    pub fn new<F, Fut>(mutate: F) -> Self
    where
        F: Fn(V, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LabResult<Value>> + Send + 'static,
    {
        Self {
            mutate: Arc::new(move |vars: V, urls: Vec<String>| mutate(vars, urls).boxed()),
            optimistic: None,
            on_rollback: None,
            affected_keys: Vec::new(),
            max_attachments: None,
        }
    }

    /// Patch applied to every affected entry before the write is sent.
    pub fn with_optimistic<F>(mut self, optimistic: F) -> Self
    where
        F: Fn(&CacheKey, Option<&Value>, &V) -> Option<Value> + Send + Sync + 'static,
    {
        self.optimistic = Some(Arc::new(optimistic));
        self
    }

    pub fn with_rollback<F>(mut self, on_rollback: F) -> Self
    where
        F: Fn(&V, &LabError) + Send + Sync + 'static,
    {
        self.on_rollback = Some(Arc::new(on_rollback));
        self
    }

    /// Add a key prefix whose entries are patched and later invalidated.
    pub fn affecting(mut self, prefix: CacheKey) -> Self {
        self.affected_keys.push(prefix);
        self
    }

    pub fn affected_keys(&self) -> &[CacheKey] {
        &self.affected_keys
    }

    /// Reject calls carrying more than `max` attachments before anything is
    /// patched or uploaded.
    pub fn with_max_attachments(mut self, max: usize) -> Self {
        self.max_attachments = Some(max);
        self
    }

    pub fn max_attachments(&self) -> Option<usize> {
        self.max_attachments
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationPhase {
    Idle,
    OptimisticallyApplied,
    Uploading,
    Submitting,
    SettledSuccess,
    SettledError,
}

impl MutationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::SettledSuccess | Self::SettledError)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::OptimisticallyApplied | Self::Uploading | Self::Submitting
        )
    }

    pub fn can_transition_to(self, next: MutationPhase) -> bool {
        use MutationPhase::*;
        matches!(
            (self, next),
            (Idle, OptimisticallyApplied)
                | (OptimisticallyApplied, Uploading)
                | (OptimisticallyApplied, Submitting)
                | (OptimisticallyApplied, SettledError)
                | (Uploading, Submitting)
                | (Uploading, SettledError)
                | (Submitting, SettledSuccess)
                | (Submitting, SettledError)
        )
    }
}

/// Pre-patch copies of every affected entry, consumed by the rollback.
#[derive(Debug)]
pub struct Snapshot {
    entries: Vec<EntrySnapshot>,
}

impl Snapshot {
    /// Copy every existing entry under any of `prefixes`.
    pub fn capture(store: &CacheStore, prefixes: &[CacheKey]) -> Self {
        let mut keys: Vec<CacheKey> = prefixes
            .iter()
            .flat_map(|prefix| store.keys_matching(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        Self {
            entries: keys.iter().filter_map(|key| store.snapshot(key)).collect(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.iter().map(|entry| &entry.key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn restore(self, store: &CacheStore) {
        for entry in &self.entries {
            store.restore(entry);
        }
    }
}

/// Write calls started and still unsettled, shared by executor clones.
#[derive(Debug, Default)]
struct WriteLedger {
    started: AtomicU64,
    running: AtomicUsize,
}

/// One unsettled call on the ledger, released when the call settles.
struct RunningWrite {
    ledger: Arc<WriteLedger>,
    ticket: u64,
    joined_running: bool,
}

impl RunningWrite {
    fn enter(ledger: &Arc<WriteLedger>) -> Self {
        let joined_running = ledger.running.fetch_add(1, Ordering::SeqCst) > 0;
        let ticket = ledger.started.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            ledger: Arc::clone(ledger),
            ticket,
            joined_running,
        }
    }

    /// Whether another write was unsettled when this one started, or has
    /// started since.
    fn overlapped(&self) -> bool {
        self.joined_running || self.ledger.started.load(Ordering::SeqCst) != self.ticket
    }
}

impl Drop for RunningWrite {
    fn drop(&mut self) {
        self.ledger.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs mutations against a [`CacheStore`].
#[derive(Clone)]
pub struct MutationExecutor {
    store: CacheStore,
    uploader: Option<Arc<dyn FileUploader>>,
    writes: Arc<WriteLedger>,
}

impl fmt::Debug for MutationExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationExecutor")
            .field("store", &self.store)
            .field("uploader", &self.uploader.is_some())
            .finish()
    }
}

impl MutationExecutor {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            uploader: None,
            writes: Arc::new(WriteLedger::default()),
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn FileUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Run one mutation without attachments.
    pub async fn execute<V>(&self, descriptor: &MutationDescriptor<V>, vars: V) -> LabResult<Value>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.execute_observed(descriptor, vars, &[], |_| {}).await
    }

    /// Run one mutation, reporting each phase to `on_phase`.
    ///
    /// Dropping the returned future does not cancel the call; it settles in
    /// the background.
    pub async fn execute_observed<V, P>(
        &self,
        descriptor: &MutationDescriptor<V>,
        vars: V,
        attachments: &[Attachment],
        on_phase: P,
    ) -> LabResult<Value>
    where
        V: Clone + Send + Sync + 'static,
        P: Fn(MutationPhase) + Send + Sync + 'static,
    {
        if let Some(max) = descriptor.max_attachments {
            if attachments.len() > max {
                return Err(LabError::invalid_request(format!(
                    "at most {} attachment(s) allowed, got {}",
                    max,
                    attachments.len()
                )));
            }
        }
        let running = RunningWrite::enter(&self.writes);
        let snapshot = Snapshot::capture(&self.store, &descriptor.affected_keys);
        if let Some(optimistic) = &descriptor.optimistic {
            for key in snapshot.keys() {
                self.store.patch(key, |current| optimistic(key, current, &vars));
            }
        }
        tracing::debug!(
            affected = snapshot.len(),
            attachments = attachments.len(),
            "optimistic patch applied"
        );
        on_phase(MutationPhase::OptimisticallyApplied);

        let executor = self.clone();
        let descriptor = descriptor.clone();
        let attachments = attachments.to_vec();
        let task = tokio::spawn(async move {
            executor
                .settle(&descriptor, vars, &attachments, snapshot, &on_phase, running)
                .await
        });
        task.await
            .unwrap_or_else(|e| Err(LabError::internal(format!("mutation task failed: {}", e))))
    }

    async fn settle<V, P>(
        &self,
        descriptor: &MutationDescriptor<V>,
        vars: V,
        attachments: &[Attachment],
        snapshot: Snapshot,
        on_phase: &P,
        running: RunningWrite,
    ) -> LabResult<Value>
    where
        V: Clone + Send + Sync + 'static,
        P: Fn(MutationPhase) + Send + Sync,
    {
        let outcome = self
            .upload_and_submit(descriptor, vars.clone(), attachments, on_phase)
            .await;

        match outcome {
            Ok(value) => {
                drop(snapshot);
                for prefix in &descriptor.affected_keys {
                    self.store.invalidate(prefix);
                }
                on_phase(MutationPhase::SettledSuccess);
                Ok(value)
            }
            Err(error) => {
                let overlapped = running.overlapped();
                tracing::warn!(
                    error = %error,
                    restored = snapshot.len(),
                    overlapped,
                    "mutation failed, rolling back"
                );
                snapshot.restore(&self.store);
                if overlapped {
                    for prefix in &descriptor.affected_keys {
                        self.store.invalidate(prefix);
                    }
                }
                if let Some(on_rollback) = &descriptor.on_rollback {
                    on_rollback(&vars, &error);
                }
                on_phase(MutationPhase::SettledError);
                Err(error)
            }
        }
    }

    async fn upload_and_submit<V, P>(
        &self,
        descriptor: &MutationDescriptor<V>,
        vars: V,
        attachments: &[Attachment],
        on_phase: &P,
    ) -> LabResult<Value>
    where
        P: Fn(MutationPhase) + Sync,
    {
        let urls = if attachments.is_empty() {
            Vec::new()
        } else {
            on_phase(MutationPhase::Uploading);
            let uploader = self.uploader.as_ref().ok_or_else(|| LabError::UploadFailed {
                status: None,
                reason: "no uploader configured".to_string(),
            })?;
            uploader
                .upload(attachments)
                .await
                .map_err(LabError::into_upload_failure)?
        };

        on_phase(MutationPhase::Submitting);
        (descriptor.mutate)(vars, urls).await
    }

    /// A reusable handle for one kind of mutation.
    pub fn mutation<V>(&self, descriptor: MutationDescriptor<V>) -> Mutation<V> {
        let (phase, _) = watch::channel(MutationPhase::Idle);
        Mutation {
            executor: self.clone(),
            descriptor,
            phase: Arc::new(phase),
            calls: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Handle bound to one [`MutationDescriptor`].
///
/// The phase channel follows the most recently started call.
pub struct Mutation<V> {
    executor: MutationExecutor,
    descriptor: MutationDescriptor<V>,
    phase: Arc<watch::Sender<MutationPhase>>,
    calls: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
}

impl<V> Clone for Mutation<V> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            descriptor: self.descriptor.clone(),
            phase: Arc::clone(&self.phase),
            calls: Arc::clone(&self.calls),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<V> Mutation<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub async fn mutate_async(&self, vars: V) -> LabResult<Value> {
        self.mutate_with_files(vars, &[]).await
    }

    /// Upload `files` first, then write.
    pub async fn mutate_with_files(&self, vars: V, files: &[Attachment]) -> LabResult<Value> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.in_flight));
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let phase = Arc::clone(&self.phase);
        let calls = Arc::clone(&self.calls);
        // The publisher lives until the call settles, and so does the guard.
        let publish = move |next: MutationPhase| {
            let _counted = &guard;
            if calls.load(Ordering::SeqCst) == call {
                tracing::debug!(call, phase = ?next, "mutation phase");
                phase.send_replace(next);
            }
        };

        self.executor
            .execute_observed(&self.descriptor, vars, files, publish)
            .await
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn phase(&self) -> MutationPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<MutationPhase> {
        self.phase.subscribe()
    }

    pub fn descriptor(&self) -> &MutationDescriptor<V> {
        &self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_table() {
        use MutationPhase::*;
        assert!(Idle.can_transition_to(OptimisticallyApplied));
        assert!(OptimisticallyApplied.can_transition_to(Submitting));
        assert!(Uploading.can_transition_to(SettledError));
        assert!(!SettledSuccess.can_transition_to(Submitting));
        assert!(!SettledError.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Submitting));
        assert!(SettledError.is_terminal());
        assert!(Uploading.is_in_flight());
    }

    #[test]
    fn test_snapshot_covers_prefix_matches_once() {
        let store = CacheStore::default();
        let current = CacheKey::root("projects").with(json!({"status": "current"}));
        let past = CacheKey::root("projects").with(json!({"status": "past"}));
        store.prime(&current, json!([]));
        store.prime(&past, json!([]));
        store.prime(&CacheKey::root("news"), json!([]));

        let snapshot = Snapshot::capture(
            &store,
            &[CacheKey::root("projects"), current.clone()],
        );
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.keys().cloned().collect::<Vec<_>>(), vec![current, past]);
    }

    #[test]
    fn test_snapshot_ignores_missing_keys() {
        let store = CacheStore::default();
        assert!(Snapshot::capture(&store, &[CacheKey::root("gallery")]).is_empty());
    }
}
