//! Labsite Cache - the query and mutation layer.
//!
//! - [`CacheStore`]: key-addressed entries with staleness, subscriptions and
//!   delayed eviction.
//! - [`QueryClient`]: read-through fetches with in-flight deduplication,
//!   retry and observers.
//! - [`MutationExecutor`]: optimistic writes with snapshot rollback and
//!   invalidation on success.

pub mod mutation;
pub mod optimistic;
pub mod query;
pub mod retry;
pub mod store;

pub use mutation::{
    MutateFn, Mutation, MutationDescriptor, MutationExecutor, MutationPhase, OptimisticFn,
    RollbackFn, Snapshot,
};
pub use optimistic::{
    filter_matches, merge_object, merge_record, prepend_record, remove_record, Draft,
};
pub use query::{FetchFn, QueryClient, QueryDescriptor, QueryObserver, QueryState, TransformFn};
pub use retry::{is_retryable, Backoff, RetryPolicy, RetryPredicate};
pub use store::{
    CacheEntry, CacheStats, CacheStore, EntrySnapshot, EntryStatus, Listener, RefetchHook,
    Subscription,
};
