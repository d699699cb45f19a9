//! Query engine.
//!
//! `QueryClient` is the operations surface over the cache store:
//!
//! - **Dedup**: concurrent callers for one key await a single shared fetch.
//! - **Staleness**: fresh data is served without calling the fetcher.
//! - **Supersede**: starting a fetch aborts the previous one for that key; only
//!   the newest fetch may commit.
//! - **Lifecycle**: subscriptions pin entries; orphaned entries are collected
//!   after their GC time.
//!
//! Store mutations are synchronous and happen under one lock; the only
//! suspension points are the caller-supplied fetchers, which run as spawned
//! tasks so a fetch still commits when every waiting caller has gone away.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::config::{ClientConfig, QueryOptions, ResolvedOptions, SetDataOptions};
use super::entry::{
    Entry, ErasedValue, FetchOutcome, InFlight, QueryEvent, QueryListener, QuerySnapshot,
    QueryStatus, SharedFetch, Subscriber, downcast_value,
};
use super::error::{FetchError, QueryError};
use super::focus::{FocusTracker, Visibility};
use super::keys::{CanonicalKey, QueryKey};
use super::lock::mutex_lock;
use super::observable::Subscription;
use super::store::{CacheStore, Collector};

const SOURCE: &str = "cache::client";

const METRIC_QUERY_HIT_TOTAL: &str = "leadcache_query_hit_total";
const METRIC_QUERY_MISS_TOTAL: &str = "leadcache_query_miss_total";
const METRIC_QUERY_DEDUP_TOTAL: &str = "leadcache_query_dedup_total";
const METRIC_QUERY_ABORT_TOTAL: &str = "leadcache_query_abort_total";
const METRIC_QUERY_ERROR_TOTAL: &str = "leadcache_query_error_total";
const METRIC_FETCH_MS: &str = "leadcache_fetch_ms";

/// Cancellation signal handed to fetchers.
///
/// Fetchers should treat it as authoritative and stop promptly once it fires;
/// whatever an aborted fetch returns is discarded.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the fetch has been aborted.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

/// Arguments passed to a fetcher.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub signal: AbortSignal,
    pub query_key: QueryKey,
}

/// Shared handle to the query cache. Cloning is cheap; clones share one store.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    store: Mutex<CacheStore>,
    focus: FocusTracker,
    subscriber_ids: AtomicU64,
    generations: AtomicU64,
}

enum Begin<T> {
    Ready(Option<Arc<T>>),
    Wait {
        fetch: SharedFetch,
        listeners: Vec<QueryListener>,
    },
}

enum Settled {
    Done(FetchOutcome),
    Follow(SharedFetch),
}

impl QueryClient {
    pub fn new(config: ClientConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let weak = weak.clone();
            let collector: Collector = Arc::new(move |key: &CanonicalKey, timer_id: u64| {
                if let Some(inner) = weak.upgrade() {
                    inner.lock_store("gc").collect(key, timer_id);
                }
            });
            ClientInner {
                config,
                store: Mutex::new(CacheStore::new(collector)),
                focus: FocusTracker::new(),
                subscriber_ids: AtomicU64::new(0),
                generations: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn focus(&self) -> &FocusTracker {
        &self.inner.focus
    }

    /// Return cached data, fetching it first when it is missing or stale.
    ///
    /// Concurrent calls for one key share a single fetcher invocation. Fetch
    /// failures are stored on the entry and returned; an aborted fetch is not
    /// a failure and resolves to whatever data is cached (possibly none).
    #[instrument(skip_all, fields(key = %key))]
    pub async fn ensure_query<T, F, Fut, E>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions<T>,
    ) -> Result<Option<Arc<T>>, QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(FetchContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let begin = self.inner.begin(key, fetcher, options, false)?;
        self.finish(key, begin).await
    }

    /// Mark the entry stale and start a new fetch, superseding any fetch in
    /// flight. Callers still awaiting the superseded fetch receive this
    /// fetch's outcome.
    ///
    /// Unlike `ensure_query` this never joins a running fetch: a refetch
    /// issued mid-fetch aborts it and calls the fetcher again. Use
    /// `invalidate` followed by `ensure_query` to mark stale and join instead.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn refetch<T, F, Fut, E>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions<T>,
    ) -> Result<Option<Arc<T>>, QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(FetchContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let begin = self.inner.begin(key, fetcher, options, true)?;
        self.finish(key, begin).await
    }

    /// Warm the cache without binding a subscriber.
    pub async fn prefetch<T, F, Fut, E>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions<T>,
    ) -> Result<Option<Arc<T>>, QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(FetchContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        self.ensure_query(key, fetcher, options).await
    }

    async fn finish<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        begin: Begin<T>,
    ) -> Result<Option<Arc<T>>, QueryError> {
        match begin {
            Begin::Ready(data) => Ok(data),
            Begin::Wait { fetch, listeners } => {
                notify(&listeners, QueryEvent::Changed);
                let outcome = fetch.await?;
                downcast_value(key, outcome)
            }
        }
    }

    /// Render-safe view of the entry. Returns the same `Arc` until the entry
    /// changes or its staleness flips.
    pub fn get_snapshot<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        options: &QueryOptions<T>,
    ) -> Result<Arc<QuerySnapshot<T>>, QueryError> {
        let resolved = options.resolve(&self.inner.config);
        let canonical = key.canonical();
        let mut store = self.inner.lock_store("get_snapshot");
        let entry = entry_for(&mut store, &canonical, key, options, &resolved);
        let snapshot = entry.snapshot::<T>(Instant::now());
        store.arm_gc_if_orphaned(&canonical);
        snapshot
    }

    /// Cached data for `key`, without creating an entry.
    pub fn get_query_data<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
    ) -> Result<Option<Arc<T>>, QueryError> {
        let store = self.inner.lock_store("get_query_data");
        match store.get(&key.canonical()) {
            Some(entry) => entry.data_as::<T>(),
            None => Ok(None),
        }
    }

    /// Write data synchronously. `updater` receives the previous value.
    ///
    /// The entry becomes `success` with a fresh timestamp and no error. With
    /// `silent_if_equal`, subscribers are not notified when the value and
    /// status did not change.
    pub fn set_query_data<T, U>(
        &self,
        key: &QueryKey,
        updater: U,
        options: SetDataOptions,
    ) -> Result<Arc<T>, QueryError>
    where
        T: PartialEq + Send + Sync + 'static,
        U: FnOnce(Option<&T>) -> T,
    {
        let canonical = key.canonical();
        let (value, listeners) = {
            let mut store = self.inner.lock_store("set_query_data");
            let config = &self.inner.config;
            let entry =
                store.get_or_insert(&canonical, key, None, config.stale_time, config.gc_time);

            let previous = entry.data_as::<T>()?;
            let next = updater(previous.as_deref());
            let unchanged = previous.as_deref() == Some(&next)
                && entry.status == QueryStatus::Success
                && entry.error.is_none();
            let value = match previous {
                Some(previous) if *previous == next => previous,
                _ => Arc::new(next),
            };

            entry.data = Some(Arc::clone(&value) as ErasedValue);
            entry.error = None;
            entry.status = QueryStatus::Success;
            entry.updated_at = Some(Instant::now());
            entry.touch();

            let listeners = if options.silent_if_equal && unchanged {
                debug!(key = %canonical, "Query data unchanged; notify suppressed");
                Vec::new()
            } else {
                entry.listeners()
            };
            store.arm_gc_if_orphaned(&canonical);
            (value, listeners)
        };

        notify(&listeners, QueryEvent::Changed);
        Ok(value)
    }

    /// Replace the cached value.
    pub fn set_query_value<T>(
        &self,
        key: &QueryKey,
        value: T,
        options: SetDataOptions,
    ) -> Result<Arc<T>, QueryError>
    where
        T: PartialEq + Send + Sync + 'static,
    {
        self.set_query_data(key, move |_| value, options)
    }

    /// Mark entries stale; every entry when `prefix` is `None`.
    ///
    /// Nothing is refetched here; the next access fetches.
    pub fn invalidate(&self, prefix: Option<&QueryKey>) -> usize {
        let (count, listeners) = {
            let mut store = self.inner.lock_store("invalidate");
            let keys = store.matching_keys(prefix);
            let mut listeners = Vec::new();
            for key in &keys {
                if let Some(entry) = store.get_mut(key) {
                    entry.updated_at = None;
                    entry.touch();
                    listeners.extend(entry.listeners());
                }
            }
            (keys.len(), listeners)
        };

        info!(prefix = %describe_prefix(prefix), count, "Queries invalidated");
        notify(&listeners, QueryEvent::Changed);
        count
    }

    /// Abort in-flight fetches; every entry when `prefix` is `None`.
    pub fn cancel_queries(&self, prefix: Option<&QueryKey>) -> usize {
        let (count, listeners) = {
            let mut store = self.inner.lock_store("cancel_queries");
            let mut count = 0;
            let mut listeners = Vec::new();
            for key in store.matching_keys(prefix) {
                let Some(entry) = store.get_mut(&key) else {
                    continue;
                };
                if !entry.abort_in_flight() {
                    continue;
                }
                if entry.data.is_none() {
                    entry.status = QueryStatus::Idle;
                }
                entry.touch();
                listeners.extend(entry.listeners());
                count += 1;
            }
            (count, listeners)
        };

        if count > 0 {
            counter!(METRIC_QUERY_ABORT_TOTAL).increment(count as u64);
            info!(prefix = %describe_prefix(prefix), count, "Queries cancelled");
        }
        notify(&listeners, QueryEvent::Changed);
        count
    }

    /// Evict entries now; every entry when `prefix` is `None`. Subscribers
    /// are notified and recreate the entry on their next read.
    pub fn remove_queries(&self, prefix: Option<&QueryKey>) -> usize {
        let (count, listeners) = {
            let mut store = self.inner.lock_store("remove_queries");
            let keys = store.matching_keys(prefix);
            let mut listeners = Vec::new();
            for key in &keys {
                if let Some(entry) = store.evict(key) {
                    listeners.extend(entry.listeners());
                }
            }
            (keys.len(), listeners)
        };

        info!(prefix = %describe_prefix(prefix), count, "Queries removed");
        notify(&listeners, QueryEvent::Changed);
        count
    }

    /// Tear down: abort every fetch and GC timer and empty the store.
    pub fn clear(&self) {
        let count = self.inner.lock_store("clear").clear();
        info!(count, "Query cache cleared");
    }

    pub fn query_count(&self) -> usize {
        self.inner.lock_store("query_count").len()
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner
            .lock_store("is_fetching")
            .get(&key.canonical())
            .is_some_and(Entry::is_fetching)
    }

    /// Register `listener` for changes to `key`.
    ///
    /// A subscribed entry is never collected. When the last subscription for
    /// an entry goes away, a GC timer is armed with the entry's GC time.
    pub fn subscribe<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        listener: QueryListener,
        options: &QueryOptions<T>,
    ) -> Subscription {
        let resolved = options.resolve(&self.inner.config);
        let canonical = key.canonical();
        let id = self.inner.subscriber_ids.fetch_add(1, Ordering::Relaxed);

        {
            let mut store = self.inner.lock_store("subscribe");
            let entry = entry_for(&mut store, &canonical, key, options, &resolved);
            if entry.disarm_gc() {
                debug!(key = %canonical, "GC timer disarmed by resubscribe");
            }
            entry.subscribers.insert(
                id,
                Subscriber {
                    listener,
                    refetch_on_window_focus: resolved.refetch_on_window_focus,
                },
            );
        }

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.unsubscribe(&canonical, id);
            }
        })
    }

    /// Report a document visibility change. Regaining visibility revalidates
    /// stale subscribed entries that are not already fetching.
    pub fn set_visibility(&self, visibility: Visibility) {
        let regained = self.inner.focus.set_visibility(visibility);
        if regained && self.inner.config.refetch_on_visibility {
            self.inner.revalidate_subscribed("visibility", false);
        }
    }

    /// Report that the window regained focus. Only entries with a subscriber
    /// that enabled `refetch_on_window_focus` are revalidated.
    pub fn window_focused(&self) {
        self.inner.revalidate_subscribed("focus", true);
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.inner.config)
            .field("queries", &self.query_count())
            .finish()
    }
}

impl ClientInner {
    fn lock_store(&self, op: &'static str) -> MutexGuard<'_, CacheStore> {
        mutex_lock(&self.store, SOURCE, op)
    }

    /// Synchronous half of ensure/refetch: decide between serving cached data,
    /// joining the in-flight fetch, or starting a new one.
    fn begin<T, F, Fut, E>(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions<T>,
        force: bool,
    ) -> Result<Begin<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(FetchContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let resolved = options.resolve(&self.config);
        let canonical = key.canonical();
        let mut store = self.lock_store(if force { "refetch" } else { "ensure_query" });
        let entry = entry_for(&mut store, &canonical, key, options, &resolved);

        if force {
            entry.updated_at = None;
            entry.touch();
        }

        if !resolved.enabled {
            debug!(key = %canonical, "Query disabled; serving cached data");
            let data = entry.data_as::<T>();
            store.arm_gc_if_orphaned(&canonical);
            return data.map(Begin::Ready);
        }

        if !force {
            if entry.data.is_some() && !entry.is_stale_at(Instant::now()) {
                counter!(METRIC_QUERY_HIT_TOTAL).increment(1);
                debug!(key = %canonical, "Query cache hit");
                let data = entry.data_as::<T>();
                store.arm_gc_if_orphaned(&canonical);
                return data.map(Begin::Ready);
            }
            if let Some(in_flight) = &entry.in_flight {
                counter!(METRIC_QUERY_DEDUP_TOTAL).increment(1);
                debug!(key = %canonical, generation = in_flight.generation, "Joining in-flight fetch");
                return Ok(Begin::Wait {
                    fetch: in_flight.shared.clone(),
                    listeners: Vec::new(),
                });
            }
        }

        counter!(METRIC_QUERY_MISS_TOTAL).increment(1);
        let fetch = self.start_fetch(entry, &canonical, fetcher);
        let listeners = entry.listeners();
        store.arm_gc_if_orphaned(&canonical);
        Ok(Begin::Wait { fetch, listeners })
    }

    fn start_fetch<T, F, Fut, E>(
        self: &Arc<Self>,
        entry: &mut Entry,
        canonical: &CanonicalKey,
        fetcher: F,
    ) -> SharedFetch
    where
        T: Send + Sync + 'static,
        F: FnOnce(FetchContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        if entry.abort_in_flight() {
            counter!(METRIC_QUERY_ABORT_TOTAL).increment(1);
            debug!(key = %canonical, "Superseding in-flight fetch");
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let signal = CancellationToken::new();
        let context = FetchContext {
            signal: AbortSignal {
                token: signal.clone(),
            },
            query_key: entry.key.clone(),
        };
        if entry.data.is_none() {
            entry.status = QueryStatus::Loading;
        }
        entry.touch();

        let inner = Arc::clone(self);
        let key = canonical.clone();
        let task_signal = signal.clone();
        let task = tokio::spawn(async move {
            let started_at = Instant::now();
            let result = match AssertUnwindSafe(async move { fetcher(context).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(Arc::new(value) as ErasedValue),
                Ok(Err(err)) => Err(QueryError::fetch(err)),
                Err(_) => Err(QueryError::task_failed("fetcher panicked")),
            };
            histogram!(METRIC_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
            inner.settle(key, generation, task_signal, result).await
        });

        let shared = async move {
            task.await
                .unwrap_or_else(|err| Err(QueryError::task_failed(err.to_string())))
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            generation,
            signal,
            shared: shared.clone(),
        });
        debug!(key = %canonical, generation, "Fetch started");
        shared
    }

    async fn settle(
        self: Arc<Self>,
        canonical: CanonicalKey,
        generation: u64,
        signal: CancellationToken,
        result: Result<ErasedValue, QueryError>,
    ) -> FetchOutcome {
        let (settled, listeners) = self.commit(&canonical, generation, &signal, result);
        notify(&listeners, QueryEvent::Changed);
        match settled {
            Settled::Done(outcome) => outcome,
            Settled::Follow(successor) => successor.await,
        }
    }

    /// Apply a finished fetch to its entry, unless it was aborted or
    /// superseded in the meantime.
    fn commit(
        &self,
        canonical: &CanonicalKey,
        generation: u64,
        signal: &CancellationToken,
        result: Result<ErasedValue, QueryError>,
    ) -> (Settled, Vec<QueryListener>) {
        let mut store = self.lock_store("settle");
        let Some(entry) = store.get_mut(canonical) else {
            debug!(key = %canonical, generation, "Fetch settled after its entry was removed");
            return (Settled::Done(Ok(None)), Vec::new());
        };

        let current = entry
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation);

        if signal.is_cancelled() || !current {
            if let Some(successor) = &entry.in_flight
                && successor.generation != generation
            {
                debug!(key = %canonical, generation, "Aborted fetch handing over to successor");
                return (Settled::Follow(successor.shared.clone()), Vec::new());
            }

            debug!(key = %canonical, generation, "Aborted fetch discarded");
            if !current {
                return (Settled::Done(Ok(entry.data.clone())), Vec::new());
            }
            entry.in_flight = None;
            if entry.data.is_none() {
                entry.status = QueryStatus::Idle;
            }
            entry.touch();
            return (Settled::Done(Ok(entry.data.clone())), entry.listeners());
        }

        entry.in_flight = None;
        let outcome = match result {
            Ok(value) => {
                entry.data = Some(Arc::clone(&value));
                entry.error = None;
                entry.status = QueryStatus::Success;
                entry.updated_at = Some(Instant::now());
                debug!(key = %canonical, generation, "Fetch committed");
                Ok(Some(value))
            }
            Err(error) => {
                counter!(METRIC_QUERY_ERROR_TOTAL).increment(1);
                debug!(key = %canonical, generation, error = %error, "Fetch failed");
                entry.error = Some(error.clone());
                entry.status = QueryStatus::Error;
                Err(error)
            }
        };
        entry.touch();
        (Settled::Done(outcome), entry.listeners())
    }

    fn unsubscribe(&self, canonical: &CanonicalKey, id: u64) {
        let mut store = self.lock_store("unsubscribe");
        let Some(entry) = store.get_mut(canonical) else {
            return;
        };
        entry.subscribers.remove(&id);
        if entry.subscribers.is_empty() {
            store.arm_gc_if_orphaned(canonical);
        }
    }

    fn revalidate_subscribed(&self, trigger: &'static str, focus_only: bool) {
        let now = Instant::now();
        let listeners: Vec<QueryListener> = {
            let mut store = self.lock_store("revalidate");
            store
                .iter_mut()
                .filter(|(_, entry)| {
                    !entry.subscribers.is_empty()
                        && !entry.is_fetching()
                        && entry.is_stale_at(now)
                        && (!focus_only || entry.wants_focus_refetch())
                })
                .flat_map(|(_, entry)| entry.listeners())
                .collect()
        };

        debug!(trigger, listeners = listeners.len(), "Revalidating stale subscribed queries");
        notify(&listeners, QueryEvent::Revalidate);
    }
}

/// Entry for `key`, created on first access and refreshed with the caller's
/// resolved timings.
fn entry_for<'a, T: Send + Sync + 'static>(
    store: &'a mut CacheStore,
    canonical: &CanonicalKey,
    key: &QueryKey,
    options: &QueryOptions<T>,
    resolved: &ResolvedOptions,
) -> &'a mut Entry {
    let initial = options
        .initial_data
        .clone()
        .map(|value| value as ErasedValue);
    let entry = store.get_or_insert(canonical, key, initial, resolved.stale_time, resolved.gc_time);
    entry.stale_time = resolved.stale_time;
    entry.gc_time = resolved.gc_time;
    entry
}

fn notify(listeners: &[QueryListener], event: QueryEvent) {
    for listener in listeners {
        listener(event);
    }
}

fn describe_prefix(prefix: Option<&QueryKey>) -> String {
    prefix.map_or_else(|| "*".to_string(), QueryKey::to_string)
}
