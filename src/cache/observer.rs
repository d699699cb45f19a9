//! Render-layer adapter.
//!
//! [`use_cache_query`] binds one query key to a consumer: it subscribes to the
//! engine, fetches on mount when there is nothing usable in the cache, polls on
//! an interval while the document is visible, and exposes the entry through
//! [`ExternalStore`] so a renderer can pull memoized snapshots.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::client::{FetchContext, QueryClient};
use super::config::QueryOptions;
use super::entry::{QueryEvent, QueryListener, QuerySnapshot, QueryStatus};
use super::error::{FetchError, QueryError};
use super::keys::{CanonicalKey, QueryKey};
use super::lock::mutex_lock;
use super::observable::{ExternalStore, Listener, Subscription};

const SOURCE: &str = "cache::observer";

type BoxedFetcher<T> =
    Arc<dyn Fn(FetchContext) -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

/// A query bound to a consumer. Dropping it unsubscribes and stops polling.
pub struct CacheQuery<T: Send + Sync + 'static> {
    state: Arc<QueryState<T>>,
}

struct QueryState<T> {
    client: QueryClient,
    fetcher: BoxedFetcher<T>,
    binding: Mutex<Binding<T>>,
    listeners: Mutex<HashMap<u64, Listener>>,
    listener_ids: AtomicU64,
    server_snapshot: Arc<QuerySnapshot<T>>,
    failed: Mutex<Option<FailedRead<T>>>,
}

/// Error snapshot kept so repeated unservable reads return one `Arc`.
struct FailedRead<T> {
    key: CanonicalKey,
    snapshot: Arc<QuerySnapshot<T>>,
}

struct Binding<T> {
    key: QueryKey,
    options: QueryOptions<T>,
    subscription: Option<Subscription>,
    poller: Option<JoinHandle<()>>,
}

/// Mount a query.
///
/// The fetcher is kept for the lifetime of the binding and reused for mount
/// fetches, revalidation, polling and manual refetches.
pub fn use_cache_query<T, F, Fut, E>(
    client: &QueryClient,
    key: QueryKey,
    fetcher: F,
    options: QueryOptions<T>,
) -> CacheQuery<T>
where
    T: Send + Sync + 'static,
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<FetchError> + Send + 'static,
{
    let fetcher: BoxedFetcher<T> = Arc::new(move |context: FetchContext| {
        let fetch = fetcher(context);
        async move { fetch.await.map_err(Into::<FetchError>::into) }.boxed()
    });
    let server_snapshot = read_snapshot(client, &key, &options);

    let state = Arc::new(QueryState {
        client: client.clone(),
        fetcher,
        binding: Mutex::new(Binding {
            key,
            options,
            subscription: None,
            poller: None,
        }),
        listeners: Mutex::new(HashMap::new()),
        listener_ids: AtomicU64::new(0),
        server_snapshot,
        failed: Mutex::new(None),
    });
    state.bind();
    CacheQuery { state }
}

impl<T: Send + Sync + 'static> CacheQuery<T> {
    pub fn key(&self) -> QueryKey {
        self.state.lock_binding("key").key.clone()
    }

    /// Current snapshot. A read that cannot be served (wrong value type for
    /// the key) yields an error snapshot instead of failing the render.
    pub fn snapshot(&self) -> Arc<QuerySnapshot<T>> {
        let (key, options) = self.state.current();
        self.state.read(&key, &options)
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.snapshot().data.clone()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.snapshot().error.clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.snapshot().status
    }

    pub fn is_loading(&self) -> bool {
        self.snapshot().is_loading()
    }

    pub fn is_error(&self) -> bool {
        self.snapshot().is_error()
    }

    pub fn is_stale(&self) -> bool {
        self.snapshot().is_stale
    }

    pub fn is_fetching(&self) -> bool {
        self.snapshot().is_fetching
    }

    /// Handle whose identity stays the same for the life of this binding and
    /// always refetches the key that is current when it is invoked.
    pub fn refetch_handle(&self) -> RefetchHandle<T> {
        RefetchHandle {
            state: Arc::downgrade(&self.state),
        }
    }

    pub async fn refetch(&self) -> Result<Option<Arc<T>>, QueryError> {
        self.state.refetch().await
    }

    /// Switch to another key or options. The previous key's subscription is
    /// released (arming its GC timer) and the new key is mounted.
    pub fn set_query(&self, key: QueryKey, options: QueryOptions<T>) {
        self.state.unbind();
        {
            let mut binding = self.state.lock_binding("set_query");
            binding.key = key;
            binding.options = options;
        }
        self.state.bind();
        self.state.notify_listeners();
    }
}

impl<T: Send + Sync + 'static> ExternalStore for CacheQuery<T> {
    type Snapshot = QuerySnapshot<T>;

    fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.state.listener_ids.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.state.listeners, SOURCE, "subscribe").insert(id, listener);

        let state = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                mutex_lock(&state.listeners, SOURCE, "unsubscribe").remove(&id);
            }
        })
    }

    fn get_snapshot(&self) -> Arc<QuerySnapshot<T>> {
        self.snapshot()
    }

    fn get_server_snapshot(&self) -> Arc<QuerySnapshot<T>> {
        Arc::clone(&self.state.server_snapshot)
    }
}

impl<T: Send + Sync + 'static> Drop for CacheQuery<T> {
    fn drop(&mut self) {
        self.state.unbind();
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for CacheQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheQuery")
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

/// Stable refetch trigger for a mounted query.
pub struct RefetchHandle<T> {
    state: Weak<QueryState<T>>,
}

impl<T: Send + Sync + 'static> RefetchHandle<T> {
    /// Refetch the binding's current key. Resolves to `Ok(None)` once the
    /// query has been unmounted.
    pub async fn refetch(&self) -> Result<Option<Arc<T>>, QueryError> {
        match self.state.upgrade() {
            Some(state) => state.refetch().await,
            None => Ok(None),
        }
    }

    pub fn same_as(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.state, &other.state)
    }
}

impl<T> Clone for RefetchHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Weak::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for RefetchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefetchHandle")
            .field("mounted", &(self.state.strong_count() > 0))
            .finish()
    }
}

impl<T: Send + Sync + 'static> QueryState<T> {
    fn lock_binding(&self, op: &'static str) -> MutexGuard<'_, Binding<T>> {
        mutex_lock(&self.binding, SOURCE, op)
    }

    fn current(&self) -> (QueryKey, QueryOptions<T>) {
        let binding = self.lock_binding("current");
        (binding.key.clone(), binding.options.clone())
    }

    fn read(&self, key: &QueryKey, options: &QueryOptions<T>) -> Arc<QuerySnapshot<T>> {
        match self.client.get_snapshot(key, options) {
            Ok(snapshot) => {
                mutex_lock(&self.failed, SOURCE, "read").take();
                snapshot
            }
            Err(error) => {
                let canonical = key.canonical();
                let mut failed = mutex_lock(&self.failed, SOURCE, "read");
                if let Some(read) = failed.as_ref()
                    && read.key == canonical
                {
                    return Arc::clone(&read.snapshot);
                }
                let snapshot = Arc::new(QuerySnapshot::failed(error));
                *failed = Some(FailedRead {
                    key: canonical,
                    snapshot: Arc::clone(&snapshot),
                });
                snapshot
            }
        }
    }

    fn bind(self: &Arc<Self>) {
        let (key, options) = {
            let mut binding = self.lock_binding("bind");
            let state = Arc::downgrade(self);
            let listener: QueryListener = Arc::new(move |event: QueryEvent| {
                if let Some(state) = state.upgrade() {
                    state.on_event(event);
                }
            });
            binding.subscription =
                Some(self.client.subscribe(&binding.key, listener, &binding.options));

            let resolved = binding.options.resolve(self.client.config());
            let poller = resolved
                .refetch_interval
                .and_then(|interval| self.spawn_poller(&binding.key, interval));
            binding.poller = poller;
            (binding.key.clone(), binding.options.clone())
        };

        if !options.enabled {
            return;
        }
        let snapshot = self.read(&key, &options);
        let needs_fetch = snapshot.is_idle()
            || (snapshot.is_stale && snapshot.data.is_none() && !snapshot.is_fetching);
        if needs_fetch {
            self.spawn_ensure(key, options, "mount");
        }
    }

    fn unbind(&self) {
        let (subscription, poller) = {
            let mut binding = self.lock_binding("unbind");
            (binding.subscription.take(), binding.poller.take())
        };
        if let Some(poller) = poller {
            poller.abort();
        }
        drop(subscription);
    }

    fn on_event(&self, event: QueryEvent) {
        match event {
            QueryEvent::Changed => self.notify_listeners(),
            QueryEvent::Revalidate => {
                let (key, options) = self.current();
                if options.enabled {
                    self.spawn_ensure(key, options, "revalidate");
                }
            }
        }
    }

    fn notify_listeners(&self) {
        let listeners: Vec<Listener> = mutex_lock(&self.listeners, SOURCE, "notify")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener();
        }
    }

    async fn refetch(&self) -> Result<Option<Arc<T>>, QueryError> {
        let (key, options) = self.current();
        let fetcher = Arc::clone(&self.fetcher);
        self.client
            .refetch(&key, move |context| fetcher(context), &options)
            .await
    }

    fn spawn_ensure(&self, key: QueryKey, options: QueryOptions<T>, trigger: &'static str) {
        let client = self.client.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, trigger, "No async runtime; query fetch skipped");
            return;
        };
        runtime.spawn(async move {
            if let Err(error) = client
                .ensure_query(&key, move |context| fetcher(context), &options)
                .await
            {
                debug!(key = %key, trigger, error = %error, "Background query fetch failed");
            }
        });
    }

    fn spawn_poller(self: &Arc<Self>, key: &QueryKey, interval: Duration) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "No async runtime; polling disabled");
            return None;
        };
        let state = Arc::downgrade(self);
        debug!(key = %key, interval_ms = interval.as_millis() as u64, "Query polling started");

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; mount already handled it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                if !state.client.focus().is_visible() {
                    debug!("Poll skipped while hidden");
                    continue;
                }
                if let Err(error) = state.refetch().await {
                    debug!(error = %error, "Polling refetch failed");
                }
            }
        }))
    }
}

fn read_snapshot<T: Send + Sync + 'static>(
    client: &QueryClient,
    key: &QueryKey,
    options: &QueryOptions<T>,
) -> Arc<QuerySnapshot<T>> {
    client
        .get_snapshot(key, options)
        .unwrap_or_else(|error| Arc::new(QuerySnapshot::failed(error)))
}
