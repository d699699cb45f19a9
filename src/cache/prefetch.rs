//! Background prefetch queue.
//!
//! Callers enqueue keys they expect to need soon (the next page of a list,
//! the detail view behind a hovered row). A drain pass, either manual or from
//! the auto-drain task, warms the cache for the highest-priority requests.
//! Requests for the same key coalesce into one.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use metrics::{counter, gauge, histogram};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::client::{FetchContext, QueryClient};
use super::config::{PrefetchConfig, QueryOptions};
use super::error::{FetchError, QueryError};
use super::keys::{CanonicalKey, QueryKey};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::prefetch";

const METRIC_PREFETCH_TOTAL: &str = "leadcache_prefetch_total";
const METRIC_PREFETCH_DRAIN_MS: &str = "leadcache_prefetch_drain_ms";
const METRIC_PREFETCH_QUEUE_LEN: &str = "leadcache_prefetch_queue_len";

/// Drain order. Higher priorities drain first; ties drain in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PrefetchPriority {
    Low,
    #[default]
    Normal,
    High,
}

type PrefetchTask = Box<dyn FnOnce(QueryClient) -> BoxFuture<'static, Result<(), QueryError>> + Send>;

struct PrefetchRequest {
    id: Uuid,
    key: QueryKey,
    priority: PrefetchPriority,
    sequence: u64,
    task: PrefetchTask,
}

/// Priority queue of pending prefetches for one client.
pub struct PrefetchQueue {
    client: QueryClient,
    config: PrefetchConfig,
    pending: Mutex<HashMap<CanonicalKey, PrefetchRequest>>,
    sequence: AtomicU64,
}

impl PrefetchQueue {
    pub fn new(client: QueryClient, config: PrefetchConfig) -> Self {
        Self {
            client,
            config,
            pending: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Queue a prefetch for `key`.
    ///
    /// If the key is already queued, the request keeps its original id and
    /// position, adopts the newer fetcher and options, and takes the higher of
    /// the two priorities. Returns the request id.
    pub fn enqueue<T, F, Fut, E>(
        &self,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions<T>,
        priority: PrefetchPriority,
    ) -> Uuid
    where
        T: Send + Sync + 'static,
        F: FnOnce(FetchContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + Send + 'static,
    {
        let canonical = key.canonical();
        let task_key = key.clone();
        let task: PrefetchTask = Box::new(move |client: QueryClient| {
            async move {
                client
                    .prefetch(&task_key, fetcher, &options)
                    .await
                    .map(|_| ())
            }
            .boxed()
        });

        let mut pending = mutex_lock(&self.pending, SOURCE, "enqueue");
        if let Some(existing) = pending.get_mut(&canonical) {
            existing.priority = existing.priority.max(priority);
            existing.task = task;
            debug!(
                request_id = %existing.id,
                key = %canonical,
                priority = ?existing.priority,
                "Prefetch request coalesced"
            );
            return existing.id;
        }

        let request = PrefetchRequest {
            id: Uuid::new_v4(),
            key,
            priority,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            task,
        };
        let id = request.id;

        // Observable: log request enqueue
        info!(
            request_id = %id,
            key = %canonical,
            priority = ?priority,
            "Prefetch request enqueued"
        );
        pending.insert(canonical, request);
        gauge!(METRIC_PREFETCH_QUEUE_LEN).set(pending.len() as f64);
        id
    }

    /// Run up to `batch_limit` pending prefetches, at most `concurrency` at a
    /// time. Failures are logged and counted; they never abort the drain.
    ///
    /// Returns the number of requests taken from the queue.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> usize {
        let batch = self.take_batch();
        if batch.is_empty() {
            return 0;
        }

        let drain_started_at = Instant::now();
        let taken = batch.len();
        info!(taken, "Prefetch drain starting");

        let client = &self.client;
        let mut results = stream::iter(batch)
            .map(|request| {
                let client = client.clone();
                async move {
                    let result = (request.task)(client).await;
                    (request.id, request.key, result)
                }
            })
            .buffer_unordered(self.config.concurrency_non_zero().get());

        let mut failed = 0_usize;
        while let Some((id, key, result)) = results.next().await {
            match result {
                Ok(()) => {
                    counter!(METRIC_PREFETCH_TOTAL, "outcome" => "ok").increment(1);
                    debug!(request_id = %id, key = %key, "Prefetch complete");
                }
                Err(error) => {
                    failed += 1;
                    counter!(METRIC_PREFETCH_TOTAL, "outcome" => "error").increment(1);
                    warn!(request_id = %id, key = %key, error = %error, "Prefetch failed");
                }
            }
        }

        info!(taken, failed, "Prefetch drain complete");
        histogram!(METRIC_PREFETCH_DRAIN_MS)
            .record(drain_started_at.elapsed().as_secs_f64() * 1000.0);
        taken
    }

    fn take_batch(&self) -> Vec<PrefetchRequest> {
        let mut pending = mutex_lock(&self.pending, SOURCE, "drain");
        let mut order: Vec<(Reverse<PrefetchPriority>, u64, CanonicalKey)> = pending
            .iter()
            .map(|(key, request)| (Reverse(request.priority), request.sequence, key.clone()))
            .collect();
        order.sort();

        let batch = order
            .into_iter()
            .take(self.config.batch_limit)
            .filter_map(|(_, _, key)| pending.remove(&key))
            .collect();
        gauge!(METRIC_PREFETCH_QUEUE_LEN).set(pending.len() as f64);
        batch
    }

    /// Drain on `config.interval` until the queue is dropped or the returned
    /// handle is aborted.
    pub fn spawn_auto_drain(self: &Arc<Self>) -> JoinHandle<()> {
        let queue: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                if !queue.is_empty() {
                    queue.drain().await;
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.pending, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending request without running it.
    pub fn clear(&self) {
        let mut pending = mutex_lock(&self.pending, SOURCE, "clear");
        let count = pending.len();
        pending.clear();
        gauge!(METRIC_PREFETCH_QUEUE_LEN).set(0.0);
        info!(count, "Prefetch queue cleared");
    }
}

impl fmt::Debug for PrefetchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchQueue")
            .field("config", &self.config)
            .field("pending", &self.len())
            .finish()
    }
}
