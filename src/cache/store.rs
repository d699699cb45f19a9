//! Entry storage and garbage collection.
//!
//! The store maps canonical keys to entries and owns entry lifecycle: entries
//! are created lazily on first access and destroyed only when a GC timer fires
//! while the entry has no subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use super::entry::{Entry, ErasedValue, GcTimer};
use super::keys::{CanonicalKey, QueryKey};

const METRIC_GC_EVICT_TOTAL: &str = "leadcache_gc_evict_total";

/// Called when a GC timer fires, with the key and the timer id that fired.
pub(crate) type Collector = Arc<dyn Fn(&CanonicalKey, u64) + Send + Sync>;

pub(crate) struct CacheStore {
    entries: HashMap<CanonicalKey, Entry>,
    collector: Collector,
    timer_ids: AtomicU64,
}

impl CacheStore {
    pub fn new(collector: Collector) -> Self {
        Self {
            entries: HashMap::new(),
            collector,
            timer_ids: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &CanonicalKey) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    /// Fetch the entry for `key`, creating it (seeded with `initial`, if any)
    /// on first access.
    pub fn get_or_insert(
        &mut self,
        canonical: &CanonicalKey,
        key: &QueryKey,
        initial: Option<ErasedValue>,
        stale_time: Duration,
        gc_time: Duration,
    ) -> &mut Entry {
        self.entries.entry(canonical.clone()).or_insert_with(|| {
            debug!(key = %canonical, seeded = initial.is_some(), "Query entry created");
            Entry::new(key.clone(), initial, stale_time, gc_time)
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of every entry under `prefix`; all keys when `prefix` is `None`.
    pub fn matching_keys(&self, prefix: Option<&QueryKey>) -> Vec<CanonicalKey> {
        let prefix = prefix.map(QueryKey::canonical);
        self.entries
            .keys()
            .filter(|key| prefix.as_ref().is_none_or(|prefix| key.matches_prefix(prefix)))
            .cloned()
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&CanonicalKey, &mut Entry)> {
        self.entries.iter_mut()
    }

    /// Arm a GC timer for an entry nobody is subscribed to.
    ///
    /// No-op while the entry has subscribers or a timer is already pending.
    pub fn arm_gc_if_orphaned(&mut self, canonical: &CanonicalKey) {
        let timer_id = self.timer_ids.fetch_add(1, Ordering::Relaxed);
        let collector = Arc::clone(&self.collector);

        let Some(entry) = self.entries.get_mut(canonical) else {
            return;
        };
        if !entry.subscribers.is_empty() || entry.gc_timer.is_some() {
            return;
        }

        let gc_time = entry.gc_time;
        let key = canonical.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(async move {
                    tokio::time::sleep(gc_time).await;
                    collector(&key, timer_id);
                });
                entry.gc_timer = Some(GcTimer {
                    id: timer_id,
                    handle,
                });
                debug!(key = %canonical, gc_time_ms = gc_time.as_millis() as u64, "GC timer armed");
            }
            Err(_) => {
                warn!(
                    key = %canonical,
                    "No async runtime to arm GC timer; entry retained until next access"
                );
            }
        }
    }

    /// Evict the entry if `timer_id` is still its pending timer and nobody
    /// subscribed in the meantime. Returns whether the entry was removed.
    pub fn collect(&mut self, canonical: &CanonicalKey, timer_id: u64) -> bool {
        let Some(entry) = self.entries.get_mut(canonical) else {
            return false;
        };
        let armed = entry
            .gc_timer
            .as_ref()
            .is_some_and(|timer| timer.id == timer_id);
        if !armed {
            return false;
        }
        entry.gc_timer = None;
        if !entry.subscribers.is_empty() {
            return false;
        }

        self.evict(canonical);
        info!(key = %canonical, "Query entry garbage collected");
        counter!(METRIC_GC_EVICT_TOTAL).increment(1);
        true
    }

    /// Remove an entry now, aborting its fetch and GC timer.
    pub fn evict(&mut self, canonical: &CanonicalKey) -> Option<Entry> {
        let mut entry = self.entries.remove(canonical)?;
        entry.abort_in_flight();
        entry.disarm_gc();
        Some(entry)
    }

    /// Remove every entry.
    pub fn clear(&mut self) -> usize {
        let keys: Vec<CanonicalKey> = self.entries.keys().cloned().collect();
        for key in &keys {
            self.evict(key);
        }
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::cache::entry::{QueryEvent, Subscriber};
    use crate::query_key;

    fn store_with_log() -> (CacheStore, Arc<Mutex<Vec<(CanonicalKey, u64)>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&fired);
        let collector: Collector = Arc::new(move |key: &CanonicalKey, id: u64| {
            log.lock().expect("log lock").push((key.clone(), id));
        });
        (CacheStore::new(collector), fired)
    }

    fn insert(store: &mut CacheStore, key: &QueryKey, gc_time: Duration) -> CanonicalKey {
        let canonical = key.canonical();
        store.get_or_insert(&canonical, key, None, Duration::ZERO, gc_time);
        canonical
    }

    #[test]
    fn entries_are_created_once() {
        let (mut store, _) = store_with_log();
        let key = query_key!["leads"];
        let canonical = insert(&mut store, &key, Duration::from_secs(1));

        store
            .get_or_insert(
                &canonical,
                &key,
                Some(Arc::new(1_u32) as ErasedValue),
                Duration::ZERO,
                Duration::from_secs(1),
            )
            .touch();

        assert_eq!(store.len(), 1);
        // The seed only applies on creation.
        assert!(store.get(&canonical).expect("entry").data.is_none());
    }

    #[test]
    fn matching_keys_filters_by_prefix() {
        let (mut store, _) = store_with_log();
        insert(&mut store, &query_key!["leads", 1], Duration::from_secs(1));
        insert(&mut store, &query_key!["leads", 2], Duration::from_secs(1));
        insert(&mut store, &query_key!["contacts", 1], Duration::from_secs(1));

        assert_eq!(store.matching_keys(Some(&query_key!["leads"])).len(), 2);
        assert_eq!(store.matching_keys(Some(&query_key!["contacts"])).len(), 1);
        assert_eq!(store.matching_keys(None).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_timer_fires_collector_after_gc_time() {
        let (mut store, fired) = store_with_log();
        let canonical = insert(&mut store, &query_key!["leads"], Duration::from_secs(10));

        store.arm_gc_if_orphaned(&canonical);
        let timer_id = store
            .get(&canonical)
            .and_then(|entry| entry.gc_timer.as_ref())
            .map(|timer| timer.id)
            .expect("timer armed");

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(fired.lock().expect("log lock").is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            fired.lock().expect("log lock").as_slice(),
            &[(canonical.clone(), timer_id)]
        );

        assert!(store.collect(&canonical, timer_id));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_id_does_not_evict() {
        let (mut store, _) = store_with_log();
        let canonical = insert(&mut store, &query_key!["leads"], Duration::from_secs(10));

        store.arm_gc_if_orphaned(&canonical);
        let first = store
            .get(&canonical)
            .and_then(|entry| entry.gc_timer.as_ref())
            .map(|timer| timer.id)
            .expect("timer armed");

        store.get_mut(&canonical).expect("entry").disarm_gc();
        store.arm_gc_if_orphaned(&canonical);

        assert!(!store.collect(&canonical, first));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribed_entries_are_not_armed() {
        let (mut store, _) = store_with_log();
        let canonical = insert(&mut store, &query_key!["leads"], Duration::from_secs(10));
        store.get_mut(&canonical).expect("entry").subscribers.insert(
            1,
            Subscriber {
                listener: Arc::new(|_: QueryEvent| {}),
                refetch_on_window_focus: false,
            },
        );

        store.arm_gc_if_orphaned(&canonical);
        assert!(store.get(&canonical).expect("entry").gc_timer.is_none());
    }
}
