//! Per-key cache records and the snapshots derived from them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::QueryError;
use super::keys::QueryKey;

/// Type-erased cached value.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Result every caller awaiting one fetch observes.
pub(crate) type FetchOutcome = Result<Option<ErasedValue>, QueryError>;

pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Reason an entry notifies its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEvent {
    /// The entry changed; pull a fresh snapshot.
    Changed,
    /// The app returned to the foreground and the entry is stale; consumers
    /// should re-enter the fetch path.
    Revalidate,
}

/// Listener registered with the engine.
pub type QueryListener = Arc<dyn Fn(QueryEvent) + Send + Sync>;

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render-safe view of an entry at one instant.
///
/// `QueryClient::get_snapshot` hands out the same `Arc` until the entry
/// changes, so consumers can compare snapshots with `Arc::ptr_eq`.
#[derive(Debug)]
pub struct QuerySnapshot<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<QueryError>,
    pub status: QueryStatus,
    pub updated_at: Option<Instant>,
    pub is_stale: bool,
    pub is_fetching: bool,
}

impl<T> QuerySnapshot<T> {
    /// Snapshot for a read that could not be served, e.g. a type mismatch.
    pub fn failed(error: QueryError) -> Self {
        Self {
            data: None,
            error: Some(error),
            status: QueryStatus::Error,
            updated_at: None,
            is_stale: true,
            is_fetching: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

/// The fetch currently allowed to commit to an entry. Generations are unique
/// per client, so a fetch outliving an evicted entry never matches its
/// replacement.
pub(crate) struct InFlight {
    pub generation: u64,
    pub signal: CancellationToken,
    pub shared: SharedFetch,
}

pub(crate) struct Subscriber {
    pub listener: QueryListener,
    pub refetch_on_window_focus: bool,
}

pub(crate) struct GcTimer {
    pub id: u64,
    pub handle: JoinHandle<()>,
}

struct MemoSnapshot {
    version: u64,
    is_stale: bool,
    value: ErasedValue,
}

/// One cache record, keyed by canonical query key.
pub(crate) struct Entry {
    pub key: QueryKey,
    pub data: Option<ErasedValue>,
    pub error: Option<QueryError>,
    pub status: QueryStatus,
    pub updated_at: Option<Instant>,
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub in_flight: Option<InFlight>,
    pub subscribers: HashMap<u64, Subscriber>,
    pub gc_timer: Option<GcTimer>,
    version: u64,
    memo: Option<MemoSnapshot>,
}

impl Entry {
    pub fn new(
        key: QueryKey,
        initial: Option<ErasedValue>,
        stale_time: Duration,
        gc_time: Duration,
    ) -> Self {
        let (status, updated_at) = match initial {
            Some(_) => (QueryStatus::Success, Some(Instant::now())),
            None => (QueryStatus::Idle, None),
        };
        Self {
            key,
            data: initial,
            error: None,
            status,
            updated_at,
            stale_time,
            gc_time,
            in_flight: None,
            subscribers: HashMap::new(),
            gc_timer: None,
            version: 0,
            memo: None,
        }
    }

    /// Record a mutation so the next snapshot read rebuilds.
    pub fn touch(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Data older than `stale_time` (or never fetched) is stale.
    pub fn is_stale_at(&self, now: Instant) -> bool {
        match self.updated_at {
            Some(updated_at) => now.saturating_duration_since(updated_at) >= self.stale_time,
            None => true,
        }
    }

    /// Abort the in-flight fetch, if any. Returns whether one was aborted.
    pub fn abort_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some(in_flight) => {
                in_flight.signal.cancel();
                true
            }
            None => false,
        }
    }

    pub fn disarm_gc(&mut self) -> bool {
        match self.gc_timer.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn listeners(&self) -> Vec<QueryListener> {
        self.subscribers
            .values()
            .map(|subscriber| Arc::clone(&subscriber.listener))
            .collect()
    }

    pub fn wants_focus_refetch(&self) -> bool {
        self.subscribers
            .values()
            .any(|subscriber| subscriber.refetch_on_window_focus)
    }

    /// Typed view of the cached data.
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, QueryError> {
        downcast_value(&self.key, self.data.clone())
    }

    /// Memoized snapshot: the same `Arc` is returned while neither the entry
    /// nor its staleness has changed.
    pub fn snapshot<T: Send + Sync + 'static>(
        &mut self,
        now: Instant,
    ) -> Result<Arc<QuerySnapshot<T>>, QueryError> {
        let is_stale = self.is_stale_at(now);

        if let Some(memo) = &self.memo
            && memo.version == self.version
            && memo.is_stale == is_stale
            && let Ok(snapshot) = Arc::clone(&memo.value).downcast::<QuerySnapshot<T>>()
        {
            return Ok(snapshot);
        }

        let snapshot = Arc::new(QuerySnapshot {
            data: self.data_as::<T>()?,
            error: self.error.clone(),
            status: self.status,
            updated_at: self.updated_at,
            is_stale,
            is_fetching: self.is_fetching(),
        });
        self.memo = Some(MemoSnapshot {
            version: self.version,
            is_stale,
            value: Arc::clone(&snapshot) as ErasedValue,
        });
        Ok(snapshot)
    }
}

/// Downcast an erased value to the caller's type.
pub(crate) fn downcast_value<T: Send + Sync + 'static>(
    key: &QueryKey,
    value: Option<ErasedValue>,
) -> Result<Option<Arc<T>>, QueryError> {
    value
        .map(|value| {
            value
                .downcast::<T>()
                .map_err(|_| QueryError::type_mismatch::<T>(key.to_string()))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    fn entry_with(value: Option<u32>, stale_time: Duration) -> Entry {
        Entry::new(
            query_key!["leads"],
            value.map(|value| Arc::new(value) as ErasedValue),
            stale_time,
            Duration::from_secs(300),
        )
    }

    #[test]
    fn new_entry_without_initial_data_is_idle() {
        let entry = entry_with(None, Duration::ZERO);
        assert_eq!(entry.status, QueryStatus::Idle);
        assert!(entry.updated_at.is_none());
        assert!(entry.is_stale_at(Instant::now()));
    }

    #[test]
    fn new_entry_with_initial_data_is_success() {
        let entry = entry_with(Some(7), Duration::from_secs(60));
        assert_eq!(entry.status, QueryStatus::Success);
        assert!(!entry.is_stale_at(Instant::now()));
        assert_eq!(entry.data_as::<u32>().expect("typed").as_deref(), Some(&7));
    }

    #[test]
    fn zero_stale_time_is_always_stale() {
        let entry = entry_with(Some(1), Duration::ZERO);
        assert!(entry.is_stale_at(Instant::now()));
    }

    #[test]
    fn staleness_starts_at_updated_at_plus_stale_time() {
        let entry = entry_with(Some(1), Duration::from_secs(5));
        let updated_at = entry.updated_at.expect("updated");

        assert!(!entry.is_stale_at(updated_at + Duration::from_secs(2)));
        assert!(entry.is_stale_at(updated_at + Duration::from_secs(5)));
        assert!(entry.is_stale_at(updated_at + Duration::from_secs(6)));
    }

    #[test]
    fn snapshot_is_memoized_until_touched() {
        let mut entry = entry_with(Some(1), Duration::from_secs(60));
        let now = Instant::now();

        let first = entry.snapshot::<u32>(now).expect("snapshot");
        let second = entry.snapshot::<u32>(now).expect("snapshot");
        assert!(Arc::ptr_eq(&first, &second));

        entry.touch();
        let third = entry.snapshot::<u32>(now).expect("snapshot");
        assert!(!Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn snapshot_rebuilds_when_staleness_flips() {
        let mut entry = entry_with(Some(1), Duration::from_secs(5));
        let updated_at = entry.updated_at.expect("updated");

        let fresh = entry.snapshot::<u32>(updated_at).expect("snapshot");
        let stale = entry
            .snapshot::<u32>(updated_at + Duration::from_secs(10))
            .expect("snapshot");

        assert!(!fresh.is_stale);
        assert!(stale.is_stale);
    }

    #[test]
    fn snapshot_reports_type_mismatch() {
        let mut entry = entry_with(Some(1), Duration::ZERO);
        let error = entry
            .snapshot::<String>(Instant::now())
            .expect_err("wrong type");
        assert!(matches!(error, QueryError::TypeMismatch { .. }));
    }
}
