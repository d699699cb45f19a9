//! Query cache configuration.
//!
//! `ClientConfig` holds engine-wide defaults loaded from `leadcache.toml`;
//! `QueryOptions` carries per-call overrides and is resolved against the
//! defaults once per operation.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

// Default values for query configuration
const DEFAULT_STALE_TIME: Duration = Duration::ZERO;
const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);
const DEFAULT_PREFETCH_BATCH_LIMIT: usize = 32;
const DEFAULT_PREFETCH_CONCURRENCY: usize = 4;
const DEFAULT_PREFETCH_INTERVAL: Duration = Duration::from_secs(1);

/// Engine-wide defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// How long fetched data counts as fresh. Zero means always stale.
    pub stale_time: Duration,
    /// How long an entry without subscribers is retained.
    pub gc_time: Duration,
    /// Revalidate subscribed entries when the window regains focus.
    pub refetch_on_window_focus: bool,
    /// Revalidate subscribed entries when the document becomes visible again.
    pub refetch_on_visibility: bool,
    /// Default polling cadence for mounted queries.
    pub refetch_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
            refetch_on_window_focus: true,
            refetch_on_visibility: true,
            refetch_interval: None,
        }
    }
}

impl From<&crate::config::QuerySettings> for ClientConfig {
    fn from(settings: &crate::config::QuerySettings) -> Self {
        Self {
            stale_time: settings.stale_time,
            gc_time: settings.gc_time,
            refetch_on_window_focus: settings.refetch_on_window_focus,
            refetch_on_visibility: settings.refetch_on_visibility,
            refetch_interval: settings.refetch_interval,
        }
    }
}

/// Per-call options. Unset fields inherit from [`ClientConfig`].
pub struct QueryOptions<T> {
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    pub refetch_on_window_focus: Option<bool>,
    /// Polling cadence for a mounted query. `Some(Duration::ZERO)` turns
    /// polling off even when the client default enables it.
    pub refetch_interval: Option<Duration>,
    /// Seed value used when the entry is created by this call.
    pub initial_data: Option<Arc<T>>,
    /// When false, operations serve cached data and never fetch.
    pub enabled: bool,
}

impl<T> QueryOptions<T> {
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_window_focus = Some(enabled);
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn initial_data(mut self, value: T) -> Self {
        self.initial_data = Some(Arc::new(value));
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Resolve against the client defaults.
    pub fn resolve(&self, defaults: &ClientConfig) -> ResolvedOptions {
        let refetch_interval = match self.refetch_interval {
            Some(interval) if interval.is_zero() => None,
            Some(interval) => Some(interval),
            None => defaults.refetch_interval.filter(|interval| !interval.is_zero()),
        };

        ResolvedOptions {
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            gc_time: self.gc_time.unwrap_or(defaults.gc_time),
            refetch_on_window_focus: self
                .refetch_on_window_focus
                .unwrap_or(defaults.refetch_on_window_focus),
            refetch_interval,
            enabled: self.enabled,
        }
    }
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            stale_time: None,
            gc_time: None,
            refetch_on_window_focus: None,
            refetch_interval: None,
            initial_data: None,
            enabled: true,
        }
    }
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            stale_time: self.stale_time,
            gc_time: self.gc_time,
            refetch_on_window_focus: self.refetch_on_window_focus,
            refetch_interval: self.refetch_interval,
            initial_data: self.initial_data.clone(),
            enabled: self.enabled,
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_interval", &self.refetch_interval)
            .field("has_initial_data", &self.initial_data.is_some())
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Options after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub refetch_on_window_focus: bool,
    pub refetch_interval: Option<Duration>,
    pub enabled: bool,
}

/// Options for `QueryClient::set_query_data`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetDataOptions {
    /// Skip notifying subscribers when the new value equals the previous one.
    pub silent_if_equal: bool,
}

/// Prefetch queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchConfig {
    /// Maximum requests taken per drain.
    pub batch_limit: usize,
    /// Maximum prefetches running at once during a drain.
    pub concurrency: usize,
    /// Cadence of the auto-drain task.
    pub interval: Duration,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_PREFETCH_BATCH_LIMIT,
            concurrency: DEFAULT_PREFETCH_CONCURRENCY,
            interval: DEFAULT_PREFETCH_INTERVAL,
        }
    }
}

impl From<&crate::config::PrefetchSettings> for PrefetchConfig {
    fn from(settings: &crate::config::PrefetchSettings) -> Self {
        Self {
            batch_limit: settings.batch_limit.get(),
            concurrency: settings.concurrency.get(),
            interval: settings.interval,
        }
    }
}

impl PrefetchConfig {
    /// Returns the concurrency as NonZeroUsize, clamping to 1 if zero.
    pub fn concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.concurrency).unwrap_or(NonZeroUsize::MIN)
    }
}
