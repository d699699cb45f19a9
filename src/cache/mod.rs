//! Leadcache query cache.
//!
//! A client-side cache for asynchronous reads, keyed by structured query keys:
//!
//! - **Engine** ([`QueryClient`]): fetch dedup, staleness, abort-on-supersede,
//!   invalidation and garbage collection of unobserved entries
//! - **Adapter** ([`use_cache_query`]): binds a key to a renderer through the
//!   [`ExternalStore`] contract, with mount fetches and interval polling
//! - **Prefetch** ([`PrefetchQueue`]): prioritized background warming
//!
//! ## Configuration
//!
//! Engine defaults are controlled via `leadcache.toml`:
//!
//! ```toml
//! [query]
//! stale_time_ms = 0
//! gc_time_ms = 300000
//! refetch_on_window_focus = true
//! refetch_on_visibility = true
//!
//! [prefetch]
//! batch_limit = 32
//! concurrency = 4
//! interval_ms = 1000
//! ```

mod client;
mod config;
mod entry;
mod error;
mod focus;
mod keys;
mod lock;
mod observable;
mod observer;
mod prefetch;
mod store;

pub use client::{AbortSignal, FetchContext, QueryClient};
pub use config::{ClientConfig, PrefetchConfig, QueryOptions, ResolvedOptions, SetDataOptions};
pub use entry::{QueryEvent, QueryListener, QuerySnapshot, QueryStatus};
pub use error::{FetchError, QueryError};
pub use focus::{FocusTracker, Visibility};
pub use keys::{CanonicalKey, KeySegment, QueryKey, serialize};
pub use observable::{ExternalStore, Listener, Subscription};
pub use observer::{CacheQuery, RefetchHandle, use_cache_query};
pub use prefetch::{PrefetchPriority, PrefetchQueue};
