//! Push/pull bridge between the cache and a rendering layer.
//!
//! A producer notifies listeners that "something changed"; consumers then pull
//! the current snapshot. Snapshots are `Arc`s, and an unchanged store returns
//! the same `Arc`, so a consumer that re-renders on pointer change never
//! renders twice for one state.

use std::fmt;
use std::sync::Arc;

/// Change notification callback.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Value store observable by a rendering layer.
pub trait ExternalStore {
    type Snapshot;

    /// Register `listener`; it stays registered until the returned
    /// subscription is dropped or unsubscribed.
    fn subscribe(&self, listener: Listener) -> Subscription;

    /// Current snapshot. Must be safe to call during a render pass.
    fn get_snapshot(&self) -> Arc<Self::Snapshot>;

    /// Snapshot captured once at creation, used for the first paint so that
    /// hydration sees the same value the server rendered.
    fn get_server_snapshot(&self) -> Arc<Self::Snapshot>;
}

/// Handle to a registered listener; unsubscribes on drop.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.dispose_now();
    }

    fn dispose_now(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}
