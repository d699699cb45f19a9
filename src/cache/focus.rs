//! Foreground state of the host application.
//!
//! The embedding layer reports document visibility and window focus here; the
//! query client reacts to a return to the foreground and mounted queries read
//! the current visibility before polling.

use tokio::sync::watch;

/// Document visibility as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Observable visibility cell.
#[derive(Debug)]
pub struct FocusTracker {
    visibility: watch::Sender<Visibility>,
}

impl FocusTracker {
    pub fn new() -> Self {
        let (visibility, _) = watch::channel(Visibility::Visible);
        Self { visibility }
    }

    /// Record a visibility change. Returns true when the document went from
    /// hidden to visible.
    pub fn set_visibility(&self, next: Visibility) -> bool {
        let mut regained = false;
        self.visibility.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            regained = next == Visibility::Visible;
            *current = next;
            true
        });
        regained
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    pub fn is_visible(&self) -> bool {
        self.visibility() == Visibility::Visible
    }

    /// Receiver that observes every visibility change.
    pub fn watch(&self) -> watch::Receiver<Visibility> {
        self.visibility.subscribe()
    }
}

impl Default for FocusTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_visible() {
        let tracker = FocusTracker::new();
        assert!(tracker.is_visible());
    }

    #[test]
    fn reports_regain_only_on_hidden_to_visible() {
        let tracker = FocusTracker::new();

        assert!(!tracker.set_visibility(Visibility::Visible));
        assert!(!tracker.set_visibility(Visibility::Hidden));
        assert!(!tracker.is_visible());
        assert!(!tracker.set_visibility(Visibility::Hidden));
        assert!(tracker.set_visibility(Visibility::Visible));
    }

    #[tokio::test]
    async fn watchers_observe_changes() {
        let tracker = FocusTracker::new();
        let mut rx = tracker.watch();

        tracker.set_visibility(Visibility::Hidden);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow_and_update(), Visibility::Hidden);
    }
}
