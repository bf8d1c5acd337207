//! Synchronous subscriber lists with panic isolation.
//!
//! Every `subscribe` hands back a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the listener. A listener that panics
//! is logged and skipped, and the remaining listeners still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerSet<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<E>)>>,
}

/// A list of listeners for events of type `E`.
pub struct Listeners<E> {
    set: Arc<ListenerSet<E>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            set: Arc::new(ListenerSet {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.set.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries().push((id, Arc::new(listener)));

        let weak: Weak<ListenerSet<E>> = Arc::downgrade(&self.set);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(set) = weak.upgrade() {
                    let mut entries = set.entries.lock().unwrap_or_else(|e| e.into_inner());
                    entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Call every listener with `event`, in registration order.
    pub fn notify(&self, event: &E) {
        // Snapshot so listeners may subscribe or unsubscribe while running
        let snapshot: Vec<Callback<E>> = self.entries().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("Listener panicked; continuing with remaining listeners");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.entries().clear();
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Callback<E>)>> {
        self.set.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe`. Unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
