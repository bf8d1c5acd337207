//! Change notification handles shared by the storage backends.

use std::fmt;
use std::sync::Arc;

/// Callback invoked when a watched key changes.
pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

/// Keeps a watch alive. Dropping it stops notifications.
pub struct WatchGuard {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
    _resource: Option<Box<dyn Send>>,
}

impl WatchGuard {
    /// A guard that runs `cancel` when dropped.
    pub fn from_fn(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(cancel)),
            _resource: None,
        }
    }

    /// A guard that owns `resource` (e.g. a file watcher) until dropped.
    pub fn holding(resource: impl Send + 'static) -> Self {
        Self {
            on_drop: None,
            _resource: Some(Box::new(resource)),
        }
    }

    /// A guard that watches nothing.
    pub fn noop() -> Self {
        Self {
            on_drop: None,
            _resource: None,
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.on_drop.take() {
            cancel();
        }
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard")
            .field("active", &(self.on_drop.is_some() || self._resource.is_some()))
            .finish()
    }
}
