//! Shared busy/idle state for named in-flight operations
//!
//! Unrelated consumers (a list view, a detail view, a status bar) observe the
//! same coordinator, so a request started by one of them is visible to all
//! without a second request being issued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// State map handed to subscribers: operation key → busy
///
/// Only busy keys are present; a missing key is idle.
pub type LoadingSnapshot = HashMap<String, bool>;

type Listener = Arc<dyn Fn(&LoadingSnapshot) + Send + Sync>;

#[derive(Default)]
struct Inner {
    /// Number of in-flight holders per key
    holders: Mutex<HashMap<String, usize>>,
    listeners: Mutex<Vec<(Uuid, Listener)>>,
}

/// Tracks in-flight operations by key and broadcasts every change
///
/// Overlapping operations that share a key coalesce: the key stays busy until
/// the last of them finishes. Subscribers receive the complete state map,
/// synchronously, on every `set_loading` call.
#[derive(Clone, Default)]
pub struct LoadingCoordinator {
    inner: Arc<Inner>,
}

impl LoadingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one holder of `key` as started (`true`) or finished (`false`)
    ///
    /// Finishing a key that has no holders is a no-op apart from the
    /// subscriber broadcast.
    pub fn set_loading(&self, key: &str, loading: bool) {
        let snapshot = {
            let mut holders = self.inner.holders.lock().unwrap_or_else(|e| e.into_inner());
            let count = if loading {
                let count = holders.entry(key.to_string()).or_insert(0);
                *count += 1;
                *count
            } else {
                match holders.get_mut(key) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        *count
                    }
                    _ => {
                        // Idle keys are dropped so per-job keys do not pile up
                        holders.remove(key);
                        0
                    }
                }
            };
            tracing::trace!(key, holders = count, "Loading state changed");
            snapshot_of(&holders)
        };

        // Listeners run outside the locks so they may call back in
        let listeners: Vec<Listener> = {
            let listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }

    pub fn is_loading(&self, key: &str) -> bool {
        let holders = self.inner.holders.lock().unwrap_or_else(|e| e.into_inner());
        holders.get(key).is_some_and(|count| *count > 0)
    }

    /// True when any key is busy
    pub fn any_loading(&self) -> bool {
        let holders = self.inner.holders.lock().unwrap_or_else(|e| e.into_inner());
        holders.values().any(|count| *count > 0)
    }

    pub fn snapshot(&self) -> LoadingSnapshot {
        let holders = self.inner.holders.lock().unwrap_or_else(|e| e.into_inner());
        snapshot_of(&holders)
    }

    /// Start an operation; it finishes when the guard is dropped
    pub fn begin(&self, key: impl Into<String>) -> LoadingGuard {
        let key = key.into();
        self.set_loading(&key, true);
        LoadingGuard {
            coordinator: self.clone(),
            key,
        }
    }

    /// Register a listener; it stays registered while the returned
    /// `Subscription` is alive
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LoadingSnapshot) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let mut listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

fn snapshot_of(holders: &HashMap<String, usize>) -> LoadingSnapshot {
    holders
        .iter()
        .map(|(key, count)| (key.clone(), *count > 0))
        .collect()
}

/// RAII holder of one loading key
#[must_use = "the operation is marked finished as soon as the guard is dropped"]
pub struct LoadingGuard {
    coordinator: LoadingCoordinator,
    key: String,
}

impl LoadingGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.coordinator.set_loading(&self.key, false);
    }
}

/// Handle returned by `subscribe`; dropping it unsubscribes
pub struct Subscription {
    id: Uuid,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut listeners = inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_idle_by_default() {
        let loading = LoadingCoordinator::new();
        assert!(!loading.is_loading("detections"));
        assert!(!loading.any_loading());
    }

    #[test]
    fn test_overlapping_holders_keep_key_busy() {
        let loading = LoadingCoordinator::new();
        loading.set_loading("detections", true);
        loading.set_loading("detections", true);

        loading.set_loading("detections", false);
        assert!(loading.is_loading("detections"), "first completion must not flip to idle");

        loading.set_loading("detections", false);
        assert!(!loading.is_loading("detections"));
    }

    #[test]
    fn test_release_of_idle_key_is_noop() {
        let loading = LoadingCoordinator::new();
        loading.set_loading("statistics", false);
        loading.set_loading("statistics", true);
        assert!(loading.is_loading("statistics"));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let loading = LoadingCoordinator::new();
        let a = loading.begin("detection:abc123");
        let b = loading.begin("detection:abc123");
        drop(a);
        assert!(loading.is_loading("detection:abc123"));
        drop(b);
        assert!(!loading.is_loading("detection:abc123"));
    }

    #[test]
    fn test_finished_keys_leave_the_state_map() {
        let loading = LoadingCoordinator::new();
        for n in 0..100 {
            let _busy = loading.begin(format!("detection:{n}"));
        }
        loading.set_loading("detection:never-started", false);

        assert!(loading.snapshot().is_empty());

        let _busy = loading.begin("detections");
        let snapshot = loading.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("detections"), Some(&true));
    }

    #[test]
    fn test_subscribers_get_full_state_on_every_call() {
        let loading = LoadingCoordinator::new();
        let seen: Arc<Mutex<Vec<LoadingSnapshot>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let _sub = loading.subscribe(move |state| sink.lock().unwrap().push(state.clone()));

        loading.set_loading("detections", true);
        loading.set_loading("statistics", true);
        loading.set_loading("detections", false);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].get("detections"), Some(&true));
        assert_eq!(seen[1].get("statistics"), Some(&true));
        assert_eq!(seen[2].get("detections"), None);
        assert_eq!(seen[2].get("statistics"), Some(&true));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let loading = LoadingCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = loading.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        loading.set_loading("k", true);
        sub.unsubscribe();
        loading.set_loading("k", false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loading.subscriber_count(), 0);
    }

    #[test]
    fn test_listener_may_query_coordinator() {
        let loading = LoadingCoordinator::new();
        let coordinator = loading.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let _sub = loading.subscribe(move |_| {
            sink.lock().unwrap().push(coordinator.is_loading("k"));
        });

        loading.set_loading("k", true);
        loading.set_loading("k", false);

        assert_eq!(*observed.lock().unwrap(), vec![true, false]);
    }
}
