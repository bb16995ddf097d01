//! Watcher registry: (subject, kind) to interested listeners.

use std::sync::Arc;

use dashmap::DashMap;
use directory_wire::{ChangeOp, WatchKind};
use tracing::debug;

/// Listener for watch-event notifications.
///
/// Invoked once per changed instance, from the event dispatcher.
pub trait WatchListener: Send + Sync {
    /// Process one discrete change to a watched subject
    fn process(&self, subject: &str, op: ChangeOp, payload: &[u8]);
}

impl<F> WatchListener for F
where
    F: Fn(&str, ChangeOp, &[u8]) + Send + Sync,
{
    fn process(&self, subject: &str, op: ChangeOp, payload: &[u8]) {
        self(subject, op, payload)
    }
}

/// A watch carried by a pending request; stored in the registry only once
/// the originating request completes successfully.
#[derive(Clone)]
pub struct WatchRegistration {
    /// Subject the watch covers
    pub subject: String,
    /// What the watch covers on that subject
    pub kind: WatchKind,
    /// Listener to notify
    pub listener: Arc<dyn WatchListener>,
}

impl std::fmt::Debug for WatchRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistration")
            .field("subject", &self.subject)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Mapping from (subject, kind) to the set of interested listeners.
///
/// Listener identity is the `Arc` pointer, giving set semantics: adding
/// the same listener handle twice is a no-op.
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: DashMap<(String, WatchKind), Vec<Arc<dyn WatchListener>>>,
}

impl std::fmt::Debug for WatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherRegistry")
            .field("keys", &self.watchers.len())
            .finish()
    }
}

impl WatcherRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for (subject, kind). Duplicate handles are ignored.
    pub fn register(&self, subject: &str, kind: WatchKind, listener: Arc<dyn WatchListener>) {
        let mut entry = self
            .watchers
            .entry((subject.to_string(), kind))
            .or_default();
        if entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            debug!(subject, ?kind, "watcher already registered");
            return;
        }
        entry.push(listener);
    }

    /// Snapshot of the listeners for (subject, kind); safe to iterate
    /// while the registry mutates.
    pub fn lookup(&self, subject: &str, kind: WatchKind) -> Vec<Arc<dyn WatchListener>> {
        self.watchers
            .get(&(subject.to_string(), kind))
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Remove one listener from (subject, kind)
    pub fn unregister(&self, subject: &str, kind: WatchKind, listener: &Arc<dyn WatchListener>) {
        if let Some(mut entry) = self.watchers.get_mut(&(subject.to_string(), kind)) {
            entry.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// Drop every listener for (subject, kind)
    pub fn clear_subject(&self, subject: &str, kind: WatchKind) {
        self.watchers.remove(&(subject.to_string(), kind));
    }

    /// Drop all watches; used on session close
    pub fn clear_all(&self) {
        self.watchers.clear();
    }

    /// Number of (subject, kind) keys with at least one listener
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    /// Whether the registry holds no watches
    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl WatchListener for Counter {
        fn process(&self, _subject: &str, _op: ChangeOp, _payload: &[u8]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        let registry = WatcherRegistry::new();
        let listener: Arc<dyn WatchListener> = Arc::new(Counter(AtomicUsize::new(0)));

        registry.register("svcA", WatchKind::Service, listener.clone());
        registry.register("svcA", WatchKind::Service, listener.clone());

        assert_eq!(registry.lookup("svcA", WatchKind::Service).len(), 1);
    }

    #[test]
    fn test_debug_format_elides_listeners() {
        let registry = WatcherRegistry::new();
        let listener: Arc<dyn WatchListener> = Arc::new(Counter(AtomicUsize::new(0)));
        registry.register("svcA", WatchKind::Service, listener);

        let rendered = format!("{registry:?}");
        assert!(rendered.contains("WatcherRegistry"));
        assert!(rendered.contains("keys: 1"));
    }

    #[test]
    fn test_kind_keys_are_independent() {
        let registry = WatcherRegistry::new();
        let listener: Arc<dyn WatchListener> = Arc::new(Counter(AtomicUsize::new(0)));

        registry.register("svcA", WatchKind::Service, listener.clone());
        registry.register("svcA", WatchKind::Metadata, listener.clone());

        assert_eq!(registry.lookup("svcA", WatchKind::Service).len(), 1);
        assert_eq!(registry.lookup("svcA", WatchKind::Metadata).len(), 1);

        registry.clear_subject("svcA", WatchKind::Service);
        assert!(registry.lookup("svcA", WatchKind::Service).is_empty());
        assert_eq!(registry.lookup("svcA", WatchKind::Metadata).len(), 1);
    }

    #[test]
    fn test_unregister_and_clear_all() {
        let registry = WatcherRegistry::new();
        let first: Arc<dyn WatchListener> = Arc::new(Counter(AtomicUsize::new(0)));
        let second: Arc<dyn WatchListener> = Arc::new(Counter(AtomicUsize::new(0)));

        registry.register("svcA", WatchKind::Service, first.clone());
        registry.register("svcA", WatchKind::Service, second.clone());
        assert_eq!(registry.lookup("svcA", WatchKind::Service).len(), 2);

        registry.unregister("svcA", WatchKind::Service, &first);
        let remaining = registry.lookup("svcA", WatchKind::Service);
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &second));

        registry.clear_all();
        assert!(registry.is_empty());
    }
}
