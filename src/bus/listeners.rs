use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::util::lock;

/// Handle returned when a listener is registered; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An observer registry for one event kind.
///
/// Dispatch works on a snapshot, so a listener may add or remove listeners
/// (itself included) while it is being invoked. A listener removed during a
/// dispatch still sees the event in flight; a listener added during a
/// dispatch does not.
pub struct Listeners<F: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Arc<F>)>>,
}

impl<F: ?Sized> Listeners<F> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<F>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).push((id, listener));
        id
    }

    /// Returns `false` if the listener was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<F>> {
        lock(&self.entries)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;

    type Callback = dyn Fn(u32) + Send + Sync;

    #[test]
    fn listener_can_remove_itself_during_dispatch() {
        let registry: Arc<Listeners<Callback>> = Arc::new(Listeners::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id: Arc<OnceLock<ListenerId>> = Arc::new(OnceLock::new());

        let id = {
            let registry = registry.clone();
            let calls = calls.clone();
            let own_id = own_id.clone();
            registry.clone().add(Arc::new(move |_: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = own_id.get() {
                    registry.remove(*id);
                }
            }))
        };
        own_id.set(id).unwrap();

        for listener in registry.snapshot() {
            listener(1);
        }
        for listener in registry.snapshot() {
            listener(2);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert!(!registry.remove(id));
    }

    #[test]
    fn remove_only_touches_the_given_listener() {
        let registry: Listeners<Callback> = Listeners::new();
        let a = registry.add(Arc::new(|_: u32| {}));
        let _b = registry.add(Arc::new(|_: u32| {}));
        assert!(registry.remove(a));
        assert_eq!(registry.len(), 1);
    }
}
