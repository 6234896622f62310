//! A small typed observer used for task lifecycle events.
//!
//! Every emitted event is delivered to every listener that was subscribed at
//! the moment of emission. Listeners never see each other and the emitter
//! never waits for anything they do beyond the synchronous call itself.

use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Multi-subscriber event hub. Cloning yields another handle to the same hub.
pub struct Events<E> {
    listeners: Arc<RwLock<Vec<Listener<E>>>>,
}

impl<E> Events<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a listener which will be called for every subsequent event.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub fn emit(&self, event: &E) {
        // Snapshot, so a listener may subscribe further listeners without
        // deadlocking on the lock.
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Clone for Events<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E> Default for Events<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Debug for Events<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Events({} listeners)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_every_listener_sees_every_event() {
        let events = Events::<u32>::new();
        let a = Arc::new(Mutex::new(vec![]));
        let b = Arc::new(Mutex::new(vec![]));

        let a2 = a.clone();
        events.subscribe(move |e| a2.lock().unwrap().push(*e));
        let b2 = b.clone();
        events.subscribe(move |e| b2.lock().unwrap().push(*e * 10));

        events.emit(&1);
        events.emit(&2);

        assert_eq!(*a.lock().unwrap(), vec![1, 2]);
        assert_eq!(*b.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_clones_share_listeners() {
        let events = Events::<()>::new();
        let other = events.clone();
        other.subscribe(|_| {});
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let events = Events::<&'static str>::new();
        events.emit(&"early");

        let seen = Arc::new(Mutex::new(vec![]));
        let seen2 = seen.clone();
        events.subscribe(move |e| seen2.lock().unwrap().push(*e));
        events.emit(&"late");

        assert_eq!(*seen.lock().unwrap(), vec!["late"]);
    }
}
