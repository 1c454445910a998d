//! Observable state published by the engine.
//!
//! The source models `connected`, `ready_for_query`, and each backend
//! parameter status as weakly-subscribed observables so the engine's own
//! lifetime never depends on whether anyone is watching. `tokio::sync::watch`
//! gives the same property for free: a [`Receiver`] is a fully independent
//! clone that never references the sender, so there is nothing here that
//! needs an explicit weak pointer.

use tokio::sync::watch;

/// A published value with independently-owned subscriber handles.
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            tx: watch::Sender::new(initial),
        }
    }

    /// Subscribe without depending on the engine's lifetime.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publish a new value to all subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Read the currently published value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}
