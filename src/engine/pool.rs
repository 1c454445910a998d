//! The external connection pool's collaborator interface.
//!
//! The pool is an outer layer this crate doesn't own; it is represented
//! here only by the callbacks it must implement and the weak handle it
//! holds onto each engine.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::EngineInner;

/// Callbacks the pool receives as an engine moves through its lifecycle.
///
/// The pool is a passive observer: it is pushed state transitions rather
/// than polling for them.
pub trait PoolCollaborator {
    /// A `ReadyForQuery` arrived; the engine can accept new work.
    fn engine_ready(&self, engine: WeakEngine);

    /// `connected` transitioned to false.
    fn engine_disconnected(&self, engine: WeakEngine);

    /// An asynchronous `NOTIFY` arrived on some channel.
    fn notification(&self, engine: WeakEngine, channel: &str, payload: &str);
}

/// A weak handle to an [`Engine`](super::Engine), as held by the pool.
///
/// Does not keep the engine alive; upgrading after teardown yields `None`.
#[derive(Clone)]
pub struct WeakEngine(pub(crate) Weak<RefCell<EngineInner>>);

impl WeakEngine {
    /// Attempt to obtain a strong handle to the engine.
    pub fn upgrade(&self) -> Option<super::Engine> {
        self.0.upgrade().map(super::Engine)
    }
}

pub(crate) fn downgrade(inner: &Rc<RefCell<EngineInner>>) -> WeakEngine {
    WeakEngine(Rc::downgrade(inner))
}
