//! Ordered, idempotent teardown.
//!
//! Every step here is plain in-memory bookkeeping (channel senders being
//! dropped or notified), not socket I/O beyond dropping the `Transport`
//! itself, so the whole sequence runs synchronously from a `Drop` impl as
//! well as from an explicit disconnect path.

use crate::engine::EngineInner;

/// Run the ten-step teardown sequence. Safe to call more than once; only
/// the first call has any effect.
pub fn run(inner: &mut EngineInner) {
    if inner.torn_down {
        return;
    }
    inner.torn_down = true;

    // 1. fail the active query, if any. The `Query` itself lives on the
    // caller's stack (see `Engine::run_query_cycle`), which is responsible
    // for finishing it with `Disconnected` on the same error path that
    // leads here; this step just clears the guard.
    inner.query_active = false;
    inner.backpressure.unsubscribe();

    // 2 & 3. cancel the idle/authenticated futures by dropping their
    // senders; a receiver still awaiting one sees a cancellation.
    inner.idle_tx.take();
    inner.authenticated_tx.take();

    // 4. finish the connected observable.
    inner.connected.set(false);
    inner.ready_for_query.set(String::new());

    // 5, 6, 7. the outgoing sink and incoming source are both just the
    // transport's two halves in this engine; dropping it closes the socket
    // and ends both directions at once.
    inner.transport = None;

    // 8. there is no separately-tracked connect future to cancel here: the
    // caller's own `connect().await` unwinds on drop.

    // 9. finish every parameter observable.
    inner.parameter_statuses.clear();

    // 10. there is no separate codec object to drop; the protocol module
    // is stateless free functions.

    tracing::debug!("engine torn down");
    if let Some(pool) = inner.pool.take() {
        pool.engine_disconnected(crate::engine::pool::WeakEngine(inner.self_weak.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::env::ProcessEnvironment;
    use crate::uri::ConnectionUri;
    use std::rc::Rc;

    #[test]
    fn teardown_is_idempotent() {
        let engine = Engine::new(ConnectionUri::default(), Rc::new(ProcessEnvironment));
        run(&mut engine.0.borrow_mut());
        assert!(engine.0.borrow().torn_down);
        // Second call must not panic or double-notify.
        run(&mut engine.0.borrow_mut());
        assert!(engine.0.borrow().torn_down);
    }
}
