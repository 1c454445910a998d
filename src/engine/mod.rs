//! The per-connection engine: owns one physical backend connection and
//! drives it from plaintext socket through to a finished query.
//!
//! State lives in a single `Rc<RefCell<EngineInner>>` with no internal
//! locking, matching a strictly single-threaded cooperative scheduling
//! model: every public method here either runs to completion without
//! suspending across a held borrow, or briefly releases its borrow before
//! an `.await` point and re-acquires it after.

pub mod auth;
pub mod backpressure;
pub mod connection;
pub mod dispatch;
pub mod observable;
pub mod pool;
pub mod query;
pub mod row;
pub mod transport;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::protocol::types::TransactionStatus;
use crate::uri::ConnectionUri;

use observable::Observable;
use pool::{downgrade, PoolCollaborator, WeakEngine};
use query::{Query, QueryHandle};
use transport::Transport;

fn transaction_status_label(status: TransactionStatus) -> String {
    match status {
        TransactionStatus::Idle => "I".to_string(),
        TransactionStatus::InTransaction => "T".to_string(),
        TransactionStatus::Failed => "E".to_string(),
    }
}

/// Everything the engine needs to keep between calls. Lives behind
/// `Rc<RefCell<_>>`; never borrowed across an `.await`.
pub struct EngineInner {
    uri: ConnectionUri,
    env: Rc<dyn Environment>,
    self_weak: Weak<RefCell<EngineInner>>,

    connecting_or_connected: bool,
    transport: Option<Transport>,
    backend_pid: u32,
    backend_secret: u32,

    connected: Observable<bool>,
    ready_for_query: Observable<String>,
    parameter_statuses: HashMap<String, Observable<String>>,

    /// True while a query's frontend messages are on the wire and its
    /// `ReadyForQuery` hasn't arrived yet. The `Query` itself lives on the
    /// caller's stack (see [`Engine::run_query_cycle`]); this flag enforces
    /// one active query at a time.
    query_active: bool,
    backpressure: backpressure::BackpressureCoordinator,

    idle_tx: Option<tokio::sync::oneshot::Sender<()>>,
    authenticated_tx: Option<tokio::sync::oneshot::Sender<()>>,

    pool: Option<Rc<dyn PoolCollaborator>>,
    torn_down: bool,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        teardown::run(self);
    }
}

pub mod teardown;

/// A handle to one backend connection. Cheap to clone; all clones share
/// the same underlying state.
#[derive(Clone)]
pub struct Engine(pub(crate) Rc<RefCell<EngineInner>>);

impl Engine {
    /// Construct a not-yet-connected engine for `uri`.
    pub fn new(uri: ConnectionUri, env: Rc<dyn Environment>) -> Self {
        let inner = Rc::new(RefCell::new(EngineInner {
            uri,
            env,
            self_weak: Weak::new(),
            connecting_or_connected: false,
            transport: None,
            backend_pid: 0,
            backend_secret: 0,
            connected: Observable::new(false),
            ready_for_query: Observable::new(String::new()),
            parameter_statuses: HashMap::new(),
            query_active: false,
            backpressure: backpressure::BackpressureCoordinator::new(),
            idle_tx: None,
            authenticated_tx: None,
            pool: None,
            torn_down: false,
        }));
        inner.borrow_mut().self_weak = Rc::downgrade(&inner);
        Engine(inner)
    }

    /// A weak handle suitable for handing to an external pool.
    pub fn downgrade(&self) -> WeakEngine {
        downgrade(&self.0)
    }

    /// Subscribe to the `connected` observable (1 once bring-up succeeds, 0 after teardown).
    pub fn connected(&self) -> tokio::sync::watch::Receiver<bool> {
        self.0.borrow().connected.subscribe()
    }

    /// Subscribe to the `ready_for_query` observable: empty while busy,
    /// otherwise the transaction-status letter `I`/`T`/`E`.
    pub fn ready_for_query(&self) -> tokio::sync::watch::Receiver<String> {
        self.0.borrow().ready_for_query.subscribe()
    }

    /// A one-shot future that resolves the moment `AuthenticationOk` arrives
    /// during bring-up. Must be requested before or during [`Engine::connect`];
    /// a receiver requested after authentication has already completed never
    /// resolves. Cancelled (sender dropped) if bring-up fails or the engine
    /// tears down first.
    pub fn authenticated(&self) -> tokio::sync::oneshot::Receiver<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.0.borrow_mut().authenticated_tx = Some(tx);
        rx
    }

    /// A one-shot future that resolves the next time the connection becomes
    /// idle: once at the end of bring-up, then again at the end of every
    /// query cycle. Call again after each resolution to observe the next one.
    pub fn idle(&self) -> tokio::sync::oneshot::Receiver<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.0.borrow_mut().idle_tx = Some(tx);
        rx
    }

    /// Run the full connection bring-up: transport connect, optional TLS,
    /// startup, authentication, through to the first `ReadyForQuery`.
    ///
    /// Dropping this future before it resolves (e.g. via an outer
    /// `tokio::time::timeout`) tears the engine down cleanly: the
    /// in-progress `Transport` is a local variable here and is dropped
    /// along with the future, closing the socket, and `EngineInner`'s own
    /// `Drop` impl runs the rest of the sequence if the engine itself is
    /// also dropped.
    pub async fn connect(&self, pool: Rc<dyn PoolCollaborator>) -> Result<()> {
        let (uri, env, authenticated_tx) = {
            let mut inner = self.0.borrow_mut();
            if inner.connecting_or_connected {
                return Err(Error::AlreadyConnected);
            }
            inner.connecting_or_connected = true;
            inner.pool = Some(pool);
            (inner.uri.clone(), inner.env.clone(), inner.authenticated_tx.take())
        };

        tracing::debug!(host = %uri.host, port = uri.port, "connecting");

        let mut transport = Transport::connect(&uri).await?;
        let bring_up_result =
            connection::bring_up(&mut transport, &uri, env.as_ref(), authenticated_tx).await;

        let bring_up_result = match bring_up_result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "connection bring-up failed");
                teardown::run(&mut self.0.borrow_mut());
                return Err(e);
            }
        };

        let pool_handle = {
            let mut inner = self.0.borrow_mut();
            inner.transport = Some(transport);
            inner.backend_pid = bring_up_result.backend_pid;
            inner.backend_secret = bring_up_result.backend_secret;
            for (name, value) in bring_up_result.parameter_statuses {
                inner.parameter_statuses.insert(name, Observable::new(value));
            }
            inner.connected.set(true);
            inner
                .ready_for_query
                .set(transaction_status_label(bring_up_result.transaction_status));
            if let Some(tx) = inner.idle_tx.take() {
                let _ = tx.send(());
            }
            inner.pool.clone()
        };

        tracing::info!(pid = bring_up_result.backend_pid, "ready for query");
        if let Some(pool) = pool_handle {
            pool.engine_ready(self.downgrade());
        }
        Ok(())
    }

    /// Run a simple-query-protocol query. Fails with [`Error::Busy`] if a
    /// query is already active.
    pub async fn simple_query(&self, sql: &str) -> Result<QueryHandle> {
        let (mut query_state, handle) = query::simple_query(sql);
        let mut buf = Vec::new();
        query::write_simple_query(&mut buf, sql);
        self.run_query_cycle(&mut query_state, buf).await?;
        Ok(handle)
    }

    /// Run an extended-query-protocol query with pre-encoded text
    /// parameters. Fails with [`Error::Busy`] if a query is already active.
    pub async fn handle_query(
        &self,
        sql: &str,
        params: Vec<Option<Vec<u8>>>,
        copy_in_source: Option<query::CopyInSource>,
    ) -> Result<QueryHandle> {
        let defer_sync = copy_in_source.is_some();
        let (mut query_state, handle) = query::extended_query(sql, params.clone(), copy_in_source);
        let mut buf = Vec::new();
        query::write_extended_query(&mut buf, sql, &params, defer_sync);
        self.run_query_cycle(&mut query_state, buf).await?;
        Ok(handle)
    }

    async fn run_query_cycle(&self, query_state: &mut Query, outgoing: Vec<u8>) -> Result<()> {
        let mut transport = {
            let mut inner = self.0.borrow_mut();
            if inner.query_active {
                return Err(Error::Busy);
            }
            let transport = inner.transport.take().ok_or(Error::Disconnected)?;
            inner.query_active = true;
            inner.ready_for_query.set(String::new());
            transport
        };

        let write_result = async {
            transport.write_all(&outgoing).await?;
            transport.flush().await
        }
        .await;

        if let Err(e) = write_result {
            query_state.finish(Err(Error::Disconnected));
            self.fail_connection(transport);
            return Err(e);
        }

        let weak_self = self.downgrade();
        let pool = self.0.borrow().pool.clone();

        let outcome = {
            let mut backpressure = backpressure::BackpressureCoordinator::new();
            dispatch::run_query(
                &mut transport,
                query_state,
                &mut backpressure,
                pool.as_ref(),
                &weak_self,
            )
            .await
        };

        match outcome {
            Ok(outcome) => {
                let pool_handle = {
                    let mut inner = self.0.borrow_mut();
                    inner.transport = Some(transport);
                    for (name, value) in outcome.parameter_updates {
                        inner
                            .parameter_statuses
                            .entry(name)
                            .and_modify(|obs| obs.set(value.clone()))
                            .or_insert_with(|| Observable::new(value));
                    }
                    inner
                        .ready_for_query
                        .set(transaction_status_label(outcome.transaction_status));
                    inner.query_active = false;
                    if let Some(tx) = inner.idle_tx.take() {
                        let _ = tx.send(());
                    }
                    inner.pool.clone()
                };
                if let Some(pool) = pool_handle {
                    pool.engine_ready(self.downgrade());
                }
                Ok(())
            }
            Err(e) => {
                query_state.finish(Err(Error::Disconnected));
                self.fail_connection(transport);
                Err(e)
            }
        }
    }

    /// Drop the transport (closing the socket) and run full teardown; used
    /// whenever dispatch or a write encounters an unrecoverable error, per
    /// the policy that any exception inside dispatch is fatal for the
    /// connection.
    fn fail_connection(&self, transport: Transport) {
        drop(transport);
        teardown::run(&mut self.0.borrow_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ProcessEnvironment;

    #[tokio::test]
    async fn idle_and_authenticated_futures_are_cancelled_on_teardown() {
        let engine = Engine::new(ConnectionUri::default(), Rc::new(ProcessEnvironment));
        let idle_rx = engine.idle();
        let authenticated_rx = engine.authenticated();
        teardown::run(&mut engine.0.borrow_mut());
        assert!(idle_rx.await.is_err());
        assert!(authenticated_rx.await.is_err());
    }
}
