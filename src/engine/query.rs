//! The `Query` external-collaborator stub and the frontend message
//! sequences that drive it, simple and extended.
//!
//! This is the minimal shape the engine itself needs: row sink, completion
//! future, and the bytes to flush, not a pool-facing prepared-statement
//! cache, which is an external collaborator's concern.

use futures_util::Stream;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot, watch};

use crate::engine::row::{CommandStatus, Row, RowDescription};
use crate::error::Result;
use crate::protocol::frontend;

/// A chunked input source for `COPY ... FROM STDIN`.
pub type CopyInSource = Pin<Box<dyn Stream<Item = Vec<u8>>>>;

/// One query's state as it travels through the engine.
///
/// Built by [`simple_query`] or [`extended_query`]; consumed by the
/// connection's dispatch loop.
pub struct Query {
    pub sql: String,
    pub params: Vec<Option<Vec<u8>>>,
    pub extended: bool,
    pub(crate) row_description: RowDescription,
    pub(crate) row_sink: mpsc::UnboundedSender<Row>,
    pub(crate) completed: Option<oneshot::Sender<Result<CommandStatus>>>,
    pub(crate) flow_control: Option<watch::Receiver<bool>>,
    pub(crate) copy_in_source: Option<CopyInSource>,
    pub(crate) ready_to_stream: Option<oneshot::Sender<()>>,
}

/// The caller's side of an in-flight [`Query`]: a stream of rows and a
/// future that resolves once the server reports completion or failure.
pub struct QueryHandle {
    pub rows: mpsc::UnboundedReceiver<Row>,
    pub completed: oneshot::Receiver<Result<CommandStatus>>,
    /// Resolves once `CopyInResponse` arrives and the engine is about to
    /// start pulling from the query's input source. Only meaningful for a
    /// COPY IN query; never resolves otherwise.
    pub ready_to_stream: oneshot::Receiver<()>,
}

/// Build a simple-query `Query`. Simple queries never take bind parameters
/// or stream COPY input.
pub fn simple_query(sql: &str) -> (Query, QueryHandle) {
    build(sql, Vec::new(), false, None)
}

/// Build an extended-query `Query` with pre-encoded text parameter values.
pub fn extended_query(
    sql: &str,
    params: Vec<Option<Vec<u8>>>,
    copy_in_source: Option<CopyInSource>,
) -> (Query, QueryHandle) {
    build(sql, params, true, copy_in_source)
}

fn build(
    sql: &str,
    params: Vec<Option<Vec<u8>>>,
    extended: bool,
    copy_in_source: Option<CopyInSource>,
) -> (Query, QueryHandle) {
    let (row_tx, row_rx) = mpsc::unbounded_channel();
    let (completed_tx, completed_rx) = oneshot::channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    let query = Query {
        sql: sql.to_string(),
        params,
        extended,
        row_description: RowDescription::default(),
        row_sink: row_tx,
        completed: Some(completed_tx),
        flow_control: None,
        copy_in_source,
        ready_to_stream: Some(ready_tx),
    };
    let handle = QueryHandle {
        rows: row_rx,
        completed: completed_rx,
        ready_to_stream: ready_rx,
    };
    (query, handle)
}

impl Query {
    /// Resolve `completed` with a result, if not already resolved.
    pub(crate) fn finish(&mut self, result: Result<CommandStatus>) {
        if let Some(tx) = self.completed.take() {
            let _ = tx.send(result);
        }
    }

    /// Push a decoded row to the sink. Silently dropped if the caller has
    /// stopped listening.
    pub(crate) fn deliver_row(&self, row: Row) {
        let _ = self.row_sink.send(row);
    }

    /// Resolve `ready_to_stream`, if not already resolved. Called once
    /// `CopyInResponse` arrives, before the engine starts pulling from the
    /// query's input source.
    pub(crate) fn mark_ready_to_stream(&mut self) {
        if let Some(tx) = self.ready_to_stream.take() {
            let _ = tx.send(());
        }
    }
}

/// Serialize the simple-query message for `sql`.
pub fn write_simple_query(buf: &mut Vec<u8>, sql: &str) {
    frontend::write_query(buf, sql);
}

/// Serialize `Parse`, `Bind`, `Describe`, `Execute` for the unnamed
/// statement/portal, and unless `defer_sync` is set (COPY IN in flight),
/// `Close` + `Sync`.
pub fn write_extended_query(buf: &mut Vec<u8>, sql: &str, params: &[Option<Vec<u8>>], defer_sync: bool) {
    frontend::write_parse(buf, "", sql, &[]);
    let param_refs: Vec<Option<&[u8]>> = params.iter().map(|p| p.as_deref()).collect();
    frontend::write_bind(buf, "", "", &param_refs);
    frontend::write_describe_portal(buf, "");
    frontend::write_execute(buf, "", 0);
    if !defer_sync {
        frontend::write_close_statement(buf, "");
        frontend::write_sync(buf);
    }
}
