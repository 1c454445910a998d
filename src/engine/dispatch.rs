//! Post-ready backend message dispatch: reads messages for one active query
//! until the next `ReadyForQuery`, reacting to each by kind.
//!
//! An exhaustive match over backend message kinds, rather than a
//! string-keyed table, since `RawMessage::type_byte` is already a sealed
//! set of bytes.

use std::rc::Rc;

use crate::engine::backpressure::BackpressureCoordinator;
use crate::engine::pool::{PoolCollaborator, WeakEngine};
use crate::engine::query::Query;
use crate::engine::row::{ColumnDescription, CommandStatus, Row, RowDescription};
use crate::engine::transport::Transport;
use crate::error::{Error, Result};
use crate::protocol::backend::{copy, error as backend_error, msg_type, query as backend_query};
use crate::protocol::frontend;
use crate::protocol::types::TransactionStatus;
use crate::BufferSet;

/// What changed over the course of one query's dispatch loop, to be folded
/// back into `EngineInner` once the caller re-acquires its borrow.
pub struct DispatchOutcome {
    pub transaction_status: TransactionStatus,
    pub parameter_updates: Vec<(String, String)>,
}

/// Drive backend messages for `query` until `ReadyForQuery` arrives.
pub async fn run_query(
    transport: &mut Transport,
    query: &mut Query,
    backpressure: &mut BackpressureCoordinator,
    pool: Option<&Rc<dyn PoolCollaborator>>,
    weak_self: &WeakEngine,
) -> Result<DispatchOutcome> {
    let mut buffers = BufferSet::new();
    let mut parameter_updates = Vec::new();

    loop {
        transport.read_message(&mut buffers).await?;

        match buffers.type_byte {
            msg_type::ROW_DESCRIPTION => {
                let parsed = backend_query::RowDescription::parse(&buffers.read_buffer)?;
                query.row_description = RowDescription {
                    columns: parsed
                        .iter()
                        .map(|f| ColumnDescription {
                            name: f.name.to_string(),
                            table_oid: f.table_oid(),
                            column_id: f.column_id(),
                            type_oid: f.type_oid(),
                            type_size: f.type_size(),
                            format: f.format(),
                        })
                        .collect(),
                };
            }
            msg_type::DATA_ROW => {
                backpressure.subscribe_if_needed(&query.flow_control);
                backpressure.wait_for_resume().await;
                let parsed = backend_query::DataRow::parse(&buffers.read_buffer)?;
                let values = parsed
                    .iter()
                    .map(|col| col.map(<[u8]>::to_vec))
                    .collect();
                query.deliver_row(Row { values });
            }
            msg_type::COMMAND_COMPLETE => {
                backpressure.unsubscribe();
                let complete = backend_query::CommandComplete::parse(&buffers.read_buffer)?;
                query.finish(Ok(CommandStatus {
                    tag: complete.tag.to_string(),
                    rows_affected: complete.rows_affected(),
                }));
            }
            msg_type::EMPTY_QUERY_RESPONSE
            | msg_type::NO_DATA
            | msg_type::PARSE_COMPLETE
            | msg_type::BIND_COMPLETE
            | msg_type::CLOSE_COMPLETE
            | msg_type::PORTAL_SUSPENDED => {
                tracing::debug!(kind = buffers.type_byte as char, "extended query protocol event");
            }
            msg_type::ERROR_RESPONSE => {
                backpressure.unsubscribe();
                let err = backend_error::ErrorResponse::parse(&buffers.read_buffer)?;
                tracing::warn!(message = err.message(), code = err.code(), "backend error");
                query.finish(Err(err.into_error()));
            }
            msg_type::NOTICE_RESPONSE => {
                let notice = backend_error::NoticeResponse::parse(&buffers.read_buffer)?;
                tracing::debug!(message = notice.message(), "backend notice");
            }
            msg_type::COPY_IN_RESPONSE => {
                copy::CopyInResponse::parse(&buffers.read_buffer)?;
                query.mark_ready_to_stream();
                stream_copy_in(transport, query).await?;
            }
            msg_type::COPY_OUT_RESPONSE => {
                copy::CopyOutResponse::parse(&buffers.read_buffer)?;
            }
            msg_type::COPY_DATA => {
                let data = copy::CopyData::parse(&buffers.read_buffer)?;
                query.deliver_row(Row {
                    values: vec![Some(data.data.to_vec())],
                });
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let notification =
                    crate::protocol::backend::auth::NotificationResponse::parse(&buffers.read_buffer)?;
                if let Some(pool) = pool {
                    pool.notification(weak_self.clone(), notification.channel, notification.payload);
                }
            }
            msg_type::PARAMETER_STATUS => {
                let status = crate::protocol::backend::ParameterStatus::parse(&buffers.read_buffer)?;
                parameter_updates.push((status.name.to_string(), status.value.to_string()));
            }
            msg_type::READY_FOR_QUERY => {
                let ready = crate::protocol::backend::ReadyForQuery::parse(&buffers.read_buffer)?;
                let transaction_status = ready
                    .transaction_status()
                    .ok_or_else(|| Error::Protocol("unknown ReadyForQuery status byte".into()))?;
                return Ok(DispatchOutcome {
                    transaction_status,
                    parameter_updates,
                });
            }
            other => {
                tracing::warn!(kind = other as char, "unrecognized backend message; ignoring");
            }
        }
    }
}

/// Pull `query`'s COPY IN source to exhaustion, sending `CopyData` for each
/// chunk, then `CopyDone`, `Close`, `Sync`. With no source attached, ends
/// the COPY immediately so the server doesn't hang waiting for input.
async fn stream_copy_in(transport: &mut Transport, query: &mut Query) -> Result<()> {
    use futures_util::StreamExt;

    let mut buf = Vec::new();
    if let Some(mut source) = query.copy_in_source.take() {
        while let Some(chunk) = source.next().await {
            buf.clear();
            frontend::write_copy_data(&mut buf, &chunk);
            transport.write_all(&buf).await?;
        }
    } else {
        tracing::warn!("server requested COPY IN but no input source was attached; ending immediately");
    }

    buf.clear();
    frontend::write_copy_done(&mut buf);
    frontend::write_close_statement(&mut buf, "");
    frontend::write_sync(&mut buf);
    transport.write_all(&buf).await?;
    transport.flush().await
}
