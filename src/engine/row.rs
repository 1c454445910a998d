//! Result-row data handed to the query's row sink.
//!
//! Unlike the wire-level [`crate::protocol::backend::query`] types, these
//! are owned: they outlive the read buffer the engine decoded them from.

use crate::protocol::types::FormatCode;

/// One column's static metadata, copied out of a `RowDescription` message.
#[derive(Debug, Clone)]
pub struct ColumnDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub format: FormatCode,
}

/// The column layout of an active query's result set.
#[derive(Debug, Clone, Default)]
pub struct RowDescription {
    pub columns: Vec<ColumnDescription>,
}

/// One decoded row. Column values are text-encoded bytes; `None` is SQL NULL.
#[derive(Debug, Clone)]
pub struct Row {
    pub values: Vec<Option<Vec<u8>>>,
}

impl Row {
    /// Decode column `index` as UTF-8 text, or `None` if NULL.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.values.get(index)?.as_deref().and_then(|bytes| {
            std::str::from_utf8(bytes).ok()
        })
    }
}

/// Outcome of a completed command, parsed from `CommandComplete`'s tag.
#[derive(Debug, Clone, Default)]
pub struct CommandStatus {
    pub tag: String,
    pub rows_affected: Option<u64>,
}
