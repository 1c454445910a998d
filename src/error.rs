//! Error types for the connection engine.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Parsed fields of a PostgreSQL ErrorResponse/NoticeResponse message.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    pub severity: Option<String>,
    pub severity_non_localized: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub internal_position: Option<u32>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

/// A PostgreSQL server error, carried by [`Error::Server`].
///
/// Wraps [`ErrorFields`] with the accessor surface callers expect: a
/// non-localized severity falls back to the localized one, and SQLSTATE
/// and message are always present per the protocol.
#[derive(Debug, Clone, Default)]
pub struct ServerError(pub ErrorFields);

impl ServerError {
    pub fn new(fields: ErrorFields) -> Self {
        Self(fields)
    }

    pub fn severity(&self) -> &str {
        self.0
            .severity_non_localized
            .as_deref()
            .or(self.0.severity.as_deref())
            .unwrap_or_default()
    }

    pub fn code(&self) -> &str {
        self.0.code.as_deref().unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.0.message.as_deref().unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.0.detail.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.0.hint.as_deref()
    }

    pub fn position(&self) -> Option<u32> {
        self.0.position
    }

    pub fn internal_position(&self) -> Option<u32> {
        self.0.internal_position
    }

    pub fn internal_query(&self) -> Option<&str> {
        self.0.internal_query.as_deref()
    }

    pub fn where_(&self) -> Option<&str> {
        self.0.where_.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.0.schema.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.0.table.as_deref()
    }

    pub fn column(&self) -> Option<&str> {
        self.0.column.as_deref()
    }

    pub fn data_type(&self) -> Option<&str> {
        self.0.data_type.as_deref()
    }

    pub fn constraint(&self) -> Option<&str> {
        self.0.constraint.as_deref()
    }

    pub fn file(&self) -> Option<&str> {
        self.0.file.as_deref()
    }

    pub fn line(&self) -> Option<u32> {
        self.0.line
    }

    pub fn routine(&self) -> Option<&str> {
        self.0.routine.as_deref()
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity(),
            self.message(),
            self.code()
        )?;
        if let Some(detail) = self.detail() {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

/// Errors produced by the connection engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad connection string, unknown sslmode, missing service entry, malformed pgpass line.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level connect failure.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// Server refused TLS while `sslmode=require`.
    #[error("server refused TLS")]
    TlsRefused,

    /// Server replied to SSLRequest with something other than 'S' or 'N'.
    #[error("unexpected response to SSLRequest: {0:#x}")]
    UnexpectedSslResponse(u8),

    /// Server closed the connection while negotiating TLS.
    #[error("server closed connection during SSL negotiation")]
    ServerClosedDuringSsl,

    /// Server requested an authentication mechanism we don't implement.
    #[error("unsupported authentication mechanism: {0}")]
    AuthMechanismUnsupported(String),

    /// Server's SCRAM iteration count was not positive.
    #[error("SCRAM server sent a non-positive iteration count")]
    ScramBadIterationCount,

    /// Server's final SCRAM signature did not match what we computed.
    #[error("SCRAM server signature verification failed")]
    ScramServerSignatureMismatch,

    /// A backend ErrorResponse.
    #[error("PostgreSQL error: {0}")]
    Server(ServerError),

    /// Protocol error (malformed message, unexpected message at this phase, etc.)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// A second query was attempted while one was already active.
    #[error("engine is busy with another query")]
    Busy,

    /// The connection died while a query or authentication was pending.
    #[error("connection disconnected")]
    Disconnected,

    /// `connect()` was called on an engine that is already connecting or connected.
    #[error("engine is already connected")]
    AlreadyConnected,

    /// Unsupported feature requested by a caller.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Value decode error (text encoding failures and the like).
    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::ConnectFailed(_)
            | Error::Disconnected
            | Error::TlsRefused
            | Error::UnexpectedSslResponse(_)
            | Error::ServerClosedDuringSsl => true,
            Error::Server(err) => matches!(err.severity(), "FATAL" | "PANIC"),
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(err) => Some(err.code()),
            _ => None,
        }
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized> From<zerocopy::error::CastError<Src, Dst>>
    for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}
