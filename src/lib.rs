//! An asynchronous PostgreSQL connection engine: transport, SCRAM
//! authentication, and the v3 query pipeline.
//!
//! # Features
//!
//! - **Zero-copy parsing**: message payloads are parsed directly from the read buffer
//! - **Single-threaded engine**: one [`Engine`] drives one physical connection with no
//!   internal locking, meant to be owned by an external connection pool
//! - **Full protocol support**: simple query, extended query, COPY IN/OUT, SCRAM-SHA-256
//! - **Config resolution**: connection URLs, `DBI:Pg:` DSNs, service files, `.pgpass`
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use pg_engine::{Engine, ConnectionUri};
//! use pg_engine::engine::pool::{PoolCollaborator, WeakEngine};
//!
//! struct NoopPool;
//! impl PoolCollaborator for NoopPool {
//!     fn engine_ready(&self, _engine: WeakEngine) {}
//!     fn engine_disconnected(&self, _engine: WeakEngine) {}
//!     fn notification(&self, _engine: WeakEngine, _channel: &str, _payload: &str) {}
//! }
//!
//! # async fn run() -> pg_engine::Result<()> {
//! let uri: ConnectionUri = "postgres://postgres@localhost/postgres".try_into()?;
//! let engine = Engine::new(uri, Rc::new(pg_engine::env::ProcessEnvironment));
//! engine.connect(Rc::new(NoopPool)).await?;
//! let handle = engine.simple_query("select 1").await?;
//! let _ = handle.completed.await;
//! # Ok(())
//! # }
//! ```

// private
mod buffer_pool;
mod buffer_set;
mod dsn;
mod error;
mod pgpass;
mod service_file;

// pub
pub mod engine;
pub mod env;
pub mod protocol;
pub mod uri;

pub use buffer_pool::BufferPool;
pub use buffer_set::BufferSet;
pub use engine::Engine;
pub use error::{Error, ErrorFields, Result, ServerError};
pub use uri::{ConnectionUri, SslMode};
