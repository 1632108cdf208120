//! # tds-conn
//!
//! TDS session core: the connection state machine, request lifecycle,
//! cancellation, and transaction management.
//!
//! A session is established with [`Connection::connect`], which runs the
//! PRELOGIN exchange, the optional TLS upgrade (tunneled inside PRELOGIN
//! packets), LOGIN7 authentication, and the initial session-option batch.
//! Afterwards the connection accepts one request at a time (SQL batches,
//! RPC calls, transaction-manager commands) and completes each at its
//! response's message boundary.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_conn::{Config, Connection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new("db.example.com", "sa", "secret").with_port(1433);
//!     let mut conn = Connection::connect(config).await?;
//!
//!     let outcome = conn.exec_sql_batch("SELECT name FROM sys.databases").await?;
//!     println!("{} rows", outcome.row_count);
//!
//!     conn.close();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod instance;
pub mod request;
pub mod state;
pub mod transaction;

pub use cancel::CancelHandle;
pub use config::Config;
pub use connection::Connection;
pub use error::{ConnectionError, ErrorCode, RequestError};
pub use event::{ConnectionEvent, EventSink};
pub use request::RequestOutcome;
pub use state::State;
pub use transaction::{IsolationLevel, Transaction};

// Re-exports so callers can build parameters and compare versions without
// depending on tds-wire directly.
pub use tds_wire::rpc::RpcParam;
pub use tds_wire::version::TdsVersion;
