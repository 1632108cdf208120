//! # tds-tls
//!
//! TLS layer for TDS sessions.
//!
//! TDS 7.x interleaves the TLS handshake with the application protocol:
//! handshake records travel *inside* PRELOGIN-typed TDS packets. Standard
//! TLS socket APIs cannot express that, so this crate pairs a byte-level
//! rustls engine with [`TlsPreloginWrapper`], a stream adapter that wraps
//! outbound ciphertext in PRELOGIN packets and strips the packet headers
//! from inbound ones until the handshake completes. Afterwards the wrapper
//! becomes a transparent pass-through and all TDS traffic simply flows
//! through the TLS stream.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connector;
pub mod error;
pub mod wrapper;

pub use connector::TlsConnector;
pub use error::TlsError;
pub use wrapper::TlsPreloginWrapper;

// Re-export the stream type used by the session core.
pub use tokio_rustls::client::TlsStream;
