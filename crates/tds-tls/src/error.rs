//! TLS error type.

use thiserror::Error;

/// Errors raised while configuring or performing TLS negotiation.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Invalid TLS configuration.
    #[error("TLS configuration error: {0}")]
    Configuration(String),

    /// The server hostname is not a valid SNI name.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// The handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
}
