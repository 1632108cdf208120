//! Framing-level error type.

use std::sync::Arc;

use thiserror::Error;

/// Errors raised by the packet codec and message I/O.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Packet header failed to parse.
    #[error("invalid packet header: {0}")]
    InvalidHeader(#[from] tds_wire::ProtocolError),

    /// Header declared a length no packet can have.
    #[error("packet header declares invalid length {length}")]
    BadLength {
        /// Declared total length.
        length: usize,
    },

    /// Packet length exceeds the negotiated maximum.
    #[error("packet of {size} bytes exceeds maximum {max}")]
    PacketTooLarge {
        /// Declared packet size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Transport closed in the middle of a message.
    #[error("connection closed mid-message")]
    ConnectionClosed,

    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
