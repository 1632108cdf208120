//! Protocol-level error type.

use thiserror::Error;

/// Errors raised while encoding or decoding TDS wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Packet header carried an unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Packet header carried undefined status bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// A buffer ended before the structure being decoded was complete.
    ///
    /// For the incremental token decoder this means "wait for more bytes";
    /// at a message boundary it means the stream was truncated.
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// Token stream contained an unknown token type byte.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// A row arrived before any column metadata was seen.
    #[error("row token without preceding column metadata")]
    MissingMetadata,

    /// A column uses a data type the decoder does not handle.
    #[error("unsupported column type: 0x{0:02X}")]
    UnsupportedColumnType(u8),

    /// A length-delimited token did not decode within its declared length.
    #[error("malformed token: {0}")]
    MalformedToken(&'static str),

    /// PRELOGIN option table referenced data outside the payload.
    #[error("invalid prelogin option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// A string field was not valid UTF-16.
    #[error("invalid UTF-16 string data")]
    StringEncoding,
}
