//! # tds-wire
//!
//! Pure implementation of the TDS (Tabular Data Stream) wire protocol as
//! spoken by the connection core: packet framing structures, the PRELOGIN
//! and LOGIN7 handshake payloads, SQL batch / RPC / transaction-manager
//! request encoding, and token stream decoding for server responses.
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic
//! and makes no assumptions about the async runtime. Higher-level crates
//! build upon this foundation to provide framing and session management.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod batch;
pub mod codec;
pub mod error;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod rpc;
pub mod tm;
pub mod token;
pub mod types;
pub mod version;

pub use error::ProtocolError;
pub use login7::Login7;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType,
};
pub use prelogin::{EncryptionLevel, PreLogin};
pub use rpc::{ProcId, RpcParam, RpcRequest};
pub use token::{
    ColMetaData, ColumnDef, Done, DoneStatus, EnvChange, LoginAck, ReturnValue, Row,
    ServerMessage, Token, TokenStreamDecoder, TokenType,
};
pub use types::TypeId;
pub use version::TdsVersion;
