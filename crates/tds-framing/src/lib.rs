//! # tds-framing
//!
//! Async framing layer for TDS packets.
//!
//! This crate turns raw byte streams into TDS packets and logical messages:
//!
//! ```text
//! transport → TdsCodec (packet framing) → MessageIo (message events) → session core
//! ```
//!
//! The transport is split into read and write halves so an ATTENTION packet
//! can be written while the session is blocked reading a response; this is
//! what makes query cancellation possible mid-result-set.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod framed;
pub mod message;
pub mod packet_codec;

pub use error::CodecError;
pub use framed::{PacketReader, PacketWriter};
pub use message::{AttentionWriter, MessageEvent, MessageIo};
pub use packet_codec::{Packet, TdsCodec};
