//! TDS pre-login message handling.
//!
//! The pre-login message is the first exchange of a session. It negotiates
//! the protocol version and, critically for the connection core, the
//! encryption level: a server answering `On` causes the TLS handshake to be
//! tunneled inside PRELOGIN-typed packets before LOGIN7 is sent.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Pre-login option types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name validation.
    Instance = 0x02,
    /// Client thread ID (informational).
    ThreadId = 0x03,
    /// MARS support.
    Mars = 0x04,
    /// Terminator (end of option table).
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Create from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Version),
            0x01 => Ok(Self::Encryption),
            0x02 => Ok(Self::Instance),
            0x03 => Ok(Self::ThreadId),
            0x04 => Ok(Self::Mars),
            0xFF => Ok(Self::Terminator),
            _ => Err(ProtocolError::InvalidPreloginOption(value)),
        }
    }
}

/// Encryption level negotiated in pre-login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encryption is off (login-only on the server side).
    #[default]
    Off = 0x00,
    /// Encryption is on for the whole session.
    On = 0x01,
    /// Encryption is not supported.
    NotSupported = 0x02,
    /// Encryption is required.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Create from a raw byte value.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::On,
            0x02 => Self::NotSupported,
            0x03 => Self::Required,
            _ => Self::Off,
        }
    }

    /// Whether this level commits the session to TLS.
    #[must_use]
    pub const fn requires_tls(&self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

/// Pre-login message builder and parser.
///
/// Used for both the client request and the server response. The VERSION
/// field is asymmetric: the client sends its requested TDS version, the
/// server answers with its product version, and the effective TDS version is
/// only settled by the LOGINACK token after login.
#[derive(Debug, Clone, Default)]
pub struct PreLogin {
    /// TDS version (client request) or raw server version (response).
    pub version: TdsVersion,
    /// Sub-build number accompanying the version.
    pub sub_build: u16,
    /// Encryption level.
    pub encryption: EncryptionLevel,
    /// Instance name, for named-instance validation.
    pub instance: Option<String>,
    /// Client thread ID.
    pub thread_id: Option<u32>,
    /// MARS requested/supported.
    pub mars: bool,
}

impl PreLogin {
    /// Create a pre-login request with the given encryption level.
    #[must_use]
    pub fn new(version: TdsVersion, encryption: EncryptionLevel) -> Self {
        Self {
            version,
            sub_build: 0,
            encryption,
            instance: None,
            thread_id: None,
            mars: false,
        }
    }

    /// Set the instance name to validate.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the client thread ID.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Encode the pre-login message to bytes.
    ///
    /// Layout per MS-TDS 2.2.6.4: a table of 5-byte option headers
    /// (type + big-endian offset + big-endian length), a terminator byte,
    /// then the option data at the given offsets.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut option_count = 3; // version, encryption, mars
        if self.instance.is_some() {
            option_count += 1;
        }
        if self.thread_id.is_some() {
            option_count += 1;
        }

        let header_size = option_count * 5 + 1;
        let mut buf = BytesMut::with_capacity(header_size + 32);
        let mut data = BytesMut::new();
        let mut offset = header_size as u16;

        // VERSION: 4 bytes big-endian + 2 bytes sub-build little-endian
        buf.put_u8(PreLoginOption::Version as u8);
        buf.put_u16(offset);
        buf.put_u16(6);
        data.put_u32(self.version.raw());
        data.put_u16_le(self.sub_build);
        offset += 6;

        // ENCRYPTION: single byte
        buf.put_u8(PreLoginOption::Encryption as u8);
        buf.put_u16(offset);
        buf.put_u16(1);
        data.put_u8(self.encryption as u8);
        offset += 1;

        if let Some(ref instance) = self.instance {
            let len = instance.len() as u16 + 1; // trailing NUL
            buf.put_u8(PreLoginOption::Instance as u8);
            buf.put_u16(offset);
            buf.put_u16(len);
            data.put_slice(instance.as_bytes());
            data.put_u8(0);
            offset += len;
        }

        if let Some(thread_id) = self.thread_id {
            buf.put_u8(PreLoginOption::ThreadId as u8);
            buf.put_u16(offset);
            buf.put_u16(4);
            data.put_u32(thread_id);
            offset += 4;
        }

        // MARS: single byte
        buf.put_u8(PreLoginOption::Mars as u8);
        buf.put_u16(offset);
        buf.put_u16(1);
        data.put_u8(u8::from(self.mars));

        buf.put_u8(PreLoginOption::Terminator as u8);
        buf.put_slice(&data);
        buf.freeze()
    }

    /// Decode a pre-login message.
    ///
    /// Offsets in the option table are absolute from the start of the
    /// payload; unknown option types are skipped rather than rejected so a
    /// newer server cannot break the handshake.
    pub fn decode(mut src: impl Buf) -> Result<Self, ProtocolError> {
        let mut prelogin = Self::default();

        let mut options = Vec::new();
        loop {
            if src.remaining() < 1 {
                return Err(ProtocolError::UnexpectedEof);
            }

            let option_type = src.get_u8();
            if option_type == PreLoginOption::Terminator as u8 {
                break;
            }

            if src.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }

            let offset = src.get_u16() as usize;
            let length = src.get_u16() as usize;
            options.push((option_type, offset, length));
        }

        let header_size = options.len() * 5 + 1;
        let data = src.copy_to_bytes(src.remaining());

        for (option_type, packet_offset, length) in options {
            // Offsets are absolute; the data buffer starts after the table.
            if packet_offset < header_size {
                continue;
            }
            let start = packet_offset - header_size;
            if start + length > data.len() {
                continue;
            }
            let field = &data[start..start + length];

            match PreLoginOption::from_u8(option_type) {
                Ok(PreLoginOption::Version) if length >= 6 => {
                    let raw = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
                    prelogin.version = TdsVersion::new(raw);
                    prelogin.sub_build = u16::from_le_bytes([field[4], field[5]]);
                }
                Ok(PreLoginOption::Encryption) if length >= 1 => {
                    prelogin.encryption = EncryptionLevel::from_u8(field[0]);
                }
                Ok(PreLoginOption::Instance) if length > 0 => {
                    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
                    if let Ok(s) = core::str::from_utf8(&field[..end]) {
                        if !s.is_empty() {
                            prelogin.instance = Some(s.to_string());
                        }
                    }
                }
                Ok(PreLoginOption::ThreadId) if length >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([field[0], field[1], field[2], field[3]]));
                }
                Ok(PreLoginOption::Mars) if length >= 1 => {
                    prelogin.mars = field[0] != 0;
                }
                _ => {}
            }
        }

        Ok(prelogin)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_starts_with_version_option() {
        let prelogin = PreLogin::new(TdsVersion::V7_4, EncryptionLevel::Off);
        let encoded = prelogin.encode();
        assert_eq!(encoded[0], PreLoginOption::Version as u8);
    }

    #[test]
    fn roundtrip_preserves_negotiation_fields() {
        let original = PreLogin::new(TdsVersion::V7_4, EncryptionLevel::On)
            .with_instance("SQLEXPRESS")
            .with_thread_id(0x1234);

        let decoded = PreLogin::decode(original.encode().as_ref()).unwrap();
        assert_eq!(decoded.version, TdsVersion::V7_4);
        assert_eq!(decoded.encryption, EncryptionLevel::On);
        assert_eq!(decoded.instance.as_deref(), Some("SQLEXPRESS"));
        assert_eq!(decoded.thread_id, Some(0x1234));
        assert!(!decoded.mars);
    }

    #[test]
    fn encryption_levels() {
        assert!(EncryptionLevel::On.requires_tls());
        assert!(EncryptionLevel::Required.requires_tls());
        assert!(!EncryptionLevel::Off.requires_tls());
        assert!(!EncryptionLevel::NotSupported.requires_tls());
    }

    #[test]
    fn truncated_option_table_is_an_error() {
        // A lone option type byte with no offset/length following.
        let bytes = [PreLoginOption::Encryption as u8];
        assert!(matches!(
            PreLogin::decode(&bytes[..]),
            Err(ProtocolError::UnexpectedEof)
        ));
    }
}
