//! TDS LOGIN7 packet construction.
//!
//! LOGIN7 carries the credentials and client metadata after the pre-login
//! exchange (and after the TLS upgrade when encryption was negotiated).
//! The packet is a fixed 94-byte header followed by a variable data section
//! addressed by offset/length pairs in the header; all strings are UTF-16LE.
//!
//! The password is obfuscated, not encrypted: each byte has its nibbles
//! swapped and is then XORed with 0xA5. TLS is what actually protects it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;
use crate::version::TdsVersion;

/// LOGIN7 fixed header size.
pub const LOGIN7_HEADER_SIZE: usize = 94;

// OptionFlags1: fUseDB (0x20) and fDatabase-fatal (0x40).
const OPTION_FLAGS1: u8 = 0x60;
// OptionFlags2: fLanguage-fatal (0x01) and fODBC (0x02).
const OPTION_FLAGS2: u8 = 0x03;
// TypeFlags: default SQL_DFLT.
const TYPE_FLAGS: u8 = 0x00;
// OptionFlags3: fUnknownCollationHandling (0x08).
const OPTION_FLAGS3: u8 = 0x08;

/// LOGIN7 packet builder.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// TDS version to request.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client process ID.
    pub client_pid: u32,
    /// Client timezone offset in minutes.
    pub client_timezone: i32,
    /// Client locale ID.
    pub client_lcid: u32,
    /// Client machine name.
    pub hostname: String,
    /// Username for SQL authentication.
    pub username: String,
    /// Password for SQL authentication.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as configured by the caller.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: 4096,
            client_pid: std::process::id(),
            client_timezone: 0,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: String::from("tds-conn"),
            language: String::new(),
            database: String::new(),
        }
    }
}

impl Login7 {
    /// Create a new LOGIN7 builder with default fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the requested TDS version.
    #[must_use]
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name field.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Encode the LOGIN7 payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let hostname_len = utf16_len(&self.hostname);
        let username_len = utf16_len(&self.username);
        let password_len = utf16_len(&self.password);
        let app_name_len = utf16_len(&self.app_name);
        let server_name_len = utf16_len(&self.server_name);
        let library_name_len = utf16_len(&self.library_name);
        let language_len = utf16_len(&self.language);
        let database_len = utf16_len(&self.database);

        let mut offset = LOGIN7_HEADER_SIZE as u16;
        let mut var_data = BytesMut::new();

        let hostname_offset = offset;
        write_utf16_string(&mut var_data, &self.hostname);
        offset += hostname_len * 2;

        let username_offset = offset;
        write_utf16_string(&mut var_data, &self.username);
        offset += username_len * 2;

        let password_offset = offset;
        write_obfuscated_password(&mut var_data, &self.password);
        offset += password_len * 2;

        let app_name_offset = offset;
        write_utf16_string(&mut var_data, &self.app_name);
        offset += app_name_len * 2;

        let server_name_offset = offset;
        write_utf16_string(&mut var_data, &self.server_name);
        offset += server_name_len * 2;

        // Unused extension slot.
        let unused_offset = offset;

        let library_name_offset = offset;
        write_utf16_string(&mut var_data, &self.library_name);
        offset += library_name_len * 2;

        let language_offset = offset;
        write_utf16_string(&mut var_data, &self.language);
        offset += language_len * 2;

        let database_offset = offset;
        write_utf16_string(&mut var_data, &self.database);
        offset += database_len * 2;

        // No SSPI blob, no attach-db file, no change-password data.
        let sspi_offset = offset;
        let attach_db_offset = offset;
        let new_password_offset = offset;

        let total_length = LOGIN7_HEADER_SIZE + var_data.len();
        let mut buf = BytesMut::with_capacity(total_length);

        buf.put_u32_le(total_length as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(0); // client program version
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(0); // connection id

        buf.put_u8(OPTION_FLAGS1);
        buf.put_u8(OPTION_FLAGS2);
        buf.put_u8(TYPE_FLAGS);
        buf.put_u8(OPTION_FLAGS3);

        buf.put_i32_le(self.client_timezone);
        buf.put_u32_le(self.client_lcid);

        buf.put_u16_le(hostname_offset);
        buf.put_u16_le(hostname_len);
        buf.put_u16_le(username_offset);
        buf.put_u16_le(username_len);
        buf.put_u16_le(password_offset);
        buf.put_u16_le(password_len);
        buf.put_u16_le(app_name_offset);
        buf.put_u16_le(app_name_len);
        buf.put_u16_le(server_name_offset);
        buf.put_u16_le(server_name_len);
        buf.put_u16_le(unused_offset);
        buf.put_u16_le(0);
        buf.put_u16_le(library_name_offset);
        buf.put_u16_le(library_name_len);
        buf.put_u16_le(language_offset);
        buf.put_u16_le(language_len);
        buf.put_u16_le(database_offset);
        buf.put_u16_le(database_len);

        // Client ID (6 bytes, zeroed MAC).
        buf.put_slice(&[0u8; 6]);

        buf.put_u16_le(sspi_offset);
        buf.put_u16_le(0);
        buf.put_u16_le(attach_db_offset);
        buf.put_u16_le(0);
        buf.put_u16_le(new_password_offset);
        buf.put_u16_le(0);

        // SSPI long length (for blobs over 64KB).
        buf.put_u32_le(0);

        buf.put_slice(&var_data);
        buf.freeze()
    }
}

fn utf16_len(s: &str) -> u16 {
    s.encode_utf16().count() as u16
}

/// Password obfuscation per MS-TDS: swap the nibbles of every byte, then
/// XOR with 0xA5.
fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for unit in password.encode_utf16() {
        let low = (unit & 0xFF) as u8;
        let high = (unit >> 8) as u8;
        dst.put_u8(low.rotate_right(4) ^ 0xA5);
        dst.put_u8(high.rotate_right(4) ^ 0xA5);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_version_and_length() {
        let login = Login7::new()
            .with_credentials("sa", "secret")
            .with_database("tempdb")
            .with_app_name("conn-test");

        let encoded = login.encode();
        assert!(encoded.len() >= LOGIN7_HEADER_SIZE);

        let total = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(total as usize, encoded.len());

        let version = u32::from_le_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(version, TdsVersion::V7_4.raw());
    }

    #[test]
    fn password_obfuscation_known_value() {
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");

        // 'a' = 0x0061: low 0x61 -> nibble swap 0x16 -> XOR 0xA5 = 0xB3;
        // high 0x00 -> 0x00 -> 0xA5.
        assert_eq!(&buf[..], &[0xB3, 0xA5]);
    }

    #[test]
    fn empty_strings_collapse_to_header_offsets() {
        let login = Login7::new();
        let encoded = login.encode();
        // hostname offset points at the start of variable data
        let off = u16::from_le_bytes([encoded[36], encoded[37]]);
        assert_eq!(off as usize, LOGIN7_HEADER_SIZE);
    }
}
