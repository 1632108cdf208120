//! Pre-encoded token stream builders for scripted responses.

use bytes::{BufMut, Bytes, BytesMut};

use tds_wire::token::TokenType;
use tds_wire::types::TypeId;
use tds_wire::version::TdsVersion;

const DONE_MORE: u16 = 0x0001;
const DONE_COUNT: u16 = 0x0010;
const DONE_ATTN: u16 = 0x0020;

fn put_b_varchar(buf: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    buf.put_u8(units.len() as u8);
    for u in units {
        buf.put_u16_le(u);
    }
}

fn put_us_varchar(buf: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    buf.put_u16_le(units.len() as u16);
    for u in units {
        buf.put_u16_le(u);
    }
}

/// A LOGINACK announcing the given TDS version.
#[must_use]
pub fn login_ack(version: TdsVersion) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(1); // interface: SQL_TSQL
    body.put_u32_le(version.raw());
    put_b_varchar(&mut body, "Microsoft SQL Server");
    body.put_u32_le(0x0F00_0000);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::LoginAck as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.freeze()
}

/// A string-valued ENVCHANGE.
fn env_string(env_type: u8, new: &str, old: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(env_type);
    put_b_varchar(&mut body, new);
    put_b_varchar(&mut body, old);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::EnvChange as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.freeze()
}

/// ENVCHANGE announcing a database switch.
#[must_use]
pub fn env_database(new: &str, old: &str) -> Bytes {
    env_string(1, new, old)
}

/// ENVCHANGE announcing a packet size renegotiation.
#[must_use]
pub fn env_packet_size(size: usize) -> Bytes {
    let text = size.to_string();
    env_string(4, &text, &text)
}

/// ENVCHANGE carrying a new transaction descriptor.
#[must_use]
pub fn env_begin_transaction(descriptor: u64) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(8);
    body.put_u8(8);
    body.put_u64_le(descriptor);
    body.put_u8(0);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::EnvChange as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.freeze()
}

/// ENVCHANGE ending a transaction by commit.
#[must_use]
pub fn env_commit_transaction(descriptor: u64) -> Bytes {
    env_end_transaction(9, descriptor)
}

/// ENVCHANGE ending a transaction by rollback.
#[must_use]
pub fn env_rollback_transaction(descriptor: u64) -> Bytes {
    env_end_transaction(10, descriptor)
}

fn env_end_transaction(env_type: u8, descriptor: u64) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(env_type);
    body.put_u8(0);
    body.put_u8(8);
    body.put_u64_le(descriptor);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::EnvChange as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.freeze()
}

/// A server ERROR token.
#[must_use]
pub fn server_error(number: i32, class: u8, message: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32_le(number);
    body.put_u8(1); // state
    body.put_u8(class);
    put_us_varchar(&mut body, message);
    put_b_varchar(&mut body, "mockserver");
    put_b_varchar(&mut body, "");
    body.put_i32_le(1);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Error as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.freeze()
}

/// A server INFO token.
#[must_use]
pub fn server_info(number: i32, message: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32_le(number);
    body.put_u8(1);
    body.put_u8(0);
    put_us_varchar(&mut body, message);
    put_b_varchar(&mut body, "mockserver");
    put_b_varchar(&mut body, "");
    body.put_i32_le(1);

    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Info as u8);
    buf.put_u16_le(body.len() as u16);
    buf.put_slice(&body);
    buf.freeze()
}

/// COLMETADATA describing all-INT columns with the given names.
#[must_use]
pub fn col_metadata_int(names: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::ColMetaData as u8);
    buf.put_u16_le(names.len() as u16);
    for name in names {
        buf.put_u32_le(0); // user type
        buf.put_u16_le(0x0009); // nullable, updateable
        buf.put_u8(TypeId::IntN as u8);
        buf.put_u8(4);
        put_b_varchar(&mut buf, name);
    }
    buf.freeze()
}

/// A ROW of INT values matching [`col_metadata_int`].
#[must_use]
pub fn int_row(values: &[i32]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Row as u8);
    for value in values {
        buf.put_u8(4);
        buf.put_i32_le(*value);
    }
    buf.freeze()
}

/// A RETURNVALUE carrying a 4-byte integer output parameter.
#[must_use]
pub fn return_value_int(name: &str, value: i32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::ReturnValue as u8);
    buf.put_u16_le(1); // ordinal
    put_b_varchar(&mut buf, name);
    buf.put_u8(0x01); // status: output param
    buf.put_u32_le(0); // user type
    buf.put_u16_le(0); // flags
    buf.put_u8(TypeId::IntN as u8);
    buf.put_u8(4); // max length
    buf.put_u8(4); // value length
    buf.put_i32_le(value);
    buf.freeze()
}

/// A RETURNSTATUS token.
#[must_use]
pub fn return_status(value: i32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::ReturnStatus as u8);
    buf.put_i32_le(value);
    buf.freeze()
}

/// A final DONE with a valid row count.
#[must_use]
pub fn done_count(row_count: u64) -> Bytes {
    done_with_status(DONE_COUNT, row_count)
}

/// A DONE with the more-results bit set.
#[must_use]
pub fn done_more(row_count: u64) -> Bytes {
    done_with_status(DONE_COUNT | DONE_MORE, row_count)
}

/// The attention acknowledgment DONE.
#[must_use]
pub fn done_attention() -> Bytes {
    done_with_status(DONE_ATTN, 0)
}

/// A final DONEPROC with a valid row count.
#[must_use]
pub fn done_proc(row_count: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::DoneProc as u8);
    buf.put_u16_le(DONE_COUNT);
    buf.put_u16_le(0);
    buf.put_u64_le(row_count);
    buf.freeze()
}

fn done_with_status(status: u16, row_count: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(TokenType::Done as u8);
    buf.put_u16_le(status);
    buf.put_u16_le(0);
    buf.put_u64_le(row_count);
    buf.freeze()
}

/// Concatenate token streams into one response message.
#[must_use]
pub fn stream(parts: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    for part in parts {
        buf.put_slice(part);
    }
    buf.freeze()
}

/// A successful login response: packet size ack, database switch,
/// LOGINACK, and a final DONE.
#[must_use]
pub fn login_success(version: TdsVersion) -> Bytes {
    stream(&[
        env_packet_size(4096),
        env_database("master", ""),
        login_ack(version),
        done_count(0),
    ])
}

/// A failed login response: server error then DONE.
#[must_use]
pub fn login_failure(number: i32, message: &str) -> Bytes {
    stream(&[server_error(number, 14, message), done_count(0)])
}
