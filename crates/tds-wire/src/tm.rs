//! Transaction manager request encoding.
//!
//! TRANSACTION_MANAGER payloads (packet type 0x0E) begin and end explicit
//! transactions. The server answers begin/commit/rollback with ENVCHANGE
//! tokens carrying the 8-byte transaction descriptors that scope all
//! subsequent requests.

use bytes::{BufMut, Bytes, BytesMut};

use crate::batch::write_all_headers;
use crate::codec::write_b_varchar;

/// TM_BEGIN_XACT request type.
const TM_BEGIN_XACT: u16 = 5;
/// TM_COMMIT_XACT request type.
const TM_COMMIT_XACT: u16 = 7;
/// TM_ROLLBACK_XACT request type.
const TM_ROLLBACK_XACT: u16 = 8;

/// Encode a begin-transaction request.
///
/// The isolation byte is the wire value of the requested level; the name is
/// optional and limited to 254 characters by its B_VARCHAR prefix.
#[must_use]
pub fn encode_begin(name: &str, isolation: u8, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + name.len() * 2);
    write_all_headers(&mut buf, transaction_descriptor);
    buf.put_u16_le(TM_BEGIN_XACT);
    buf.put_u8(isolation);
    write_b_varchar(&mut buf, name);
    buf.freeze()
}

/// Encode a commit-transaction request.
#[must_use]
pub fn encode_commit(name: &str, transaction_descriptor: u64) -> Bytes {
    encode_end(TM_COMMIT_XACT, name, transaction_descriptor)
}

/// Encode a rollback-transaction request.
#[must_use]
pub fn encode_rollback(name: &str, transaction_descriptor: u64) -> Bytes {
    encode_end(TM_ROLLBACK_XACT, name, transaction_descriptor)
}

fn encode_end(request_type: u16, name: &str, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + name.len() * 2);
    write_all_headers(&mut buf, transaction_descriptor);
    buf.put_u16_le(request_type);
    write_b_varchar(&mut buf, name);
    buf.put_u8(0); // flags: no begin of next transaction
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ALL_HEADERS_SIZE;

    #[test]
    fn begin_carries_isolation_and_name() {
        let payload = encode_begin("outer", 2, 0);
        let body = &payload[ALL_HEADERS_SIZE..];
        assert_eq!(&body[0..2], &[5, 0]);
        assert_eq!(body[2], 2);
        assert_eq!(body[3], 5); // name length in characters
        assert_eq!(body[4], b'o');
    }

    #[test]
    fn commit_and_rollback_types() {
        let commit = encode_commit("", 1);
        assert_eq!(&commit[ALL_HEADERS_SIZE..ALL_HEADERS_SIZE + 2], &[7, 0]);

        let rollback = encode_rollback("", 1);
        assert_eq!(&rollback[ALL_HEADERS_SIZE..ALL_HEADERS_SIZE + 2], &[8, 0]);
    }

    #[test]
    fn end_requests_embed_the_current_descriptor() {
        let payload = encode_commit("", 0xDEAD_BEEF);
        assert_eq!(&payload[10..18], &0xDEAD_BEEFu64.to_le_bytes()[..]);
    }
}
