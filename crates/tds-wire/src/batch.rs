//! SQL batch request encoding.
//!
//! A SQL batch payload (packet type 0x01) is the ALL_HEADERS section
//! followed by the SQL text in UTF-16LE. ALL_HEADERS carries the current
//! transaction descriptor so the server scopes the batch correctly.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;

/// ALL_HEADERS length: u32 total + (u32 len + u16 type + u64 descriptor + u32 count).
pub const ALL_HEADERS_SIZE: usize = 22;

/// Write the ALL_HEADERS section with the transaction-descriptor header.
///
/// Required on every client request from TDS 7.2 on. The descriptor is the
/// value most recently issued by the server, or the all-zero sentinel when
/// no transaction is open.
pub fn write_all_headers(buf: &mut BytesMut, transaction_descriptor: u64) {
    buf.put_u32_le(ALL_HEADERS_SIZE as u32);
    buf.put_u32_le(18); // header length
    buf.put_u16_le(0x0002); // header type: transaction descriptor
    buf.put_u64_le(transaction_descriptor);
    buf.put_u32_le(1); // outstanding request count
}

/// Encode a SQL batch payload scoped to the given transaction descriptor.
#[must_use]
pub fn encode_sql_batch(sql: &str, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALL_HEADERS_SIZE + sql.len() * 2);
    write_all_headers(&mut buf, transaction_descriptor);
    write_utf16_string(&mut buf, sql);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_layout() {
        let payload = encode_sql_batch("SELECT 1", 0);

        // 22 header bytes + 8 chars * 2.
        assert_eq!(payload.len(), 38);
        assert_eq!(&payload[0..4], &[22, 0, 0, 0]);
        assert_eq!(&payload[8..10], &[0x02, 0x00]);
        // SQL text starts right after ALL_HEADERS.
        assert_eq!(payload[22], b'S');
        assert_eq!(payload[23], 0);
    }

    #[test]
    fn descriptor_is_embedded() {
        let payload = encode_sql_batch("", 0x0102_0304_0506_0708);
        assert_eq!(
            &payload[10..18],
            &0x0102_0304_0506_0708u64.to_le_bytes()[..]
        );
    }
}
