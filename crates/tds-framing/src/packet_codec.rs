//! TDS packet codec for tokio-util framing.

use bytes::{Bytes, BytesMut};
use tds_wire::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// A TDS packet: header plus payload.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Payload bytes, excluding the header.
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet from a header and payload.
    #[must_use]
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Whether this packet ends a message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// Parse and validate a header once eight bytes are buffered.
///
/// The header is decoded before the rest of the packet arrives, so a bad
/// type or status byte fails the stream immediately instead of after the
/// declared length has been read.
fn parse_buffered_header(src: &BytesMut) -> Result<Option<PacketHeader>, CodecError> {
    if src.len() < PACKET_HEADER_SIZE {
        return Ok(None);
    }

    let mut prefix = &src[..PACKET_HEADER_SIZE];
    let header = PacketHeader::decode(&mut prefix)?;

    if (header.length as usize) < PACKET_HEADER_SIZE {
        return Err(CodecError::BadLength {
            length: header.length as usize,
        });
    }
    Ok(Some(header))
}

/// Packet-level encoder/decoder.
///
/// The encoder stamps the real length and a wrapping sequence number into
/// each outgoing header; the decoder holds buffered bytes until the full
/// declared length is available.
#[derive(Debug)]
pub struct TdsCodec {
    packet_id: u8,
}

impl TdsCodec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self { packet_id: 1 }
    }

    // Sequence numbers run 1..=255 and skip zero when they wrap.
    fn next_packet_id(&mut self) -> u8 {
        let id = self.packet_id;
        self.packet_id = match self.packet_id.checked_add(1) {
            Some(next) => next,
            None => 1,
        };
        id
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = parse_buffered_header(src)? else {
            return Ok(None);
        };
        if src.len() < header.length as usize {
            return Ok(None);
        }

        let mut frame = src.split_to(header.length as usize);
        let payload = frame.split_off(PACKET_HEADER_SIZE).freeze();

        Ok(Some(Packet::new(header, payload)))
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = PACKET_HEADER_SIZE + item.payload.len();
        if total > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge {
                size: total,
                max: MAX_PACKET_SIZE,
            });
        }

        let header = item
            .header
            .with_length(total as u16)
            .with_packet_id(self.next_packet_id());

        dst.reserve(total);
        header.encode(dst);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tds_wire::packet::{PacketStatus, PacketType};

    fn raw_packet(length: u16, payload: &[u8]) -> BytesMut {
        let mut data = BytesMut::new();
        data.put_u8(PacketType::SqlBatch as u8);
        data.put_u8(PacketStatus::END_OF_MESSAGE.bits());
        data.put_u16(length);
        data.put_u16(0);
        data.put_u8(1);
        data.put_u8(0);
        data.put_slice(payload);
        data
    }

    #[test]
    fn decode_single_packet() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(12, b"body");

        let packet = codec.decode(&mut data).unwrap().unwrap();
        assert_eq!(packet.header.packet_type, PacketType::SqlBatch);
        assert!(packet.is_end_of_message());
        assert_eq!(&packet.payload[..], b"body");
        assert!(data.is_empty());
    }

    #[test]
    fn incomplete_packet_waits() {
        let mut codec = TdsCodec::new();
        // Claims 4 payload bytes that never arrive.
        let mut data = raw_packet(12, b"");

        assert!(codec.decode(&mut data).unwrap().is_none());
        assert_eq!(data.len(), PACKET_HEADER_SIZE);
    }

    #[test]
    fn undersized_length_is_rejected() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(4, b"");

        assert!(matches!(
            codec.decode(&mut data),
            Err(CodecError::BadLength { length: 4 })
        ));
    }

    #[test]
    fn unknown_packet_type_fails_before_the_payload_arrives() {
        let mut codec = TdsCodec::new();
        let mut data = BytesMut::new();
        data.put_u8(0x7B);
        data.put_u8(0x01);
        data.put_u16(512);
        data.put_u16(0);
        data.put_u8(1);
        data.put_u8(0);

        assert!(matches!(
            codec.decode(&mut data),
            Err(CodecError::InvalidHeader(_))
        ));
    }

    #[test]
    fn encode_stamps_length_and_sequence() {
        let mut codec = TdsCodec::new();

        let header = PacketHeader::new(PacketType::Rpc, PacketStatus::END_OF_MESSAGE, 0);
        let packet = Packet::new(header, Bytes::from_static(b"ab"));

        let mut dst = BytesMut::new();
        codec.encode(packet.clone(), &mut dst).unwrap();
        assert_eq!(u16::from_be_bytes([dst[2], dst[3]]), 10);
        assert_eq!(dst[6], 1);

        dst.clear();
        codec.encode(packet, &mut dst).unwrap();
        assert_eq!(dst[6], 2);
    }
}
