//! Message-level I/O over split packet streams.
//!
//! Outbound messages are chunked into packets no larger than the negotiated
//! packet size, the last chunk flagged END_OF_MESSAGE. Inbound packets are
//! surfaced as [`MessageEvent::Data`] per packet, followed by
//! [`MessageEvent::Message`] when a packet carries the end-of-message flag,
//! strictly after all data belonging to that message.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tds_wire::packet::{
    DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::CodecError;
use crate::framed::{PacketReader, PacketWriter};
use crate::packet_codec::Packet;

/// An inbound framing event.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// Payload of one inbound packet.
    Data(Bytes),
    /// The preceding data completed a logical message.
    Message,
}

/// Message-level I/O engine over a split transport.
pub struct MessageIo<T>
where
    T: AsyncRead + AsyncWrite,
{
    reader: PacketReader<ReadHalf<T>>,
    writer: Arc<Mutex<PacketWriter<WriteHalf<T>>>>,
    packet_size: usize,
    pending: VecDeque<MessageEvent>,
    mid_message: bool,
}

impl<T> MessageIo<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Split the transport and wrap both halves in packet codecs.
    pub fn new(transport: T) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: PacketReader::new(read_half),
            writer: Arc::new(Mutex::new(PacketWriter::new(write_half))),
            packet_size: DEFAULT_PACKET_SIZE,
            pending: VecDeque::new(),
            mid_message: false,
        }
    }

    /// Current packet size used for outbound chunking.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Adopt a renegotiated packet size.
    pub fn set_packet_size(&mut self, size: usize) {
        tracing::debug!(size, "packet size changed");
        self.packet_size = size;
    }

    /// Handle for sending ATTENTION packets out of band.
    #[must_use]
    pub fn attention_writer(&self) -> AttentionWriter<T> {
        AttentionWriter {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<T> MessageIo<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one logical message, chunked to the current packet size.
    ///
    /// When `reset_connection` is set, the RESET_CONNECTION status bit rides
    /// on the first packet only, instructing the server to reset session
    /// state before processing this request.
    pub async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
        reset_connection: bool,
    ) -> Result<(), CodecError> {
        let max_payload = self.packet_size - PACKET_HEADER_SIZE;
        let total_chunks = payload.len().div_ceil(max_payload).max(1);

        let mut writer = self.writer.lock().await;

        for i in 0..total_chunks {
            let start = i * max_payload;
            let end = payload.len().min(start + max_payload);
            let chunk = payload.slice(start..end);

            let is_first = i == 0;
            let is_last = i == total_chunks - 1;

            let mut status = if is_last {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            if is_first && reset_connection {
                status |= PacketStatus::RESET_CONNECTION;
            }

            let header = PacketHeader::new(packet_type, status, 0);
            writer.send(Packet::new(header, chunk)).await?;
        }

        tracing::trace!(
            packet_type = ?packet_type,
            bytes = payload.len(),
            chunks = total_chunks,
            reset_connection,
            "sent message"
        );

        Ok(())
    }

    /// Next inbound framing event, or `None` once the transport is closed.
    ///
    /// A close in the middle of a message is an error.
    pub async fn next_event(&mut self) -> Result<Option<MessageEvent>, CodecError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        match self.reader.next().await {
            Some(Ok(packet)) => {
                let eom = packet.is_end_of_message();
                self.mid_message = !eom;
                self.pending.push_back(MessageEvent::Data(packet.payload));
                if eom {
                    self.pending.push_back(MessageEvent::Message);
                }
                Ok(self.pending.pop_front())
            }
            Some(Err(e)) => Err(e),
            None => {
                if self.mid_message {
                    Err(CodecError::ConnectionClosed)
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for MessageIo<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIo")
            .field("packet_size", &self.packet_size)
            .field("mid_message", &self.mid_message)
            .finish_non_exhaustive()
    }
}

/// Out-of-band ATTENTION sender sharing the connection's write half.
///
/// Cloneable and usable from another task while the owning session is
/// blocked reading a response.
pub struct AttentionWriter<T>
where
    T: AsyncRead + AsyncWrite,
{
    writer: Arc<Mutex<PacketWriter<WriteHalf<T>>>>,
}

impl<T> AttentionWriter<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Send the empty ATTENTION message that asks the server to cancel the
    /// request in flight.
    pub async fn send_attention(&self) -> Result<(), CodecError> {
        tracing::debug!("sending attention");
        let mut writer = self.writer.lock().await;
        writer
            .send(Packet::new(PacketHeader::attention(), Bytes::new()))
            .await
    }
}

impl<T> Clone for AttentionWriter<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<T> std::fmt::Debug for AttentionWriter<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_single_packet_message() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut a = MessageIo::new(client);
        let mut b = MessageIo::new(server);

        a.send_message(PacketType::SqlBatch, Bytes::from_static(b"hello"), false)
            .await
            .unwrap();

        match b.next_event().await.unwrap().unwrap() {
            MessageEvent::Data(payload) => assert_eq!(&payload[..], b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            b.next_event().await.unwrap().unwrap(),
            MessageEvent::Message
        ));
    }

    #[tokio::test]
    async fn large_message_is_chunked() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let mut a = MessageIo::new(client);
        a.set_packet_size(512);
        let mut b = MessageIo::new(server);

        let payload = Bytes::from(vec![0xAB; 2000]);
        a.send_message(PacketType::SqlBatch, payload, false)
            .await
            .unwrap();

        let mut data_events = 0;
        let mut bytes = 0;
        loop {
            match b.next_event().await.unwrap().unwrap() {
                MessageEvent::Data(chunk) => {
                    data_events += 1;
                    bytes += chunk.len();
                    assert!(chunk.len() <= 512 - PACKET_HEADER_SIZE);
                }
                MessageEvent::Message => break,
            }
        }
        assert_eq!(bytes, 2000);
        assert_eq!(data_events, 4);
    }

    #[tokio::test]
    async fn reset_flag_rides_first_packet_only() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let mut a = MessageIo::new(client);
        a.set_packet_size(512);

        let payload = Bytes::from(vec![1u8; 1000]);
        a.send_message(PacketType::SqlBatch, payload, true)
            .await
            .unwrap();
        drop(a);

        // Inspect raw packets on the peer side.
        let (read_half, _write_half) = tokio::io::split(server);
        let mut reader = PacketReader::new(read_half);

        let first = reader.next().await.unwrap().unwrap();
        assert!(first.header.status.contains(PacketStatus::RESET_CONNECTION));
        let second = reader.next().await.unwrap().unwrap();
        assert!(!second.header.status.contains(PacketStatus::RESET_CONNECTION));
        assert!(second.is_end_of_message());
    }

    #[tokio::test]
    async fn attention_writer_is_out_of_band() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let io = MessageIo::new(client);
        let attention = io.attention_writer();
        attention.send_attention().await.unwrap();

        let (read_half, _write_half) = tokio::io::split(server);
        let mut reader = PacketReader::new(read_half);
        let packet = reader.next().await.unwrap().unwrap();
        assert_eq!(packet.header.packet_type, PacketType::Attention);
        assert!(packet.payload.is_empty());
        assert!(packet.is_end_of_message());
    }
}
