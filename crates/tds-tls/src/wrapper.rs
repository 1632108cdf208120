//! PRELOGIN wrapping for the tunneled TLS handshake.

use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const HEADER_SIZE: usize = 8;
const PACKET_TYPE_PRELOGIN: u8 = 0x12;
const PACKET_STATUS_EOM: u8 = 0x01;

/// Stream adapter that frames TLS handshake traffic in TDS packets.
///
/// While the handshake is pending, writes accumulate ciphertext that gets
/// framed into a single PRELOGIN-typed packet on flush, and reads collect
/// raw bytes until whole PRELOGIN packets can be stripped of their headers
/// and handed to the TLS engine as contiguous ciphertext. After
/// [`handshake_complete`](Self::handshake_complete) the adapter is a
/// transparent pass-through; the TLS stream above it then carries ordinary
/// TDS packets as ciphertext.
pub struct TlsPreloginWrapper<S> {
    stream: S,
    handshaking: bool,

    /// Inbound bytes still wearing their packet framing.
    framed_in: BytesMut,
    /// Deframed handshake ciphertext ready for the TLS engine.
    ciphertext_in: BytesMut,

    /// Outbound ciphertext accumulated between flushes.
    ciphertext_out: BytesMut,
    /// The framed packet currently draining into the stream.
    framed_out: BytesMut,
}

impl<S> TlsPreloginWrapper<S> {
    /// Wrap a stream for the handshake phase.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            handshaking: true,
            framed_in: BytesMut::new(),
            ciphertext_in: BytesMut::new(),
            ciphertext_out: BytesMut::new(),
            framed_out: BytesMut::new(),
        }
    }

    /// Switch to transparent pass-through once the handshake is done.
    pub fn handshake_complete(&mut self) {
        self.handshaking = false;
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consume the wrapper, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Strip every complete PRELOGIN packet buffered so far, leaving any
    /// trailing partial packet for the next read.
    fn strip_frames(&mut self) -> io::Result<()> {
        while self.framed_in.len() >= HEADER_SIZE {
            let packet_type = self.framed_in[0];
            if packet_type != PACKET_TYPE_PRELOGIN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "expected PRELOGIN framing during handshake, got 0x{packet_type:02X}"
                    ),
                ));
            }

            let length = u16::from_be_bytes([self.framed_in[2], self.framed_in[3]]) as usize;
            if length < HEADER_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "packet shorter than its header",
                ));
            }
            if self.framed_in.len() < length {
                break;
            }

            let packet = self.framed_in.split_to(length);
            self.ciphertext_in.extend_from_slice(&packet[HEADER_SIZE..]);
        }
        Ok(())
    }

    /// Frame the buffered outbound ciphertext as one PRELOGIN packet.
    fn frame_flight(&mut self) {
        let total = HEADER_SIZE + self.ciphertext_out.len();

        self.framed_out.reserve(total);
        self.framed_out.put_u8(PACKET_TYPE_PRELOGIN);
        self.framed_out.put_u8(PACKET_STATUS_EOM);
        self.framed_out.put_u16(total as u16);
        self.framed_out.put_u16(0); // spid
        self.framed_out.put_u8(1); // packet id
        self.framed_out.put_u8(0); // window
        self.framed_out.put_slice(&self.ciphertext_out);
        self.ciphertext_out.clear();

        tracing::trace!(bytes = total, "framed handshake flight");
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TlsPreloginWrapper<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.handshaking && this.ciphertext_in.is_empty() {
            return Pin::new(&mut this.stream).poll_read(cx, buf);
        }

        loop {
            // Serve already-deframed ciphertext before touching the stream.
            if !this.ciphertext_in.is_empty() {
                let n = cmp::min(buf.remaining(), this.ciphertext_in.len());
                buf.put_slice(&this.ciphertext_in.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if !this.handshaking {
                return Pin::new(&mut this.stream).poll_read(cx, buf);
            }

            let mut chunk = [0u8; 4096];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.stream).poll_read(cx, &mut chunk_buf)? {
                Poll::Ready(()) => {
                    let filled = chunk_buf.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    this.framed_in.extend_from_slice(filled);
                    this.strip_frames()?;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TlsPreloginWrapper<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if !this.handshaking {
            return Pin::new(&mut this.stream).poll_write(cx, buf);
        }

        this.ciphertext_out.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.handshaking && this.framed_out.is_empty() && !this.ciphertext_out.is_empty() {
            this.frame_flight();
        }

        while !this.framed_out.is_empty() {
            match Pin::new(&mut this.stream).poll_write(cx, &this.framed_out)? {
                Poll::Ready(0) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream closed while flushing handshake",
                    )));
                }
                Poll::Ready(n) => this.framed_out.advance(n),
                Poll::Pending => return Poll::Pending,
            }
        }

        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn prelogin_packet(payload: &[u8]) -> Vec<u8> {
        let total = HEADER_SIZE + payload.len();
        let mut packet = vec![
            PACKET_TYPE_PRELOGIN,
            PACKET_STATUS_EOM,
            (total >> 8) as u8,
            total as u8,
            0,
            0,
            1,
            0,
        ];
        packet.extend_from_slice(payload);
        packet
    }

    #[tokio::test]
    async fn handshake_writes_are_wrapped_in_prelogin_packets() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let mut wrapper = TlsPreloginWrapper::new(client);

        wrapper.write_all(b"client-hello").await.unwrap();
        wrapper.flush().await.unwrap();

        let mut raw = vec![0u8; HEADER_SIZE + 12];
        server.read_exact(&mut raw).await.unwrap();

        assert_eq!(raw[0], PACKET_TYPE_PRELOGIN);
        assert_eq!(raw[1], PACKET_STATUS_EOM);
        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        assert_eq!(length, HEADER_SIZE + 12);
        assert_eq!(&raw[HEADER_SIZE..], b"client-hello");
    }

    #[tokio::test]
    async fn handshake_reads_strip_packet_headers() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let mut wrapper = TlsPreloginWrapper::new(client);

        let payload = b"server-hello";
        server
            .write_all(&prelogin_packet(payload))
            .await
            .unwrap();

        let mut plain = vec![0u8; payload.len()];
        wrapper.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, payload);
    }

    #[tokio::test]
    async fn fragmented_packets_reassemble() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let mut wrapper = TlsPreloginWrapper::new(client);

        let payload = b"split-across-writes";
        let packet = prelogin_packet(payload);
        let (head, tail) = packet.split_at(5);

        let reader = async {
            let mut plain = vec![0u8; payload.len()];
            wrapper.read_exact(&mut plain).await.unwrap();
            plain
        };
        let writer = async {
            server.write_all(head).await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(tail).await.unwrap();
        };

        let (plain, ()) = tokio::join!(reader, writer);
        assert_eq!(&plain, payload);
    }

    #[tokio::test]
    async fn back_to_back_packets_yield_contiguous_ciphertext() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let mut wrapper = TlsPreloginWrapper::new(client);

        let mut both = prelogin_packet(b"first ");
        both.extend_from_slice(&prelogin_packet(b"second"));
        server.write_all(&both).await.unwrap();

        let mut plain = vec![0u8; 12];
        wrapper.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, b"first second");
    }

    #[tokio::test]
    async fn pass_through_after_handshake() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let mut wrapper = TlsPreloginWrapper::new(client);
        wrapper.handshake_complete();

        wrapper.write_all(b"raw bytes").await.unwrap();
        wrapper.flush().await.unwrap();

        let mut raw = vec![0u8; 9];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"raw bytes");
    }

    #[tokio::test]
    async fn non_prelogin_packet_during_handshake_is_an_error() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let mut wrapper = TlsPreloginWrapper::new(client);

        // TABULAR_RESULT header where a PRELOGIN packet was required.
        server
            .write_all(&[0x04, 0x01, 0, 9, 0, 0, 1, 0, 0xAA])
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        let err = wrapper.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
