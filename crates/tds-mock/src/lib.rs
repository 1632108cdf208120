//! # tds-mock
//!
//! Scripted in-process TDS server for unit and integration testing.
//!
//! The server accepts a single connection, performs the PRELOGIN and LOGIN7
//! phases, then walks an ordered script: each step consumes one client
//! message and answers with pre-encoded token streams. An attention-aware
//! step supports exercising the cancel round trip.
//!
//! ```rust,ignore
//! let server = MockTdsServer::builder()
//!     .step(Step::reply(tokens::done_count(0)))          // initial SQL batch
//!     .step(Step::reply(tokens::done_count(3)))          // a query
//!     .start()
//!     .await?;
//! let addr = server.addr();
//! ```

#![deny(unsafe_code)]

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tds_wire::packet::{PACKET_HEADER_SIZE, PacketType};
use tds_wire::prelogin::{EncryptionLevel, PreLogin};
use tds_wire::version::TdsVersion;

pub mod tokens;

/// Mock server error.
#[derive(Debug, Error)]
pub enum MockError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The client spoke out of turn.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One scripted exchange.
#[derive(Debug, Clone)]
pub enum Step {
    /// Read one client message, answer with the given messages.
    Reply(Vec<Bytes>),
    /// Read one client message, then keep reading until an ATTENTION
    /// message arrives, then answer with the given messages.
    AttentionReply(Vec<Bytes>),
}

impl Step {
    /// Answer one client message with a single response message.
    #[must_use]
    pub fn reply(tokens: Bytes) -> Self {
        Self::Reply(vec![tokens])
    }

    /// Answer one client message with several response messages.
    #[must_use]
    pub fn reply_messages(messages: Vec<Bytes>) -> Self {
        Self::Reply(messages)
    }

    /// Wait for an attention after the request, then answer.
    #[must_use]
    pub fn attention_reply(messages: Vec<Bytes>) -> Self {
        Self::AttentionReply(messages)
    }
}

/// Builder for [`MockTdsServer`].
#[derive(Debug)]
pub struct MockTdsServerBuilder {
    encryption: EncryptionLevel,
    login_tokens: Bytes,
    steps: Vec<Step>,
}

impl MockTdsServerBuilder {
    /// Set the encryption level answered in PRELOGIN.
    #[must_use]
    pub fn encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Replace the login response token stream.
    #[must_use]
    pub fn login_tokens(mut self, tokens: Bytes) -> Self {
        self.login_tokens = tokens;
        self
    }

    /// Append a scripted step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Bind a listener and start serving one connection in the background.
    pub async fn start(self) -> Result<MockTdsServer, MockError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "mock server accepted connection");
                    if let Err(e) = serve(stream, self.encryption, self.login_tokens, self.steps).await
                    {
                        tracing::debug!(error = %e, "mock server session ended");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "mock server accept failed"),
            }
        });

        Ok(MockTdsServer { addr, handle })
    }
}

/// A one-connection scripted TDS server.
#[derive(Debug)]
pub struct MockTdsServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MockTdsServer {
    /// Start building a server.
    #[must_use]
    pub fn builder() -> MockTdsServerBuilder {
        MockTdsServerBuilder {
            encryption: EncryptionLevel::Off,
            login_tokens: tokens::login_success(TdsVersion::V7_4),
            steps: Vec::new(),
        }
    }

    /// The address the server listens on.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    encryption: EncryptionLevel,
    login_tokens: Bytes,
    steps: Vec<Step>,
) -> Result<(), MockError> {
    // PRELOGIN
    let Some((packet_type, _payload)) = read_message(&mut stream).await? else {
        return Ok(());
    };
    if packet_type != PacketType::PreLogin as u8 {
        return Err(MockError::Protocol(format!(
            "expected PRELOGIN, got 0x{packet_type:02X}"
        )));
    }
    let prelogin = PreLogin::new(TdsVersion::V7_4, encryption);
    write_message(&mut stream, PacketType::TabularResult, &prelogin.encode()).await?;

    // LOGIN7
    let Some((packet_type, _payload)) = read_message(&mut stream).await? else {
        return Ok(());
    };
    if packet_type != PacketType::Login7 as u8 {
        return Err(MockError::Protocol(format!(
            "expected LOGIN7, got 0x{packet_type:02X}"
        )));
    }
    write_message(&mut stream, PacketType::TabularResult, &login_tokens).await?;

    // Scripted exchanges. A client that went away ends the script early.
    for step in steps {
        match step {
            Step::Reply(messages) => {
                if read_message(&mut stream).await?.is_none() {
                    return Ok(());
                }
                for message in messages {
                    write_message(&mut stream, PacketType::TabularResult, &message).await?;
                }
            }
            Step::AttentionReply(messages) => {
                if read_message(&mut stream).await?.is_none() {
                    return Ok(());
                }
                loop {
                    match read_message(&mut stream).await? {
                        Some((packet_type, _)) if packet_type == PacketType::Attention as u8 => {
                            break;
                        }
                        Some(_) => {}
                        None => return Ok(()),
                    }
                }
                for message in messages {
                    write_message(&mut stream, PacketType::TabularResult, &message).await?;
                }
            }
        }
    }

    // Hold the socket open until the client hangs up.
    let mut sink = [0u8; 64];
    while stream.read(&mut sink).await? > 0 {}
    Ok(())
}

/// Read one complete message; returns the first packet's type byte and the
/// concatenated payload, or `None` on a clean close.
async fn read_message(stream: &mut TcpStream) -> Result<Option<(u8, Bytes)>, MockError> {
    let mut message = BytesMut::new();
    let mut message_type = None;

    loop {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && message.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        if length < PACKET_HEADER_SIZE {
            return Err(MockError::Protocol("short packet".to_string()));
        }

        let mut payload = vec![0u8; length - PACKET_HEADER_SIZE];
        stream.read_exact(&mut payload).await?;

        message_type.get_or_insert(header[0]);
        message.extend_from_slice(&payload);

        if header[1] & 0x01 != 0 {
            let message_type = message_type.unwrap_or(header[0]);
            return Ok(Some((message_type, message.freeze())));
        }
    }
}

async fn write_message(
    stream: &mut TcpStream,
    packet_type: PacketType,
    payload: &[u8],
) -> Result<(), MockError> {
    let mut packet = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
    packet.put_u8(packet_type as u8);
    packet.put_u8(0x01); // end of message
    packet.put_u16((PACKET_HEADER_SIZE + payload.len()) as u16);
    packet.put_u16(0x0038); // spid
    packet.put_u8(1);
    packet.put_u8(0);
    packet.put_slice(payload);

    stream.write_all(&packet).await?;
    stream.flush().await?;
    Ok(())
}
