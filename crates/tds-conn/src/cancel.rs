//! Out-of-band request cancellation.
//!
//! Cancellation sends an empty ATTENTION message on the shared write half
//! while the session is blocked reading the response. The connection then
//! moves to the attention-wait state, drops every intermediate message, and
//! completes the request with a canceled error once the server's
//! attention-bit DONE arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tds_framing::AttentionWriter;
use tds_tls::{TlsPreloginWrapper, TlsStream};
use tokio::net::TcpStream;

use crate::error::ConnectionError;
use crate::state::State;

/// Attention channel over whichever transport the session settled on.
pub(crate) enum AttentionChannel {
    /// Plaintext transport.
    Plain(AttentionWriter<TcpStream>),
    /// TLS transport negotiated through the PRELOGIN tunnel.
    Tls(AttentionWriter<TlsStream<TlsPreloginWrapper<TcpStream>>>),
}

impl Clone for AttentionChannel {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(w) => Self::Plain(w.clone()),
            Self::Tls(w) => Self::Tls(w.clone()),
        }
    }
}

/// Handle for canceling the in-flight request from another task.
///
/// Cloneable; cancellation is only meaningful while a request is in flight,
/// so `cancel` reports `false` without side effects in any other state.
#[derive(Clone)]
pub struct CancelHandle {
    pub(crate) channel: AttentionChannel,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) attention_requested: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Send an ATTENTION for the request in flight.
    ///
    /// Returns `true` when the attention was sent, `false` when the
    /// connection was not in a cancelable state.
    pub async fn cancel(&self) -> Result<bool, ConnectionError> {
        if self.state.load(Ordering::Acquire) != State::SentClientRequest as u8 {
            return Ok(false);
        }

        self.attention_requested.store(true, Ordering::Release);

        let result = match &self.channel {
            AttentionChannel::Plain(w) => w.send_attention().await,
            AttentionChannel::Tls(w) => w.send_attention().await,
        };
        result.map_err(|e| ConnectionError::socket(format!("failed to send attention: {e}")))?;

        Ok(true)
    }

    /// Whether an attention has been sent and not yet acknowledged.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.attention_requested.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("is_cancelling", &self.is_cancelling())
            .finish_non_exhaustive()
    }
}
