//! Caller-observable session events.

use tds_wire::token::ServerMessage;
use tokio::sync::mpsc;

use crate::error::ConnectionError;

/// Events emitted by a connection over its lifetime.
///
/// `Connect` and `End` fire exactly once per connection. Server chatter
/// (info and error messages, environment changes) is forwarded as it
/// arrives; debug detail goes through `tracing` instead.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Session establishment finished, successfully or not.
    Connect(Option<ConnectionError>),
    /// The connection closed and its resources were released.
    End,
    /// A non-terminal wire or protocol error.
    Error(ConnectionError),
    /// Informational message from the server.
    InfoMessage(ServerMessage),
    /// Error message from the server.
    ErrorMessage(ServerMessage),
    /// The current database changed.
    DatabaseChange(String),
    /// The session language changed.
    LanguageChange(String),
    /// The character set changed.
    CharsetChange(String),
    /// TLS negotiation completed.
    Secure,
    /// The server acknowledged a connection reset.
    ResetConnection,
}

/// Optional event delivery channel.
///
/// Without a subscriber every emission is a no-op; a dropped receiver is
/// likewise ignored so event delivery can never wedge the session.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl EventSink {
    /// A sink that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A sink delivering into the given channel.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Emit an event, ignoring missing or closed subscribers.
    pub fn emit(&self, event: ConnectionEvent) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_swallows_events() {
        let sink = EventSink::disabled();
        sink.emit(ConnectionEvent::End);
    }

    #[test]
    fn sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.emit(ConnectionEvent::Secure);
        sink.emit(ConnectionEvent::End);

        assert!(matches!(rx.try_recv().unwrap(), ConnectionEvent::Secure));
        assert!(matches!(rx.try_recv().unwrap(), ConnectionEvent::End));
    }
}
