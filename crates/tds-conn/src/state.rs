//! Connection state machine states.
//!
//! The session is governed by an explicit nine-state machine. Exactly one
//! state is current at any time; every transition is logged with its source
//! and target. An inbound event with no meaning in the current state is a
//! programming error that closes the connection.

use std::fmt;

/// The session states.
///
/// ```text
/// Connecting ── socket up ──▶ SentPrelogin ──┬─ encryption on ──▶ SentTlsNegotiation ─┐
///                                            └─ plaintext ───────────────────────────▶ SentLogin7
/// SentLogin7 ── loginack ok ──▶ SendingInitialSql ── done ──▶ LoggedIn
/// LoggedIn ⇄ SentClientRequest ── cancel ──▶ SentAttention ── attention ack ──▶ LoggedIn
/// any ── fatal error / close ──▶ Final
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// Opening the TCP socket; the connect timer is armed.
    Connecting = 0,
    /// PRELOGIN sent, collecting the response into the message buffer.
    SentPrelogin = 1,
    /// TLS handshake in flight inside PRELOGIN packets.
    SentTlsNegotiation = 2,
    /// LOGIN7 sent, waiting for the login token stream.
    SentLogin7 = 3,
    /// Logged in, session-option batch in flight.
    SendingInitialSql = 4,
    /// Idle and ready for requests.
    LoggedIn = 5,
    /// A request is in flight.
    SentClientRequest = 6,
    /// ATTENTION sent, waiting for its acknowledgment.
    SentAttention = 7,
    /// Terminal; cleanup has run.
    Final = 8,
}

impl State {
    /// Whether user requests are accepted in this state.
    #[must_use]
    pub const fn accepts_requests(self) -> bool {
        matches!(self, Self::LoggedIn)
    }

    /// Whether cancellation is meaningful in this state.
    #[must_use]
    pub const fn accepts_cancel(self) -> bool {
        matches!(self, Self::SentClientRequest)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "Connecting",
            Self::SentPrelogin => "SentPrelogin",
            Self::SentTlsNegotiation => "SentTLSSSLNegotiation",
            Self::SentLogin7 => "SentLogin7WithStandardLogin",
            Self::SendingInitialSql => "LoggedInSendingInitialSql",
            Self::LoggedIn => "LoggedIn",
            Self::SentClientRequest => "SentClientRequest",
            Self::SentAttention => "SentAttention",
            Self::Final => "Final",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_cancel_gates() {
        assert!(State::LoggedIn.accepts_requests());
        assert!(!State::SentClientRequest.accepts_requests());
        assert!(State::SentClientRequest.accepts_cancel());
        assert!(!State::LoggedIn.accepts_cancel());
        assert!(!State::Final.accepts_requests());
    }

    #[test]
    fn display_names() {
        assert_eq!(State::SentLogin7.to_string(), "SentLogin7WithStandardLogin");
        assert_eq!(State::Final.to_string(), "Final");
    }
}
