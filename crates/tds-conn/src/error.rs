//! Session error types.
//!
//! Two error kinds exist: [`ConnectionError`] is session-scoped (surfaced
//! once via the connect result or the `Error` event), [`RequestError`] is
//! scoped to a single request and delivered through its outcome while the
//! connection lives on.

use std::fmt;

use thiserror::Error;

/// Stable error codes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Connect timeout elapsed.
    ETimeout,
    /// Socket-level failure.
    ESocket,
    /// Named-instance port lookup failed.
    EInstLookup,
    /// Login failed.
    ELogin,
    /// Server error scoped to a request.
    ERequest,
    /// Request canceled by attention.
    ECancel,
    /// No transaction in progress.
    ENoTrnInProg,
    /// Operation not legal in the current state.
    EInvalidState,
}

impl ErrorCode {
    /// The code's wire-stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ETimeout => "ETIMEOUT",
            Self::ESocket => "ESOCKET",
            Self::EInstLookup => "EINSTLOOKUP",
            Self::ELogin => "ELOGIN",
            Self::ERequest => "EREQUEST",
            Self::ECancel => "ECANCEL",
            Self::ENoTrnInProg => "ENOTRNINPROG",
            Self::EInvalidState => "EINVALIDSTATE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session-scoped error.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ConnectionError {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl ConnectionError {
    /// Create a connection error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Socket-level failure.
    pub fn socket(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ESocket, message)
    }

    /// Connect timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ETimeout, message)
    }

    /// Login failure.
    pub fn login(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ELogin, message)
    }
}

/// Request-scoped error.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Server error number, when the server raised it.
    pub number: Option<i32>,
    /// Server severity class, when the server raised it.
    pub class: Option<u8>,
}

impl RequestError {
    /// Create a request error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            number: None,
            class: None,
        }
    }

    /// Request rejected because the connection is in the wrong state.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EInvalidState, message)
    }

    /// The canceled-by-attention error.
    #[must_use]
    pub fn canceled() -> Self {
        Self::new(ErrorCode::ECancel, "Canceled.")
    }

    /// A server-raised error scoped to the request.
    pub fn server(message: impl Into<String>, number: i32, class: u8) -> Self {
        Self {
            code: ErrorCode::ERequest,
            message: message.into(),
            number: Some(number),
            class: Some(class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_stably() {
        assert_eq!(ErrorCode::ETimeout.as_str(), "ETIMEOUT");
        assert_eq!(ErrorCode::ENoTrnInProg.as_str(), "ENOTRNINPROG");
    }

    #[test]
    fn canceled_error_shape() {
        let err = RequestError::canceled();
        assert_eq!(err.code, ErrorCode::ECancel);
        assert_eq!(err.message, "Canceled.");
    }
}
