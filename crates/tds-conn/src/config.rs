//! Session configuration.

use std::time::Duration;

use tds_wire::packet::DEFAULT_PACKET_SIZE;
use tds_wire::version::TdsVersion;

use crate::error::{ConnectionError, ErrorCode};
use crate::transaction::IsolationLevel;

/// Configuration for a session.
///
/// `port` and `instance_name` are mutually exclusive: a fixed port connects
/// directly, a named instance goes through the SQL-browser lookup first.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server hostname or address.
    pub server: String,
    /// Username for SQL authentication.
    pub user_name: String,
    /// Password for SQL authentication.
    pub password: String,
    /// Fixed server port. Mutually exclusive with `instance_name`.
    pub port: Option<u16>,
    /// Named instance to resolve via the SQL browser.
    pub instance_name: Option<String>,
    /// Initial database.
    pub database: Option<String>,
    /// Application name reported in LOGIN7.
    pub app_name: String,
    /// Requested TDS packet size.
    pub packet_size: usize,
    /// Requested TDS version.
    pub tds_version: TdsVersion,
    /// Time allowed for the whole session establishment.
    pub connect_timeout: Duration,
    /// Per-request timeout; enforced by the caller driving cancellation.
    pub request_timeout: Duration,
    /// Time allowed for an attention acknowledgment; enforced by the caller.
    pub cancel_timeout: Duration,
    /// `set textsize` value in the initial SQL batch.
    pub textsize: i32,
    /// Default transaction isolation level.
    pub isolation_level: IsolationLevel,
    /// Request TLS for the session.
    pub encrypt: bool,
    /// Skip server certificate validation (development only).
    pub trust_server_certificate: bool,
    /// Interpret times as UTC.
    pub use_utc: bool,
    /// Deduplicate result columns by name, keeping the first occurrence.
    pub use_column_names: bool,
    /// Accumulate rows until the request completes.
    pub row_collection_on_request_completion: bool,
    /// Accumulate rows per completion token, resetting at each one.
    pub row_collection_on_done: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            user_name: String::new(),
            password: String::new(),
            port: None,
            instance_name: None,
            database: None,
            app_name: "tds-conn".to_string(),
            packet_size: DEFAULT_PACKET_SIZE,
            tds_version: TdsVersion::V7_4,
            connect_timeout: Duration::from_millis(15_000),
            request_timeout: Duration::from_millis(15_000),
            cancel_timeout: Duration::from_millis(5_000),
            textsize: 2_147_483_647,
            isolation_level: IsolationLevel::ReadCommitted,
            encrypt: false,
            trust_server_certificate: false,
            use_utc: true,
            use_column_names: false,
            row_collection_on_request_completion: false,
            row_collection_on_done: false,
        }
    }
}

impl Config {
    /// Create a configuration for the given server and credentials.
    pub fn new(
        server: impl Into<String>,
        user_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            user_name: user_name.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Set a fixed port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set a named instance.
    #[must_use]
    pub fn with_instance_name(mut self, instance: impl Into<String>) -> Self {
        self.instance_name = Some(instance.into());
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Request TLS.
    #[must_use]
    pub fn with_encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The port to use when no lookup is needed, 1433 by default.
    #[must_use]
    pub fn effective_port(&self) -> Option<u16> {
        if self.instance_name.is_some() {
            self.port
        } else {
            Some(self.port.unwrap_or(1433))
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.port.is_some() && self.instance_name.is_some() {
            return Err(ConnectionError::new(
                ErrorCode::EInvalidState,
                "port and instance name are mutually exclusive",
            ));
        }
        if let Some(port) = self.port {
            if port == 0 {
                return Err(ConnectionError::new(
                    ErrorCode::EInvalidState,
                    "port must be in the range 1..=65535",
                ));
            }
        }
        if self.packet_size < 512 || self.packet_size > tds_wire::packet::MAX_PACKET_SIZE {
            return Err(ConnectionError::new(
                ErrorCode::EInvalidState,
                format!("packet size {} out of range", self.packet_size),
            ));
        }
        Ok(())
    }

    /// The session-option batch sent right after login.
    #[must_use]
    pub fn initial_sql(&self) -> String {
        format!(
            "set textsize {}\n\
             set quoted_identifier on\n\
             set arithabort off\n\
             set numeric_roundabort off\n\
             set ansi_warnings on\n\
             set ansi_padding on\n\
             set ansi_nulls on\n\
             set concat_null_yields_null on\n\
             set cursor_close_on_commit off\n\
             set implicit_transactions off\n\
             set language us_english\n\
             set dateformat mdy\n\
             set datefirst 7\n\
             set transaction isolation level {}",
            self.textsize,
            self.isolation_level.as_sql()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = Config::default();
        assert_eq!(config.packet_size, 4096);
        assert_eq!(config.tds_version, TdsVersion::V7_4);
        assert_eq!(config.connect_timeout, Duration::from_millis(15_000));
        assert_eq!(config.cancel_timeout, Duration::from_millis(5_000));
        assert_eq!(config.textsize, 2_147_483_647);
        assert!(!config.encrypt);
        assert!(config.use_utc);
        assert_eq!(config.effective_port(), Some(1433));
    }

    #[test]
    fn port_zero_is_rejected() {
        let config = Config::default().with_port(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn port_and_instance_are_mutually_exclusive() {
        let config = Config::default()
            .with_port(1433)
            .with_instance_name("SQLEXPRESS");
        assert!(config.validate().is_err());
    }

    #[test]
    fn instance_without_port_is_valid() {
        let config = Config::default().with_instance_name("SQLEXPRESS");
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_port(), None);
    }

    #[test]
    fn initial_sql_reflects_options() {
        let sql = Config::default().initial_sql();
        assert!(sql.starts_with("set textsize 2147483647"));
        assert!(sql.contains("set ansi_nulls on"));
        assert!(sql.contains("set datefirst 7"));
        assert!(sql.ends_with("set transaction isolation level read committed"));
    }
}
