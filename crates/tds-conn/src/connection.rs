//! The session core.
//!
//! A [`Connection`] owns the socket, the framing engine, the token stream
//! decoder, the single request slot, and the transaction descriptor stack,
//! and drives them through the nine-state machine described in
//! [`State`](crate::state::State).
//!
//! Session establishment happens in [`Connection::connect`]: the PRELOGIN
//! exchange runs over the raw socket (its response accumulated in a message
//! buffer), the TLS upgrade runs tunneled inside PRELOGIN packets when the
//! server negotiates encryption, then LOGIN7 and the initial SQL batch flow
//! through the framed transport. Afterwards requests are accepted one at a
//! time and completed at their response's message boundary.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use bytes::{Bytes, BytesMut};
use tds_framing::{CodecError, MessageEvent, MessageIo};
use tds_tls::{TlsConnector, TlsPreloginWrapper, TlsStream};
use tds_wire::batch;
use tds_wire::login7::Login7;
use tds_wire::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
use tds_wire::prelogin::{EncryptionLevel, PreLogin};
use tds_wire::rpc::{RpcParam, RpcRequest};
use tds_wire::tm;
use tds_wire::token::{EnvChange, Token, TokenStreamDecoder};
use tds_wire::version::TdsVersion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use crate::cancel::{AttentionChannel, CancelHandle};
use crate::config::Config;
use crate::error::{ConnectionError, ErrorCode, RequestError};
use crate::event::{ConnectionEvent, EventSink};
use crate::instance::lookup_instance_port;
use crate::request::{ActiveRequest, RequestOutcome};
use crate::state::State;
use crate::transaction::{IsolationLevel, Transaction};

/// Framed transport after the handshake settles on plaintext or TLS.
enum Framed {
    Plain(MessageIo<TcpStream>),
    Tls(MessageIo<TlsStream<TlsPreloginWrapper<TcpStream>>>),
}

impl Framed {
    fn set_packet_size(&mut self, size: usize) {
        match self {
            Self::Plain(io) => io.set_packet_size(size),
            Self::Tls(io) => io.set_packet_size(size),
        }
    }

    fn attention_channel(&self) -> AttentionChannel {
        match self {
            Self::Plain(io) => AttentionChannel::Plain(io.attention_writer()),
            Self::Tls(io) => AttentionChannel::Tls(io.attention_writer()),
        }
    }

    async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
        reset_connection: bool,
    ) -> Result<(), CodecError> {
        match self {
            Self::Plain(io) => io.send_message(packet_type, payload, reset_connection).await,
            Self::Tls(io) => io.send_message(packet_type, payload, reset_connection).await,
        }
    }

    async fn next_event(&mut self) -> Result<Option<MessageEvent>, CodecError> {
        match self {
            Self::Plain(io) => io.next_event().await,
            Self::Tls(io) => io.next_event().await,
        }
    }
}

/// A TDS session.
pub struct Connection {
    config: Config,
    state: State,
    published_state: Arc<AtomicU8>,
    attention_requested: Arc<AtomicBool>,
    framed: Option<Framed>,
    decoder: TokenStreamDecoder,
    events: EventSink,
    tds_version: TdsVersion,
    logged_in: bool,
    login_error: Option<ConnectionError>,
    closed: bool,
    reset_on_next_request: bool,
    request: Option<ActiveRequest>,
    proc_return_status: Option<i32>,
    transactions: Vec<Transaction>,
    transaction_descriptors: Vec<u64>,
}

impl Connection {
    /// Connect and log in.
    ///
    /// Resolves the instance port when needed, performs the PRELOGIN
    /// exchange, upgrades to TLS when negotiated, authenticates, and sends
    /// the initial session-option batch. The whole sequence is bounded by
    /// `config.connect_timeout`.
    pub async fn connect(config: Config) -> Result<Self, ConnectionError> {
        Self::connect_with_events(config, None).await
    }

    /// Connect with an event subscriber.
    pub async fn connect_with_events(
        config: Config,
        events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;

        let mut conn = Self {
            state: State::Connecting,
            published_state: Arc::new(AtomicU8::new(State::Connecting as u8)),
            attention_requested: Arc::new(AtomicBool::new(false)),
            framed: None,
            decoder: TokenStreamDecoder::new(),
            events: events.map(EventSink::new).unwrap_or_default(),
            tds_version: config.tds_version,
            logged_in: false,
            login_error: None,
            closed: false,
            reset_on_next_request: false,
            request: None,
            proc_return_status: None,
            transactions: Vec::new(),
            // The zero sentinel keeps the top of the stack defined for
            // every non-transactional request.
            transaction_descriptors: vec![0],
            config,
        };

        tracing::debug!(
            server = %conn.config.server,
            port = ?conn.config.port,
            instance = ?conn.config.instance_name,
            "connecting"
        );

        let deadline = Instant::now() + conn.config.connect_timeout;
        match conn.run_connect(deadline).await {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.events.emit(ConnectionEvent::Connect(Some(err.clone())));
                conn.transition(State::Final);
                Err(err)
            }
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Negotiated TDS version.
    #[must_use]
    pub fn tds_version(&self) -> TdsVersion {
        self.tds_version
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The descriptor attached to every outbound request.
    #[must_use]
    pub fn current_transaction_descriptor(&self) -> u64 {
        *self
            .transaction_descriptors
            .last()
            .unwrap_or(&0)
    }

    /// Depth of the descriptor stack, sentinel included.
    #[must_use]
    pub fn transaction_descriptor_depth(&self) -> usize {
        self.transaction_descriptors.len()
    }

    /// Number of transactions the caller has open.
    #[must_use]
    pub fn open_transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Handle for canceling an in-flight request from another task.
    ///
    /// `None` once the connection has closed.
    #[must_use]
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.framed.as_ref().map(|framed| CancelHandle {
            channel: framed.attention_channel(),
            state: Arc::clone(&self.published_state),
            attention_requested: Arc::clone(&self.attention_requested),
        })
    }

    /// Cancel the in-flight request.
    ///
    /// Meaningful only while a request is in flight; returns `false` with
    /// no side effects otherwise.
    pub async fn cancel(&mut self) -> Result<bool, ConnectionError> {
        match self.cancel_handle() {
            Some(handle) => handle.cancel().await,
            None => Ok(false),
        }
    }

    /// Execute a SQL batch.
    pub async fn exec_sql_batch(&mut self, sql: &str) -> Result<RequestOutcome, ConnectionError> {
        let payload = batch::encode_sql_batch(sql, self.current_transaction_descriptor());
        self.make_request(PacketType::SqlBatch, payload).await
    }

    /// Execute parameterized SQL through sp_executesql.
    pub async fn exec_sql(
        &mut self,
        sql: &str,
        params: Vec<RpcParam>,
    ) -> Result<RequestOutcome, ConnectionError> {
        let rpc = RpcRequest::execute_sql(sql, params);
        let payload = rpc.encode(self.current_transaction_descriptor());
        self.make_request(PacketType::Rpc, payload).await
    }

    /// Call a stored procedure by name.
    pub async fn call_procedure(
        &mut self,
        proc_name: &str,
        params: Vec<RpcParam>,
    ) -> Result<RequestOutcome, ConnectionError> {
        let mut rpc = RpcRequest::named(proc_name);
        for param in params {
            rpc = rpc.param(param);
        }
        let payload = rpc.encode(self.current_transaction_descriptor());
        self.make_request(PacketType::Rpc, payload).await
    }

    /// Prepare a statement; the handle arrives as an output parameter and
    /// can be read with [`RequestOutcome::int_return_value`].
    pub async fn prepare(
        &mut self,
        sql: &str,
        params: &[RpcParam],
    ) -> Result<RequestOutcome, ConnectionError> {
        let rpc = RpcRequest::prepare(sql, params);
        let payload = rpc.encode(self.current_transaction_descriptor());
        self.make_request(PacketType::Rpc, payload).await
    }

    /// Execute a prepared statement.
    pub async fn execute(
        &mut self,
        handle: i32,
        params: Vec<RpcParam>,
    ) -> Result<RequestOutcome, ConnectionError> {
        let rpc = RpcRequest::execute(handle, params);
        let payload = rpc.encode(self.current_transaction_descriptor());
        self.make_request(PacketType::Rpc, payload).await
    }

    /// Release a prepared statement.
    pub async fn unprepare(&mut self, handle: i32) -> Result<RequestOutcome, ConnectionError> {
        let rpc = RpcRequest::unprepare(handle);
        let payload = rpc.encode(self.current_transaction_descriptor());
        self.make_request(PacketType::Rpc, payload).await
    }

    /// Begin an explicit transaction.
    ///
    /// Rejected below TDS 7.2, which has no transaction descriptors. The
    /// new descriptor is on the stack once the outcome reports success.
    pub async fn begin_transaction(
        &mut self,
        name: &str,
        isolation: Option<IsolationLevel>,
    ) -> Result<RequestOutcome, ConnectionError> {
        if !self.tds_version.supports_transaction_descriptors() {
            return Ok(RequestOutcome::rejected(RequestError::invalid_state(
                format!("transactions require TDS 7.2 or later, session is {}", self.tds_version),
            )));
        }

        let isolation = isolation.unwrap_or(self.config.isolation_level);
        self.transactions.push(Transaction::new(name, isolation));

        let payload =
            tm::encode_begin(name, isolation.to_wire(), self.current_transaction_descriptor());
        let outcome = self
            .make_request(PacketType::TransactionManager, payload)
            .await?;
        if outcome.error.is_some() {
            self.transactions.pop();
        }
        Ok(outcome)
    }

    /// Commit the innermost open transaction.
    pub async fn commit_transaction(&mut self) -> Result<RequestOutcome, ConnectionError> {
        let Some(transaction) = self.transactions.pop() else {
            return Ok(RequestOutcome::rejected(RequestError::new(
                ErrorCode::ENoTrnInProg,
                "no transaction in progress",
            )));
        };

        let payload =
            tm::encode_commit(&transaction.name, self.current_transaction_descriptor());
        self.make_request(PacketType::TransactionManager, payload)
            .await
    }

    /// Roll back the innermost open transaction.
    pub async fn rollback_transaction(&mut self) -> Result<RequestOutcome, ConnectionError> {
        let Some(transaction) = self.transactions.pop() else {
            return Ok(RequestOutcome::rejected(RequestError::new(
                ErrorCode::ENoTrnInProg,
                "no transaction in progress",
            )));
        };

        let payload =
            tm::encode_rollback(&transaction.name, self.current_transaction_descriptor());
        self.make_request(PacketType::TransactionManager, payload)
            .await
    }

    /// Arm the reset-connection flag and re-issue the session options.
    ///
    /// The flag rides the next outbound request's first packet, causing the
    /// server to reset session state before processing it.
    pub async fn reset(&mut self) -> Result<RequestOutcome, ConnectionError> {
        self.reset_on_next_request = true;
        let sql = self.config.initial_sql();
        self.exec_sql_batch(&sql).await
    }

    /// Close the connection.
    pub fn close(mut self) {
        self.transition(State::Final);
    }

    // ------------------------------------------------------------------
    // Session establishment
    // ------------------------------------------------------------------

    async fn run_connect(&mut self, deadline: Instant) -> Result<(), ConnectionError> {
        let port = match self.config.effective_port() {
            Some(port) => port,
            None => {
                let instance = self.config.instance_name.clone().unwrap_or_default();
                let wait = deadline.saturating_duration_since(Instant::now());
                lookup_instance_port(&self.config.server, &instance, wait).await?
            }
        };

        let server = self.config.server.clone();
        let connect_timeout = self.config.connect_timeout;
        let mut stream = timeout_at(deadline, TcpStream::connect((server.as_str(), port)))
            .await
            .map_err(|_| {
                ConnectionError::timeout(format!(
                    "failed to connect to {server}:{port} in {}ms",
                    connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| ConnectionError::socket(format!("connect to {server}:{port} failed: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| ConnectionError::socket(format!("nodelay failed: {e}")))?;

        // socketConnect: send PRELOGIN and start collecting the response.
        self.transition(State::SentPrelogin);

        let client_encryption = if self.config.encrypt {
            EncryptionLevel::On
        } else {
            EncryptionLevel::Off
        };
        let mut prelogin = PreLogin::new(self.config.tds_version, client_encryption);
        if let Some(ref instance) = self.config.instance_name {
            prelogin = prelogin.with_instance(instance.clone());
        }
        write_raw_packet(&mut stream, PacketType::PreLogin, &prelogin.encode(), deadline).await?;

        let mut message_buffer = BytesMut::new();
        loop {
            let (payload, end_of_message) = read_raw_packet(&mut stream, deadline).await?;
            message_buffer.extend_from_slice(&payload);
            if end_of_message {
                break;
            }
        }

        let response = PreLogin::decode(&message_buffer[..])
            .map_err(|e| ConnectionError::socket(format!("malformed prelogin response: {e}")))?;
        tracing::debug!(encryption = ?response.encryption, "prelogin response");

        if response.encryption.requires_tls() {
            self.transition(State::SentTlsNegotiation);

            let connector = TlsConnector::new(self.config.trust_server_certificate)
                .map_err(|e| ConnectionError::socket(e.to_string()))?;
            let tls_stream = timeout_at(deadline, connector.connect_tunneled(stream, &server))
                .await
                .map_err(|_| ConnectionError::timeout("TLS negotiation timed out"))?
                .map_err(|e| ConnectionError::socket(format!("TLS negotiation failed: {e}")))?;

            self.events.emit(ConnectionEvent::Secure);
            self.framed = Some(Framed::Tls(MessageIo::new(tls_stream)));
        } else {
            self.framed = Some(Framed::Plain(MessageIo::new(stream)));
        }
        if let Some(framed) = self.framed.as_mut() {
            framed.set_packet_size(self.config.packet_size);
        }

        let login = self.build_login7();
        self.send_message(PacketType::Login7, login.encode(), false, Some(deadline))
            .await?;
        self.transition(State::SentLogin7);

        // Login response: tokens decide, the message boundary judges.
        loop {
            match self.next_event_by(deadline).await? {
                Some(MessageEvent::Data(bytes)) => self.feed_tokens(&bytes)?,
                Some(MessageEvent::Message) => {
                    self.end_of_message_check()?;
                    if self.logged_in {
                        break;
                    }
                    let err = self
                        .login_error
                        .take()
                        .unwrap_or_else(|| ConnectionError::login("login failed"));
                    return Err(err);
                }
                None => {
                    return Err(ConnectionError::socket("connection closed during login"));
                }
            }
        }

        self.transition(State::SendingInitialSql);
        let sql = self.config.initial_sql();
        let payload = batch::encode_sql_batch(&sql, self.current_transaction_descriptor());
        self.send_message(PacketType::SqlBatch, payload, false, Some(deadline))
            .await?;

        loop {
            match self.next_event_by(deadline).await? {
                Some(MessageEvent::Data(bytes)) => self.feed_tokens(&bytes)?,
                Some(MessageEvent::Message) => {
                    self.end_of_message_check()?;
                    break;
                }
                None => {
                    return Err(ConnectionError::socket("connection closed during initial SQL"));
                }
            }
        }

        // The connect timer is disarmed here: the deadline no longer
        // bounds anything once the session reaches LoggedIn.
        self.events.emit(ConnectionEvent::Connect(None));
        self.transition(State::LoggedIn);
        Ok(())
    }

    fn build_login7(&self) -> Login7 {
        let mut login = Login7::new()
            .with_tds_version(self.config.tds_version)
            .with_packet_size(self.config.packet_size as u32)
            .with_credentials(self.config.user_name.clone(), self.config.password.clone())
            .with_app_name(self.config.app_name.clone())
            .with_server_name(self.config.server.clone());
        if let Some(ref database) = self.config.database {
            login = login.with_database(database.clone());
        }
        login
    }

    // ------------------------------------------------------------------
    // Request lifecycle
    // ------------------------------------------------------------------

    async fn make_request(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
    ) -> Result<RequestOutcome, ConnectionError> {
        if !self.state.accepts_requests() || self.request.is_some() {
            return Ok(RequestOutcome::rejected(RequestError::invalid_state(
                format!("requests are not allowed in state {}", self.state),
            )));
        }

        self.request = Some(ActiveRequest::new());
        let reset_connection = std::mem::take(&mut self.reset_on_next_request);
        self.transition(State::SentClientRequest);

        if let Err(err) = self
            .send_message(packet_type, payload, reset_connection, None)
            .await
        {
            self.request = None;
            return Err(self.fail(err));
        }

        self.run_request().await
    }

    async fn run_request(&mut self) -> Result<RequestOutcome, ConnectionError> {
        loop {
            self.check_attention();

            let event = match self.next_event().await {
                Ok(event) => event,
                Err(err) => return Err(self.fail(err)),
            };

            // An attention may have been requested while blocked reading.
            self.check_attention();

            match event {
                Some(MessageEvent::Data(bytes)) => {
                    if let Err(err) = self.feed_tokens(&bytes) {
                        return Err(self.fail(err));
                    }
                }
                Some(MessageEvent::Message) => {
                    if let Err(err) = self.end_of_message_check() {
                        return Err(self.fail(err));
                    }

                    match self.state {
                        State::SentClientRequest => {
                            let request = self.request.take().unwrap_or_default();
                            self.attention_requested.store(false, Ordering::Release);
                            self.transition(State::LoggedIn);
                            return Ok(RequestOutcome::from_request(request, None));
                        }
                        State::SentAttention => {
                            let acknowledged =
                                self.request.as_ref().is_some_and(|r| r.canceled);
                            if acknowledged {
                                let request = self.request.take().unwrap_or_default();
                                self.attention_requested.store(false, Ordering::Release);
                                self.transition(State::LoggedIn);
                                return Ok(RequestOutcome::from_request(
                                    request,
                                    Some(RequestError::canceled()),
                                ));
                            }
                            // Intermediate message between the attention
                            // and its acknowledgment; dropped.
                        }
                        other => {
                            return Err(self.fail(ConnectionError::socket(format!(
                                "unexpected message boundary in state {other}"
                            ))));
                        }
                    }
                }
                None => {
                    return Err(self.fail(ConnectionError::socket("connection closed")));
                }
            }
        }
    }

    fn check_attention(&mut self) {
        if self.state == State::SentClientRequest
            && self.attention_requested.load(Ordering::Acquire)
        {
            self.transition(State::SentAttention);
        }
    }

    // ------------------------------------------------------------------
    // Token dispatch
    // ------------------------------------------------------------------

    fn feed_tokens(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.decoder.push(bytes);
        loop {
            match self.decoder.try_next() {
                Ok(Some(token)) => self.handle_token(token)?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.decoder.clear();
                    return Err(ConnectionError::socket(format!("token stream error: {e}")));
                }
            }
        }
    }

    fn end_of_message_check(&mut self) -> Result<(), ConnectionError> {
        if self.decoder.has_partial() {
            self.decoder.clear();
            return Err(ConnectionError::socket("token stream truncated mid-token"));
        }
        Ok(())
    }

    fn handle_token(&mut self, token: Token) -> Result<(), ConnectionError> {
        match token {
            Token::Info(msg) => {
                tracing::debug!(number = msg.number, message = %msg.message, "server info");
                self.events.emit(ConnectionEvent::InfoMessage(msg));
            }
            Token::Error(msg) => {
                tracing::debug!(
                    number = msg.number,
                    class = msg.class,
                    message = %msg.message,
                    "server error"
                );
                if self.logged_in {
                    if let Some(request) = self.request.as_mut() {
                        request.record_error(RequestError::server(
                            msg.message.clone(),
                            msg.number,
                            msg.class,
                        ));
                    }
                } else if self.login_error.is_none() {
                    self.login_error = Some(ConnectionError::login(msg.message.clone()));
                }
                self.events.emit(ConnectionEvent::ErrorMessage(msg));
            }
            Token::LoginAck(ack) => {
                let version = TdsVersion::new(ack.tds_version);
                let known = [
                    TdsVersion::V7_0,
                    TdsVersion::V7_1,
                    TdsVersion::V7_2,
                    TdsVersion::V7_3A,
                    TdsVersion::V7_3B,
                    TdsVersion::V7_4,
                ]
                .contains(&version);

                if ack.interface == 0 {
                    self.login_error = Some(ConnectionError::login(
                        "server does not support the SQL interface",
                    ));
                    self.logged_in = false;
                } else if !known {
                    self.login_error = Some(ConnectionError::login(format!(
                        "server responded with unknown TDS version 0x{:08X}",
                        ack.tds_version
                    )));
                    self.logged_in = false;
                } else {
                    tracing::debug!(version = %version, server = %ack.prog_name, "login acknowledged");
                    self.tds_version = version;
                    self.logged_in = true;
                }
            }
            Token::EnvChange(env) => self.handle_env_change(env),
            Token::ColMetaData(meta) => {
                let use_column_names = self.config.use_column_names;
                let Some(request) = self.request.as_mut() else {
                    return Err(ConnectionError::socket(
                        "received column metadata with no request in flight",
                    ));
                };
                let mut columns = meta.columns;
                if use_column_names {
                    let mut seen = HashSet::new();
                    columns.retain(|c| seen.insert(c.name.clone()));
                }
                request.columns = Some(columns);
            }
            Token::Order(_) => {
                if self.request.is_none() {
                    return Err(ConnectionError::socket(
                        "received order token with no request in flight",
                    ));
                }
            }
            Token::Row(row) => {
                let on_completion = self.config.row_collection_on_request_completion;
                let on_done = self.config.row_collection_on_done;
                let Some(request) = self.request.as_mut() else {
                    return Err(ConnectionError::socket(
                        "received row with no request in flight",
                    ));
                };
                if on_completion {
                    request.rows.push(row.clone());
                }
                if on_done {
                    request.rst.push(row);
                }
            }
            Token::ReturnStatus(value) => {
                self.proc_return_status = Some(value);
            }
            Token::ReturnValue(rv) => {
                if let Some(request) = self.request.as_mut() {
                    request.return_values.push(rv);
                }
            }
            Token::Done(done) => {
                if let Some(request) = self.request.as_mut() {
                    if done.status.count {
                        request.row_count += done.row_count;
                    }
                    if done.status.attention {
                        request.canceled = true;
                    }
                }
                if self.config.row_collection_on_done {
                    if let Some(request) = self.request.as_mut() {
                        request.rst.clear();
                    }
                }
            }
            Token::DoneInProc(done) => {
                if let Some(request) = self.request.as_mut() {
                    if done.status.count {
                        request.row_count += done.row_count;
                    }
                }
                if self.config.row_collection_on_done {
                    if let Some(request) = self.request.as_mut() {
                        request.rst.clear();
                    }
                }
            }
            Token::DoneProc(done) => {
                let return_status = self.proc_return_status.take();
                if let Some(request) = self.request.as_mut() {
                    if done.status.count {
                        request.row_count += done.row_count;
                    }
                    if return_status.is_some() {
                        request.return_status = return_status;
                    }
                }
                if self.config.row_collection_on_done {
                    if let Some(request) = self.request.as_mut() {
                        request.rst.clear();
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_env_change(&mut self, env: EnvChange) {
        match env {
            EnvChange::Database { new, .. } => {
                tracing::debug!(database = %new, "database changed");
                self.events.emit(ConnectionEvent::DatabaseChange(new));
            }
            EnvChange::Language { new, .. } => {
                self.events.emit(ConnectionEvent::LanguageChange(new));
            }
            EnvChange::CharacterSet { new, .. } => {
                self.events.emit(ConnectionEvent::CharsetChange(new));
            }
            EnvChange::PacketSize { new, .. } => {
                if let Ok(size) = new.parse::<usize>() {
                    if let Some(framed) = self.framed.as_mut() {
                        framed.set_packet_size(size);
                    }
                }
            }
            EnvChange::BeginTransaction(descriptor) => {
                tracing::debug!(descriptor, "transaction began");
                self.transaction_descriptors.push(descriptor);
            }
            EnvChange::CommitTransaction | EnvChange::RollbackTransaction => {
                // The sentinel never pops.
                if self.transaction_descriptors.len() > 1 {
                    self.transaction_descriptors.pop();
                }
            }
            EnvChange::ResetConnectionAck => {
                self.events.emit(ConnectionEvent::ResetConnection);
            }
            EnvChange::Other(env_type) => {
                tracing::trace!(env_type, "ignored environment change");
            }
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
        reset_connection: bool,
        deadline: Option<Instant>,
    ) -> Result<(), ConnectionError> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| ConnectionError::socket("connection is closed"))?;

        let send = framed.send_message(packet_type, payload, reset_connection);
        let result = match deadline {
            Some(deadline) => timeout_at(deadline, send)
                .await
                .map_err(|_| ConnectionError::timeout("connect timed out"))?,
            None => send.await,
        };
        result.map_err(|e| ConnectionError::socket(e.to_string()))
    }

    async fn next_event(&mut self) -> Result<Option<MessageEvent>, ConnectionError> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| ConnectionError::socket("connection is closed"))?;
        framed
            .next_event()
            .await
            .map_err(|e| ConnectionError::socket(e.to_string()))
    }

    async fn next_event_by(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<MessageEvent>, ConnectionError> {
        let connect_timeout = self.config.connect_timeout;
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| ConnectionError::socket("connection is closed"))?;
        match timeout_at(deadline, framed.next_event()).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(e)) => Err(ConnectionError::socket(e.to_string())),
            Err(_) => Err(ConnectionError::timeout(format!(
                "connect timed out after {}ms",
                connect_timeout.as_millis()
            ))),
        }
    }

    fn transition(&mut self, to: State) {
        if self.state == to {
            return;
        }
        tracing::debug!(from = %self.state, to = %to, "state transition");
        self.state = to;
        self.published_state.store(to as u8, Ordering::Release);
        if to == State::Final {
            self.cleanup();
        }
    }

    /// Fatal error: close the connection and hand the error back.
    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        if self.logged_in {
            self.events.emit(ConnectionEvent::Error(err.clone()));
        }
        self.transition(State::Final);
        err
    }

    /// Runs exactly once, on entry to Final.
    fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.framed = None;
        self.request = None;
        self.logged_in = false;
        self.login_error = None;
        self.events.emit(ConnectionEvent::End);
        tracing::debug!("connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("tds_version", &self.tds_version)
            .field("logged_in", &self.logged_in)
            .field("open_transactions", &self.transactions.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------
// Raw packet I/O for the pre-framing handshake phase
// ----------------------------------------------------------------------

async fn write_raw_packet(
    stream: &mut TcpStream,
    packet_type: PacketType,
    payload: &[u8],
    deadline: Instant,
) -> Result<(), ConnectionError> {
    let header = PacketHeader::new(
        packet_type,
        PacketStatus::END_OF_MESSAGE,
        (PACKET_HEADER_SIZE + payload.len()) as u16,
    )
    .with_packet_id(1);

    let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.extend_from_slice(payload);

    timeout_at(deadline, stream.write_all(&buf))
        .await
        .map_err(|_| ConnectionError::timeout("connect timed out"))?
        .map_err(|e| ConnectionError::socket(format!("write failed: {e}")))
}

async fn read_raw_packet(
    stream: &mut TcpStream,
    deadline: Instant,
) -> Result<(Vec<u8>, bool), ConnectionError> {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    timeout_at(deadline, stream.read_exact(&mut header))
        .await
        .map_err(|_| ConnectionError::timeout("connect timed out"))?
        .map_err(|e| ConnectionError::socket(format!("read failed: {e}")))?;

    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if length < PACKET_HEADER_SIZE {
        return Err(ConnectionError::socket("malformed packet header"));
    }

    let mut payload = vec![0u8; length - PACKET_HEADER_SIZE];
    timeout_at(deadline, stream.read_exact(&mut payload))
        .await
        .map_err(|_| ConnectionError::timeout("connect timed out"))?
        .map_err(|e| ConnectionError::socket(format!("read failed: {e}")))?;

    let end_of_message = header[1] & PacketStatus::END_OF_MESSAGE.bits() != 0;
    Ok((payload, end_of_message))
}
