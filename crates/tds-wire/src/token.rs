//! Token stream decoding.
//!
//! Server responses (TABULAR_RESULT messages) are a sequence of tokens:
//! metadata, rows, environment changes, completion markers. The session
//! core feeds raw packet payloads into [`TokenStreamDecoder`] and reacts to
//! the tokens it yields.
//!
//! The decoder is incremental: a token split across packet boundaries stays
//! buffered until the rest of its bytes arrive. Bytes left over when a
//! message ends indicate a truncated stream and are the caller's cue to
//! raise a token-stream error.

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::{read_b_varchar, read_us_varchar};
use crate::error::ProtocolError;
use crate::types::TypeId;

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Column ordering (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Return value (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null-bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Statement completion (DONE).
    Done = 0xFD,
    /// Procedure completion (DONEPROC).
    DoneProc = 0xFE,
    /// Completion inside a procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create a token type from a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x81 => Ok(Self::ColMetaData),
            0xA9 => Ok(Self::Order),
            0xAA => Ok(Self::Error),
            0xAB => Ok(Self::Info),
            0xAC => Ok(Self::ReturnValue),
            0xAD => Ok(Self::LoginAck),
            0xD1 => Ok(Self::Row),
            0xD2 => Ok(Self::NbcRow),
            0xE3 => Ok(Self::EnvChange),
            0x79 => Ok(Self::ReturnStatus),
            0xFD => Ok(Self::Done),
            0xFE => Ok(Self::DoneProc),
            0xFF => Ok(Self::DoneInProc),
            other => Err(ProtocolError::InvalidTokenType(other)),
        }
    }
}

/// A parsed token.
#[derive(Debug, Clone)]
pub enum Token {
    /// Column metadata describing the next result set.
    ColMetaData(ColMetaData),
    /// A row of raw column values.
    Row(Row),
    /// Column ordering hint.
    Order(Vec<u16>),
    /// Statement completion.
    Done(Done),
    /// Stored procedure completion.
    DoneProc(Done),
    /// Completion within a stored procedure.
    DoneInProc(Done),
    /// Stored procedure return status.
    ReturnStatus(i32),
    /// Stored procedure output parameter.
    ReturnValue(ReturnValue),
    /// Server error message.
    Error(ServerMessage),
    /// Server informational message.
    Info(ServerMessage),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Environment change notification.
    EnvChange(EnvChange),
}

/// Column metadata token.
#[derive(Debug, Clone, Default)]
pub struct ColMetaData {
    /// Column definitions in result-set order.
    pub columns: Vec<ColumnDef>,
}

/// A single column definition.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Data type.
    pub type_id: TypeId,
    /// Column flags.
    pub flags: u16,
    /// User type ID.
    pub user_type: u32,
    /// Maximum length for variable types.
    pub max_length: Option<u32>,
    /// Precision for numeric types.
    pub precision: Option<u8>,
    /// Scale for numeric and time types.
    pub scale: Option<u8>,
    /// Raw collation bytes for character types.
    pub collation: Option<[u8; 5]>,
}

/// A row of raw, undecoded column values. `None` marks SQL NULL.
#[derive(Debug, Clone, Default)]
pub struct Row {
    /// One entry per column, in metadata order.
    pub values: Vec<Option<Bytes>>,
}

/// DONE/DONEPROC/DONEINPROC token.
#[derive(Debug, Clone, Copy)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command token.
    pub cur_cmd: u16,
    /// Row count, valid when `status.count` is set.
    pub row_count: u64,
}

/// DONE status flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoneStatus {
    /// More results follow.
    pub more: bool,
    /// The statement errored.
    pub error: bool,
    /// A transaction is in progress.
    pub in_xact: bool,
    /// The row count field is valid.
    pub count: bool,
    /// Attention acknowledgment.
    pub attention: bool,
}

impl DoneStatus {
    const MORE: u16 = 0x0001;
    const ERROR: u16 = 0x0002;
    const INXACT: u16 = 0x0004;
    const COUNT: u16 = 0x0010;
    const ATTN: u16 = 0x0020;

    /// Parse from the raw status word.
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self {
            more: bits & Self::MORE != 0,
            error: bits & Self::ERROR != 0,
            in_xact: bits & Self::INXACT != 0,
            count: bits & Self::COUNT != 0,
            attention: bits & Self::ATTN != 0,
        }
    }

    /// Convert back to the raw status word.
    #[must_use]
    pub fn to_bits(self) -> u16 {
        let mut bits = 0;
        if self.more {
            bits |= Self::MORE;
        }
        if self.error {
            bits |= Self::ERROR;
        }
        if self.in_xact {
            bits |= Self::INXACT;
        }
        if self.count {
            bits |= Self::COUNT;
        }
        if self.attention {
            bits |= Self::ATTN;
        }
        bits
    }
}

/// Server error or informational message.
#[derive(Debug, Clone)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Message state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Reporting server name.
    pub server: String,
    /// Procedure name, if any.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: i32,
}

/// Login acknowledgment token.
#[derive(Debug, Clone)]
pub struct LoginAck {
    /// Interface type; 1 is SQL_TSQL.
    pub interface: u8,
    /// Negotiated TDS version, raw.
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

/// Stored procedure output parameter.
#[derive(Debug, Clone)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name.
    pub name: String,
    /// Data type of the value.
    pub type_id: TypeId,
    /// Raw value bytes; `None` marks SQL NULL.
    pub value: Option<Bytes>,
}

/// Environment change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    /// Current database changed.
    Database {
        /// New database name.
        new: String,
        /// Previous database name.
        old: String,
    },
    /// Session language changed.
    Language {
        /// New language.
        new: String,
        /// Previous language.
        old: String,
    },
    /// Character set changed.
    CharacterSet {
        /// New character set.
        new: String,
        /// Previous character set.
        old: String,
    },
    /// Packet size renegotiated; values are decimal strings.
    PacketSize {
        /// New packet size.
        new: String,
        /// Previous packet size.
        old: String,
    },
    /// Transaction began; carries the server-issued 8-byte descriptor.
    BeginTransaction(u64),
    /// Transaction committed.
    CommitTransaction,
    /// Transaction rolled back.
    RollbackTransaction,
    /// Connection-reset acknowledgment.
    ResetConnectionAck,
    /// Any other environment change, identified by its raw type byte.
    Other(u8),
}

/// Incremental token stream decoder.
///
/// Feed packet payloads with [`push`](Self::push) and drain complete tokens
/// with [`try_next`](Self::try_next). Column metadata is retained so rows
/// can be decoded without external context.
#[derive(Debug, Default)]
pub struct TokenStreamDecoder {
    buf: BytesMut,
    metadata: Option<ColMetaData>,
}

impl TokenStreamDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw response bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete token, or `None` if more bytes are needed.
    pub fn try_next(&mut self) -> Result<Option<Token>, ProtocolError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut cursor: &[u8] = &self.buf;
        let total = cursor.len();

        match decode_token(&mut cursor, self.metadata.as_ref()) {
            Ok(token) => {
                let consumed = total - cursor.len();
                self.buf.advance(consumed);
                if let Token::ColMetaData(ref meta) = token {
                    self.metadata = Some(meta.clone());
                }
                Ok(Some(token))
            }
            // Token is split across packets; wait for the rest.
            Err(ProtocolError::UnexpectedEof) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether a partial token is still buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop buffered bytes and metadata, e.g. after a fatal stream error.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.metadata = None;
    }
}

fn decode_token(
    src: &mut &[u8],
    metadata: Option<&ColMetaData>,
) -> Result<Token, ProtocolError> {
    let token_type = TokenType::from_u8(src.get_u8())?;

    match token_type {
        TokenType::Done => Ok(Token::Done(decode_done(src)?)),
        TokenType::DoneProc => Ok(Token::DoneProc(decode_done(src)?)),
        TokenType::DoneInProc => Ok(Token::DoneInProc(decode_done(src)?)),
        TokenType::ReturnStatus => {
            if src.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }
            Ok(Token::ReturnStatus(src.get_i32_le()))
        }
        TokenType::Error => Ok(Token::Error(decode_server_message(src)?)),
        TokenType::Info => Ok(Token::Info(decode_server_message(src)?)),
        TokenType::LoginAck => Ok(Token::LoginAck(decode_login_ack(src)?)),
        TokenType::EnvChange => Ok(Token::EnvChange(decode_env_change(src)?)),
        TokenType::Order => Ok(Token::Order(decode_order(src)?)),
        TokenType::ColMetaData => Ok(Token::ColMetaData(decode_col_metadata(src)?)),
        TokenType::Row => {
            let meta = metadata.ok_or(ProtocolError::MissingMetadata)?;
            Ok(Token::Row(decode_row(src, meta)?))
        }
        TokenType::NbcRow => {
            let meta = metadata.ok_or(ProtocolError::MissingMetadata)?;
            Ok(Token::Row(decode_nbc_row(src, meta)?))
        }
        TokenType::ReturnValue => Ok(Token::ReturnValue(decode_return_value(src)?)),
    }
}

fn decode_done(src: &mut &[u8]) -> Result<Done, ProtocolError> {
    // status (2) + curcmd (2) + rowcount (8)
    if src.remaining() < 12 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(Done {
        status: DoneStatus::from_bits(src.get_u16_le()),
        cur_cmd: src.get_u16_le(),
        row_count: src.get_u64_le(),
    })
}

/// Take a `u16`-length-delimited token body, whole or not at all.
fn take_delimited(src: &mut &[u8]) -> Result<Bytes, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let length = u16::from_le_bytes([src[0], src[1]]) as usize;
    if src.remaining() < 2 + length {
        return Err(ProtocolError::UnexpectedEof);
    }
    src.advance(2);
    Ok(src.copy_to_bytes(length))
}

fn decode_server_message(src: &mut &[u8]) -> Result<ServerMessage, ProtocolError> {
    let body = take_delimited(src)?;
    let mut cursor: &[u8] = &body;

    if cursor.remaining() < 6 {
        return Err(ProtocolError::MalformedToken("message header"));
    }
    let number = cursor.get_i32_le();
    let state = cursor.get_u8();
    let class = cursor.get_u8();

    let message =
        read_us_varchar(&mut cursor).ok_or(ProtocolError::MalformedToken("message text"))?;
    let server =
        read_b_varchar(&mut cursor).ok_or(ProtocolError::MalformedToken("server name"))?;
    let procedure =
        read_b_varchar(&mut cursor).ok_or(ProtocolError::MalformedToken("procedure name"))?;

    if cursor.remaining() < 4 {
        return Err(ProtocolError::MalformedToken("line number"));
    }
    let line = cursor.get_i32_le();

    Ok(ServerMessage {
        number,
        state,
        class,
        message,
        server,
        procedure,
        line,
    })
}

fn decode_login_ack(src: &mut &[u8]) -> Result<LoginAck, ProtocolError> {
    let body = take_delimited(src)?;
    let mut cursor: &[u8] = &body;

    if cursor.remaining() < 5 {
        return Err(ProtocolError::MalformedToken("loginack header"));
    }
    let interface = cursor.get_u8();
    let tds_version = cursor.get_u32_le();

    let prog_name =
        read_b_varchar(&mut cursor).ok_or(ProtocolError::MalformedToken("program name"))?;

    if cursor.remaining() < 4 {
        return Err(ProtocolError::MalformedToken("program version"));
    }
    let prog_version = cursor.get_u32_le();

    Ok(LoginAck {
        interface,
        tds_version,
        prog_name,
        prog_version,
    })
}

fn decode_order(src: &mut &[u8]) -> Result<Vec<u16>, ProtocolError> {
    let body = take_delimited(src)?;
    let mut cursor: &[u8] = &body;
    let mut columns = Vec::with_capacity(cursor.len() / 2);
    while cursor.remaining() >= 2 {
        columns.push(cursor.get_u16_le());
    }
    Ok(columns)
}

fn decode_env_change(src: &mut &[u8]) -> Result<EnvChange, ProtocolError> {
    let body = take_delimited(src)?;
    let mut cursor: &[u8] = &body;

    if cursor.remaining() < 1 {
        return Err(ProtocolError::MalformedToken("envchange type"));
    }
    let env_type = cursor.get_u8();

    match env_type {
        1 => {
            let (new, old) = env_string_pair(&mut cursor)?;
            Ok(EnvChange::Database { new, old })
        }
        2 => {
            let (new, old) = env_string_pair(&mut cursor)?;
            Ok(EnvChange::Language { new, old })
        }
        3 => {
            let (new, old) = env_string_pair(&mut cursor)?;
            Ok(EnvChange::CharacterSet { new, old })
        }
        4 => {
            let (new, old) = env_string_pair(&mut cursor)?;
            Ok(EnvChange::PacketSize { new, old })
        }
        8 => {
            // New value is the 8-byte descriptor; old value is empty.
            if cursor.remaining() < 9 {
                return Err(ProtocolError::MalformedToken("transaction descriptor"));
            }
            let len = cursor.get_u8() as usize;
            if len != 8 || cursor.remaining() < 8 {
                return Err(ProtocolError::MalformedToken("transaction descriptor"));
            }
            Ok(EnvChange::BeginTransaction(cursor.get_u64_le()))
        }
        9 => Ok(EnvChange::CommitTransaction),
        10 => Ok(EnvChange::RollbackTransaction),
        18 => Ok(EnvChange::ResetConnectionAck),
        other => Ok(EnvChange::Other(other)),
    }
}

fn env_string_pair(cursor: &mut &[u8]) -> Result<(String, String), ProtocolError> {
    let new =
        read_b_varchar(cursor).ok_or(ProtocolError::MalformedToken("envchange new value"))?;
    let old =
        read_b_varchar(cursor).ok_or(ProtocolError::MalformedToken("envchange old value"))?;
    Ok((new, old))
}

fn decode_col_metadata(src: &mut &[u8]) -> Result<ColMetaData, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let count = src.get_u16_le();

    // 0xFFFF marks "no metadata".
    if count == 0xFFFF {
        return Ok(ColMetaData::default());
    }

    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        columns.push(decode_column(src)?);
    }

    Ok(ColMetaData { columns })
}

fn decode_column(src: &mut &[u8]) -> Result<ColumnDef, ProtocolError> {
    // user type (4) + flags (2) + type (1)
    if src.remaining() < 7 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let user_type = src.get_u32_le();
    let flags = src.get_u16_le();
    let type_id = TypeId::from_u8(src.get_u8())?;

    let (max_length, precision, scale, collation) = decode_type_info(src, type_id)?;

    let name = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;

    Ok(ColumnDef {
        name,
        type_id,
        flags,
        user_type,
        max_length,
        precision,
        scale,
        collation,
    })
}

type TypeInfoParts = (Option<u32>, Option<u8>, Option<u8>, Option<[u8; 5]>);

fn decode_type_info(src: &mut &[u8], type_id: TypeId) -> Result<TypeInfoParts, ProtocolError> {
    if type_id.fixed_size().is_some() {
        return Ok((None, None, None, None));
    }

    match type_id {
        TypeId::DecimalN | TypeId::NumericN => {
            if src.remaining() < 3 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let max_length = src.get_u8() as u32;
            let precision = src.get_u8();
            let scale = src.get_u8();
            Ok((Some(max_length), Some(precision), Some(scale), None))
        }
        TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
            if src.remaining() < 1 {
                return Err(ProtocolError::UnexpectedEof);
            }
            Ok((None, None, Some(src.get_u8()), None))
        }
        TypeId::Date => Ok((None, None, None, None)),
        _ if type_id.is_ushort_length() => {
            if src.remaining() < 2 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let max_length = src.get_u16_le() as u32;
            let collation = if type_id.has_collation() {
                if src.remaining() < 5 {
                    return Err(ProtocolError::UnexpectedEof);
                }
                let mut raw = [0u8; 5];
                src.copy_to_slice(&mut raw);
                Some(raw)
            } else {
                None
            };
            Ok((Some(max_length), None, None, collation))
        }
        _ => {
            // Remaining byte-length family: GUID, IntN, BitN, FloatN,
            // MoneyN, DateTimeN and the legacy char/binary types.
            if src.remaining() < 1 {
                return Err(ProtocolError::UnexpectedEof);
            }
            Ok((Some(src.get_u8() as u32), None, None, None))
        }
    }
}

fn decode_row(src: &mut &[u8], meta: &ColMetaData) -> Result<Row, ProtocolError> {
    let mut values = Vec::with_capacity(meta.columns.len());
    for column in &meta.columns {
        values.push(decode_value(src, column)?);
    }
    Ok(Row { values })
}

fn decode_nbc_row(src: &mut &[u8], meta: &ColMetaData) -> Result<Row, ProtocolError> {
    let bitmap_len = meta.columns.len().div_ceil(8);
    if src.remaining() < bitmap_len {
        return Err(ProtocolError::UnexpectedEof);
    }
    let mut bitmap = vec![0u8; bitmap_len];
    src.copy_to_slice(&mut bitmap);

    let mut values = Vec::with_capacity(meta.columns.len());
    for (i, column) in meta.columns.iter().enumerate() {
        let is_null = bitmap[i / 8] & (1 << (i % 8)) != 0;
        if is_null {
            values.push(None);
        } else {
            values.push(decode_value(src, column)?);
        }
    }
    Ok(Row { values })
}

fn decode_value(src: &mut &[u8], column: &ColumnDef) -> Result<Option<Bytes>, ProtocolError> {
    if let Some(size) = column.type_id.fixed_size() {
        if src.remaining() < size {
            return Err(ProtocolError::UnexpectedEof);
        }
        return Ok(Some(src.copy_to_bytes(size)));
    }

    if column.type_id.is_byte_length() {
        if src.remaining() < 1 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let len = src.get_u8() as usize;
        if len == 0 {
            return Ok(None);
        }
        if src.remaining() < len {
            return Err(ProtocolError::UnexpectedEof);
        }
        return Ok(Some(src.copy_to_bytes(len)));
    }

    if column.type_id.is_ushort_length() {
        if column.max_length == Some(0xFFFF) {
            return decode_plp_value(src);
        }
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let len = src.get_u16_le() as usize;
        if len == 0xFFFF {
            return Ok(None);
        }
        if src.remaining() < len {
            return Err(ProtocolError::UnexpectedEof);
        }
        return Ok(Some(src.copy_to_bytes(len)));
    }

    Err(ProtocolError::UnsupportedColumnType(column.type_id as u8))
}

/// Partially-length-prefixed value: u64 total length (all-ones for NULL),
/// then u32-length chunks terminated by a zero-length chunk.
fn decode_plp_value(src: &mut &[u8]) -> Result<Option<Bytes>, ProtocolError> {
    if src.remaining() < 8 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let total = src.get_u64_le();
    if total == u64::MAX {
        return Ok(None);
    }

    let mut value = BytesMut::new();
    loop {
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let chunk = src.get_u32_le() as usize;
        if chunk == 0 {
            break;
        }
        if src.remaining() < chunk {
            return Err(ProtocolError::UnexpectedEof);
        }
        value.extend_from_slice(&src[..chunk]);
        src.advance(chunk);
    }
    Ok(Some(value.freeze()))
}

fn decode_return_value(src: &mut &[u8]) -> Result<ReturnValue, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let ordinal = src.get_u16_le();

    let name = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;

    // status (1) + user type (4) + flags (2) + type (1)
    if src.remaining() < 8 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let _status = src.get_u8();
    let _user_type = src.get_u32_le();
    let flags = src.get_u16_le();
    let type_id = TypeId::from_u8(src.get_u8())?;

    let (max_length, precision, scale, collation) = decode_type_info(src, type_id)?;

    let column = ColumnDef {
        name: String::new(),
        type_id,
        flags,
        user_type: 0,
        max_length,
        precision,
        scale,
        collation,
    };
    let value = decode_value(src, &column)?;

    Ok(ReturnValue {
        ordinal,
        name,
        type_id,
        value,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn int_col_metadata() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::ColMetaData as u8);
        buf.put_u16_le(1); // one column
        buf.put_u32_le(0); // user type
        buf.put_u16_le(0); // flags
        buf.put_u8(TypeId::IntN as u8);
        buf.put_u8(4); // max length
        buf.put_u8(2); // name length in chars
        buf.put_u16_le(u16::from(b'i'));
        buf.put_u16_le(u16::from(b'd'));
        buf.to_vec()
    }

    fn int_row(value: i32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::Row as u8);
        buf.put_u8(4);
        buf.put_i32_le(value);
        buf.to_vec()
    }

    #[test]
    fn done_roundtrip() {
        let mut decoder = TokenStreamDecoder::new();
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::Done as u8);
        buf.put_u16_le(DoneStatus::COUNT | DoneStatus::ATTN);
        buf.put_u16_le(0);
        buf.put_u64_le(3);
        decoder.push(&buf);

        match decoder.try_next().unwrap().unwrap() {
            Token::Done(done) => {
                assert!(done.status.count);
                assert!(done.status.attention);
                assert_eq!(done.row_count, 3);
            }
            other => panic!("unexpected token: {other:?}"),
        }
        assert!(!decoder.has_partial());
    }

    #[test]
    fn metadata_then_rows() {
        let mut decoder = TokenStreamDecoder::new();
        decoder.push(&int_col_metadata());
        decoder.push(&int_row(42));

        match decoder.try_next().unwrap().unwrap() {
            Token::ColMetaData(meta) => {
                assert_eq!(meta.columns.len(), 1);
                assert_eq!(meta.columns[0].name, "id");
            }
            other => panic!("unexpected token: {other:?}"),
        }
        match decoder.try_next().unwrap().unwrap() {
            Token::Row(row) => {
                let value = row.values[0].as_ref().unwrap();
                assert_eq!(&value[..], &42i32.to_le_bytes());
            }
            other => panic!("unexpected token: {other:?}"),
        }
    }

    #[test]
    fn row_without_metadata_is_fatal() {
        let mut decoder = TokenStreamDecoder::new();
        decoder.push(&int_row(1));
        assert!(matches!(
            decoder.try_next(),
            Err(ProtocolError::MissingMetadata)
        ));
    }

    #[test]
    fn split_token_waits_for_more_bytes() {
        let mut decoder = TokenStreamDecoder::new();
        let bytes = int_col_metadata();
        let (head, tail) = bytes.split_at(5);

        decoder.push(head);
        assert!(decoder.try_next().unwrap().is_none());
        assert!(decoder.has_partial());

        decoder.push(tail);
        assert!(matches!(
            decoder.try_next().unwrap().unwrap(),
            Token::ColMetaData(_)
        ));
    }

    #[test]
    fn env_change_transaction_descriptors() {
        let mut decoder = TokenStreamDecoder::new();
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::EnvChange as u8);
        buf.put_u16_le(11); // type + new (1+8) + old (1)
        buf.put_u8(8); // begin transaction
        buf.put_u8(8);
        buf.put_u64_le(0xABCD);
        buf.put_u8(0);
        decoder.push(&buf);

        match decoder.try_next().unwrap().unwrap() {
            Token::EnvChange(EnvChange::BeginTransaction(desc)) => assert_eq!(desc, 0xABCD),
            other => panic!("unexpected token: {other:?}"),
        }
    }

    #[test]
    fn login_ack_fields() {
        let mut decoder = TokenStreamDecoder::new();
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::LoginAck as u8);

        let mut body = BytesMut::new();
        body.put_u8(1); // interface SQL_TSQL
        body.put_u32_le(crate::version::TdsVersion::V7_4.raw());
        body.put_u8(3);
        for u in "SQL".encode_utf16() {
            body.put_u16_le(u);
        }
        body.put_u32_le(0x10_00_00_00);

        buf.put_u16_le(body.len() as u16);
        buf.put_slice(&body);
        decoder.push(&buf);

        match decoder.try_next().unwrap().unwrap() {
            Token::LoginAck(ack) => {
                assert_eq!(ack.interface, 1);
                assert_eq!(ack.tds_version, crate::version::TdsVersion::V7_4.raw());
                assert_eq!(ack.prog_name, "SQL");
            }
            other => panic!("unexpected token: {other:?}"),
        }
    }

    #[test]
    fn unknown_token_type_is_fatal() {
        let mut decoder = TokenStreamDecoder::new();
        decoder.push(&[0xEE]);
        assert!(matches!(
            decoder.try_next(),
            Err(ProtocolError::InvalidTokenType(0xEE))
        ));
    }
}
