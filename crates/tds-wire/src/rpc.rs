//! RPC request encoding.
//!
//! RPC payloads (packet type 0x03) call stored procedures, either by name
//! or by the well-known procedure IDs. `sp_executesql` is the workhorse for
//! parameterized SQL; `sp_prepare`/`sp_execute`/`sp_unprepare` back the
//! prepared-statement surface.

use bytes::{BufMut, Bytes, BytesMut};

use crate::batch::write_all_headers;
use crate::codec::write_utf16_string;

/// Well-known stored procedure IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_executesql
    ExecuteSql = 0x000A,
    /// sp_prepare
    Prepare = 0x000B,
    /// sp_execute
    Execute = 0x000C,
    /// sp_unprepare
    Unprepare = 0x000F,
}

const TYPE_INTN: u8 = 0x26;
const TYPE_NVARCHAR: u8 = 0xE7;
const NVARCHAR_MAX: u16 = 0xFFFF;

// Raw collation bytes sent with NVARCHAR params (LCID 0x0409, default flags).
const DEFAULT_COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

/// An RPC parameter value.
#[derive(Debug, Clone)]
enum ParamValue {
    Null,
    Int(i32),
    BigInt(i64),
    NVarChar(String),
}

/// An RPC parameter.
#[derive(Debug, Clone)]
pub struct RpcParam {
    name: String,
    output: bool,
    value: ParamValue,
}

impl RpcParam {
    /// Create an INT parameter.
    pub fn int(name: impl Into<String>, value: i32) -> Self {
        Self {
            name: name.into(),
            output: false,
            value: ParamValue::Int(value),
        }
    }

    /// Create a BIGINT parameter.
    pub fn bigint(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            output: false,
            value: ParamValue::BigInt(value),
        }
    }

    /// Create an NVARCHAR parameter.
    pub fn nvarchar(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: false,
            value: ParamValue::NVarChar(value.into()),
        }
    }

    /// Create a NULL INT parameter.
    pub fn null_int(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: false,
            value: ParamValue::Null,
        }
    }

    /// Mark as an output parameter.
    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.output = true;
        self
    }

    /// SQL type declaration for sp_executesql parameter lists.
    fn declaration(&self) -> String {
        let type_name = match &self.value {
            ParamValue::Null | ParamValue::Int(_) => "int".to_string(),
            ParamValue::BigInt(_) => "bigint".to_string(),
            ParamValue::NVarChar(s) => {
                let chars = s.encode_utf16().count().max(1);
                if chars > 4000 {
                    "nvarchar(max)".to_string()
                } else {
                    format!("nvarchar({chars})")
                }
            }
        };
        format!("{} {}", self.name, type_name)
    }

    fn encode(&self, buf: &mut BytesMut) {
        let name_len = self.name.encode_utf16().count() as u8;
        buf.put_u8(name_len);
        write_utf16_string(buf, &self.name);
        buf.put_u8(if self.output { 0x01 } else { 0x00 });

        match &self.value {
            ParamValue::Null => {
                buf.put_u8(TYPE_INTN);
                buf.put_u8(4); // max length
                buf.put_u8(0); // NULL value
            }
            ParamValue::Int(v) => {
                buf.put_u8(TYPE_INTN);
                buf.put_u8(4);
                buf.put_u8(4);
                buf.put_i32_le(*v);
            }
            ParamValue::BigInt(v) => {
                buf.put_u8(TYPE_INTN);
                buf.put_u8(8);
                buf.put_u8(8);
                buf.put_i64_le(*v);
            }
            ParamValue::NVarChar(s) => {
                let byte_len = s.encode_utf16().count() * 2;
                buf.put_u8(TYPE_NVARCHAR);
                if byte_len > 8000 {
                    buf.put_u16_le(NVARCHAR_MAX);
                    buf.put_slice(&DEFAULT_COLLATION);
                    // PLP: total length, one chunk, terminator.
                    buf.put_u64_le(byte_len as u64);
                    buf.put_u32_le(byte_len as u32);
                    write_utf16_string(buf, s);
                    buf.put_u32_le(0);
                } else {
                    buf.put_u16_le(byte_len.max(2) as u16);
                    buf.put_slice(&DEFAULT_COLLATION);
                    buf.put_u16_le(byte_len as u16);
                    write_utf16_string(buf, s);
                }
            }
        }
    }
}

/// An RPC request, by procedure name or well-known ID.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    proc_name: Option<String>,
    proc_id: Option<ProcId>,
    params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Call a named stored procedure.
    pub fn named(proc_name: impl Into<String>) -> Self {
        Self {
            proc_name: Some(proc_name.into()),
            proc_id: None,
            params: Vec::new(),
        }
    }

    /// Call a well-known procedure by ID.
    #[must_use]
    pub fn by_id(proc_id: ProcId) -> Self {
        Self {
            proc_name: None,
            proc_id: Some(proc_id),
            params: Vec::new(),
        }
    }

    /// Build an sp_executesql request for parameterized SQL.
    #[must_use]
    pub fn execute_sql(sql: &str, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::ExecuteSql);
        request.params.push(RpcParam::nvarchar("", sql));
        if !params.is_empty() {
            let declarations = Self::declarations(&params);
            request.params.push(RpcParam::nvarchar("", declarations));
        }
        request.params.extend(params);
        request
    }

    /// Build an sp_prepare request; the handle comes back as an output param.
    #[must_use]
    pub fn prepare(sql: &str, params: &[RpcParam]) -> Self {
        let mut request = Self::by_id(ProcId::Prepare);
        request
            .params
            .push(RpcParam::null_int("@handle").as_output());
        request
            .params
            .push(RpcParam::nvarchar("@params", Self::declarations(params)));
        request.params.push(RpcParam::nvarchar("@stmt", sql));
        request.params.push(RpcParam::int("@options", 1));
        request
    }

    /// Build an sp_execute request for a prepared handle.
    #[must_use]
    pub fn execute(handle: i32, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::Execute);
        request.params.push(RpcParam::int("@handle", handle));
        request.params.extend(params);
        request
    }

    /// Build an sp_unprepare request releasing a prepared handle.
    #[must_use]
    pub fn unprepare(handle: i32) -> Self {
        let mut request = Self::by_id(ProcId::Unprepare);
        request.params.push(RpcParam::int("@handle", handle));
        request
    }

    /// Add a parameter.
    #[must_use]
    pub fn param(mut self, param: RpcParam) -> Self {
        self.params.push(param);
        self
    }

    fn declarations(params: &[RpcParam]) -> String {
        params
            .iter()
            .map(RpcParam::declaration)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Encode the request scoped to the given transaction descriptor.
    #[must_use]
    pub fn encode(&self, transaction_descriptor: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        write_all_headers(&mut buf, transaction_descriptor);

        if let Some(proc_id) = self.proc_id {
            buf.put_u16_le(0xFFFF); // PROCID marker
            buf.put_u16_le(proc_id as u16);
        } else if let Some(ref name) = self.proc_name {
            buf.put_u16_le(name.encode_utf16().count() as u16);
            write_utf16_string(&mut buf, name);
        }

        buf.put_u16_le(0); // option flags

        for param in &self.params {
            param.encode(&mut buf);
        }

        buf.freeze()
    }
}
