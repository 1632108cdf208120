//! Column data type identifiers.

use crate::error::ProtocolError;

/// TDS column data type identifier as found in COLMETADATA.
///
/// The decoder groups these into length families (fixed, byte-length,
/// ushort-length) when reading row values; it does not interpret the value
/// bytes themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// NULL type.
    Null = 0x1F,
    /// 1-byte integer (TINYINT).
    Int1 = 0x30,
    /// Bit.
    Bit = 0x32,
    /// 2-byte integer (SMALLINT).
    Int2 = 0x34,
    /// 4-byte integer (INT).
    Int4 = 0x38,
    /// 8-byte integer (BIGINT).
    Int8 = 0x7F,
    /// 4-byte float (REAL).
    Float4 = 0x3B,
    /// 8-byte float (FLOAT).
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte smalldatetime.
    DateTime4 = 0x3A,
    /// GUID (UNIQUEIDENTIFIER).
    Guid = 0x24,
    /// Variable-length integer.
    IntN = 0x26,
    /// Variable-length bit.
    BitN = 0x68,
    /// Variable-length decimal.
    DecimalN = 0x6A,
    /// Variable-length numeric.
    NumericN = 0x6C,
    /// Variable-length float.
    FloatN = 0x6D,
    /// Variable-length money.
    MoneyN = 0x6E,
    /// Variable-length datetime.
    DateTimeN = 0x6F,
    /// Legacy fixed char (byte length).
    Char = 0x2F,
    /// Legacy varchar (byte length).
    VarChar = 0x27,
    /// Legacy binary (byte length).
    Binary = 0x2D,
    /// Legacy varbinary (byte length).
    VarBinary = 0x25,
    /// VARCHAR with 2-byte length.
    BigVarChar = 0xA7,
    /// VARBINARY with 2-byte length.
    BigVarBinary = 0xA5,
    /// CHAR with 2-byte length.
    BigChar = 0xAF,
    /// BINARY with 2-byte length.
    BigBinary = 0xAD,
    /// NCHAR.
    NChar = 0xEF,
    /// NVARCHAR.
    NVarChar = 0xE7,
    /// DATE (3-byte).
    Date = 0x28,
    /// TIME with scale.
    Time = 0x29,
    /// DATETIME2 with scale.
    DateTime2 = 0x2A,
    /// DATETIMEOFFSET with scale.
    DateTimeOffset = 0x2B,
}

impl TypeId {
    /// Create a type id from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x1F => Ok(Self::Null),
            0x30 => Ok(Self::Int1),
            0x32 => Ok(Self::Bit),
            0x34 => Ok(Self::Int2),
            0x38 => Ok(Self::Int4),
            0x7F => Ok(Self::Int8),
            0x3B => Ok(Self::Float4),
            0x3E => Ok(Self::Float8),
            0x3C => Ok(Self::Money),
            0x7A => Ok(Self::Money4),
            0x3D => Ok(Self::DateTime),
            0x3A => Ok(Self::DateTime4),
            0x24 => Ok(Self::Guid),
            0x26 => Ok(Self::IntN),
            0x68 => Ok(Self::BitN),
            0x6A => Ok(Self::DecimalN),
            0x6C => Ok(Self::NumericN),
            0x6D => Ok(Self::FloatN),
            0x6E => Ok(Self::MoneyN),
            0x6F => Ok(Self::DateTimeN),
            0x2F => Ok(Self::Char),
            0x27 => Ok(Self::VarChar),
            0x2D => Ok(Self::Binary),
            0x25 => Ok(Self::VarBinary),
            0xA7 => Ok(Self::BigVarChar),
            0xA5 => Ok(Self::BigVarBinary),
            0xAF => Ok(Self::BigChar),
            0xAD => Ok(Self::BigBinary),
            0xEF => Ok(Self::NChar),
            0xE7 => Ok(Self::NVarChar),
            0x28 => Ok(Self::Date),
            0x29 => Ok(Self::Time),
            0x2A => Ok(Self::DateTime2),
            0x2B => Ok(Self::DateTimeOffset),
            other => Err(ProtocolError::UnsupportedColumnType(other)),
        }
    }

    /// Size in bytes of a fixed-length type, if this is one.
    #[must_use]
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::Int1 | Self::Bit => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => Some(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => Some(8),
            _ => None,
        }
    }

    /// Whether the value is prefixed with a 1-byte length (0 means NULL).
    #[must_use]
    pub const fn is_byte_length(self) -> bool {
        matches!(
            self,
            Self::Guid
                | Self::IntN
                | Self::BitN
                | Self::DecimalN
                | Self::NumericN
                | Self::FloatN
                | Self::MoneyN
                | Self::DateTimeN
                | Self::Char
                | Self::VarChar
                | Self::Binary
                | Self::VarBinary
                | Self::Date
                | Self::Time
                | Self::DateTime2
                | Self::DateTimeOffset
        )
    }

    /// Whether the value is prefixed with a 2-byte length (0xFFFF means NULL).
    #[must_use]
    pub const fn is_ushort_length(self) -> bool {
        matches!(
            self,
            Self::BigVarChar
                | Self::BigVarBinary
                | Self::BigChar
                | Self::BigBinary
                | Self::NChar
                | Self::NVarChar
        )
    }

    /// Whether COLMETADATA carries a 5-byte collation for this type.
    #[must_use]
    pub const fn has_collation(self) -> bool {
        matches!(
            self,
            Self::BigVarChar | Self::BigChar | Self::NChar | Self::NVarChar
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_families() {
        assert_eq!(TypeId::Int4.fixed_size(), Some(4));
        assert!(TypeId::IntN.is_byte_length());
        assert!(TypeId::NVarChar.is_ushort_length());
        assert!(TypeId::NVarChar.has_collation());
        assert!(!TypeId::BigVarBinary.has_collation());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(TypeId::from_u8(0xF1).is_err());
    }
}
