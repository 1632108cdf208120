//! Transaction support.

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (dirty reads allowed).
    ReadUncommitted,
    /// Read committed, the server default.
    #[default]
    ReadCommitted,
    /// Repeatable read.
    RepeatableRead,
    /// Serializable.
    Serializable,
    /// Snapshot (row versioning).
    Snapshot,
}

impl IsolationLevel {
    /// Wire byte used in TRANSACTION_MANAGER begin requests.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::ReadUncommitted => 1,
            Self::ReadCommitted => 2,
            Self::RepeatableRead => 3,
            Self::Serializable => 4,
            Self::Snapshot => 5,
        }
    }

    /// The level's SQL spelling.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "read uncommitted",
            Self::ReadCommitted => "read committed",
            Self::RepeatableRead => "repeatable read",
            Self::Serializable => "serializable",
            Self::Snapshot => "snapshot",
        }
    }
}

/// A pending explicit transaction.
///
/// Pushed when the caller begins a transaction, popped when it is committed
/// or rolled back. The server-issued descriptors live on their own stack in
/// the connection; this list only tracks what the caller opened.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Transaction name, possibly empty.
    pub name: String,
    /// Requested isolation level.
    pub isolation: IsolationLevel,
}

impl Transaction {
    /// Create a transaction record.
    pub fn new(name: impl Into<String>, isolation: IsolationLevel) -> Self {
        Self {
            name: name.into(),
            isolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bytes() {
        assert_eq!(IsolationLevel::ReadUncommitted.to_wire(), 1);
        assert_eq!(IsolationLevel::ReadCommitted.to_wire(), 2);
        assert_eq!(IsolationLevel::Snapshot.to_wire(), 5);
    }

    #[test]
    fn sql_spelling() {
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "read committed");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "serializable");
    }
}
