#![forbid(unsafe_code)]
//! Identifier newtypes and the shared error type.

use std::fmt;
use std::hash::Hash;

/// Raw value persisted for an absent reference.
pub const NULL_REFERENCE: u64 = u64::MAX;

/// Common behaviour of record identifiers.
///
/// Every record store is addressed by a 64-bit id space; token ids are
/// narrower and widen into it.
pub trait RecordId:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Builds an id from its raw store address.
    fn from_raw(raw: u64) -> Self;
    /// Returns the raw store address.
    fn raw(self) -> u64;
}

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
        pub struct $name(pub $repr);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                $name(value)
            }
        }

        impl From<$name> for $repr {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl RecordId for $name {
            fn from_raw(raw: u64) -> Self {
                $name(raw as $repr)
            }

            fn raw(self) -> u64 {
                self.0 as u64
            }
        }
    };
}

record_id!(
    /// Node record id.
    NodeId,
    u64
);
record_id!(
    /// Relationship record id.
    RelId,
    u64
);
record_id!(
    /// Relationship group record id.
    GroupId,
    u64
);
record_id!(
    /// Property record id.
    PropId,
    u64
);
record_id!(
    /// Dynamic (overflow) record id.
    DynId,
    u64
);
record_id!(
    /// Schema record id.
    SchemaId,
    u64
);
record_id!(
    /// Metadata record id (field position).
    MetaId,
    u64
);
record_id!(
    /// Token record id shared by labels, relationship types and property keys.
    TokenId,
    u32
);
record_id!(
    /// Relationship type id.
    TypeId,
    u32
);
record_id!(
    /// Label id.
    LabelId,
    u32
);
record_id!(
    /// Property key id.
    PropKeyId,
    u32
);
record_id!(
    /// Transaction id.
    TxId,
    u64
);

/// Kind of record a store holds, used in error messages and logs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RecordKind {
    /// Node records.
    Node,
    /// Relationship records.
    Relationship,
    /// Relationship group records.
    RelationshipGroup,
    /// Property records.
    Property,
    /// Label, relationship type and property key tokens.
    Token,
    /// Schema records.
    Schema,
    /// Metadata records.
    MetaData,
    /// Dynamic overflow records.
    Dynamic,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Node => "node",
            RecordKind::Relationship => "relationship",
            RecordKind::RelationshipGroup => "relationship group",
            RecordKind::Property => "property",
            RecordKind::Token => "token",
            RecordKind::Schema => "schema",
            RecordKind::MetaData => "metadata",
            RecordKind::Dynamic => "dynamic",
        };
        f.write_str(name)
    }
}

/// Errors raised by the storage engine and its parts.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Underlying file operation failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Stored or logged bytes do not decode.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Stored or logged bytes do not decode, with details.
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    /// Caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller passed an argument the operation cannot accept, with details.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A record that must be in use is not.
    #[error("{kind} record {id} is not in use")]
    MissingRecord {
        /// Store the record was looked up in.
        kind: RecordKind,
        /// Raw id of the record.
        id: u64,
    },
    /// Relationship chains or groups are not linked the way they must be.
    #[error("structural integrity violation [{invariant}]: {detail}")]
    Integrity {
        /// Short name of the broken rule.
        invariant: &'static str,
        /// Records involved.
        detail: String,
    },
    /// Relationship locks were requested out of id order.
    #[error("lock ordering violation: {0}")]
    LockOrder(String),
    /// Waiting for a lock would wait on the caller's own locks.
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    /// Input ended inside a value.
    #[error("truncated data: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the value needed.
        needed: usize,
        /// Bytes that were left.
        available: usize,
    },
    /// The engine stopped accepting work after a failure.
    #[error("storage engine unavailable: {0}")]
    Unavailable(String),
}

impl SombraError {
    /// Builds a structural integrity error.
    pub fn integrity(invariant: &'static str, detail: impl Into<String>) -> Self {
        SombraError::Integrity {
            invariant,
            detail: detail.into(),
        }
    }

    /// True when the error signals input that ended mid-record.
    pub fn is_truncation(&self) -> bool {
        matches!(self, SombraError::Truncated { .. })
    }

    /// True when the failure leaves the stores in an unknown state.
    pub fn is_fatal_to_engine(&self) -> bool {
        matches!(
            self,
            SombraError::Io(_) | SombraError::Corruption(_) | SombraError::CorruptionOwned(_)
        )
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, SombraError>;

/// Encodes an optional id as its raw persisted value.
pub fn raw_or_null<I: RecordId>(id: Option<I>) -> u64 {
    id.map_or(NULL_REFERENCE, RecordId::raw)
}

/// Decodes a raw persisted value into an optional id.
pub fn id_or_none<I: RecordId>(raw: u64) -> Option<I> {
    if raw == NULL_REFERENCE {
        None
    } else {
        Some(I::from_raw(raw))
    }
}
