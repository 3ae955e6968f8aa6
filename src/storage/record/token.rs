use std::fmt;

use crate::types::{DynId, RecordKind, TokenId};

use super::DynamicRecord;

/// Token namespaces.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TokenKind {
    /// Node labels.
    Label,
    /// Relationship types.
    RelationshipType,
    /// Property keys.
    PropertyKey,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Label => f.write_str("label"),
            TokenKind::RelationshipType => f.write_str("relationship type"),
            TokenKind::PropertyKey => f.write_str("property key"),
        }
    }
}

/// Named token; the name lives in dynamic records.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenRecord {
    /// Record id.
    pub id: TokenId,
    /// Whether the token exists.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Reserved for engine use.
    pub internal: bool,
    /// First name record.
    pub name_id: Option<DynId>,
    /// Name bytes split into dynamic records.
    pub name_records: Vec<DynamicRecord>,
}

impl TokenRecord {
    /// A blank, unused token.
    pub fn unused(id: TokenId) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            internal: false,
            name_id: None,
            name_records: Vec::new(),
        }
    }
}

impl_record!(TokenRecord, TokenId, RecordKind::Token);
