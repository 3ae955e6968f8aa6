//! Relationship chain maintenance.
//!
//! Sparse nodes keep every relationship in one doubly-linked chain hanging
//! off the node record. Dense nodes keep one group record per relationship
//! type, each with an outgoing, incoming and loop sub-chain. The head of any
//! chain stores the chain length in its `prev` slot.

use std::collections::BTreeMap;

use crate::storage::record::Direction;
use crate::storage::staging::RecordChangeSet;
use crate::storage::store::IdSequence;
use crate::types::GroupId;

mod creator;
mod deleter;
mod group_getter;
mod locking;
mod modifier;

pub use creator::RelationshipCreator;
pub use deleter::{PropertyChainDeleter, PropertyDeleter, RelationshipDeleter};
pub use group_getter::{find_group, get_or_create_group, GroupPosition};
pub use locking::{lock_relationships_in_order, LockCursor, SortedLockList};
pub use modifier::{
    ModifyOutcome, RelCreation, RelDeletion, RelationshipModifications, RelationshipModifier,
};

/// Receives degree changes of sub-chains whose degree is tracked outside
/// the group record.
pub trait DegreeUpdater {
    /// Adds `delta` to the degree of `group`'s `direction` sub-chain.
    fn increment(&mut self, group: GroupId, direction: Direction, delta: i64);
}

/// Accumulated group degree deltas of one transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DegreeDeltas {
    deltas: BTreeMap<(GroupId, Direction), i64>,
}

impl DegreeDeltas {
    /// Creates an empty delta set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated delta of one sub-chain, zero when untouched.
    pub fn get(&self, group: GroupId, direction: Direction) -> i64 {
        self.deltas.get(&(group, direction)).copied().unwrap_or(0)
    }

    /// Non-zero deltas in ascending (group, direction) order.
    pub fn iter(&self) -> impl Iterator<Item = (GroupId, Direction, i64)> + '_ {
        self.deltas
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|((group, direction), delta)| (*group, *direction, *delta))
    }

    /// True when every delta is zero.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Drops every delta.
    pub fn clear(&mut self) {
        self.deltas.clear();
    }
}

impl DegreeUpdater for DegreeDeltas {
    fn increment(&mut self, group: GroupId, direction: Direction, delta: i64) {
        *self.deltas.entry((group, direction)).or_insert(0) += delta;
    }
}

/// What the chain algorithms operate on: the transaction's staged records,
/// the id source for new groups and the external degree sink.
pub struct ChainAccess<'a> {
    /// Staged records of the transaction.
    pub changes: &'a mut RecordChangeSet,
    /// Source of new group ids.
    pub group_ids: &'a dyn IdSequence,
    /// Sink for externally tracked degrees.
    pub degrees: &'a mut dyn DegreeUpdater,
}

impl<'a> ChainAccess<'a> {
    /// Bundles the three collaborators.
    pub fn new(
        changes: &'a mut RecordChangeSet,
        group_ids: &'a dyn IdSequence,
        degrees: &'a mut dyn DegreeUpdater,
    ) -> Self {
        Self {
            changes,
            group_ids,
            degrees,
        }
    }
}
