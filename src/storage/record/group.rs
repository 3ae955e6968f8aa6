use std::fmt;

use crate::types::{GroupId, NodeId, RecordKind, RelId, TypeId, NULL_REFERENCE};

use super::SecondaryUnit;

/// Direction of a relationship relative to one of its endpoints.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Direction {
    /// The node is the source.
    Outgoing,
    /// The node is the target.
    Incoming,
    /// Both endpoints are the same node.
    Loop,
}

impl Direction {
    /// Every direction, in sub-chain order.
    pub const ALL: [Direction; 3] = [Direction::Outgoing, Direction::Incoming, Direction::Loop];

    /// Persisted tag.
    pub fn as_u8(self) -> u8 {
        match self {
            Direction::Outgoing => 0,
            Direction::Incoming => 1,
            Direction::Loop => 2,
        }
    }

    /// Reverses [`Direction::as_u8`].
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::Outgoing),
            1 => Some(Direction::Incoming),
            2 => Some(Direction::Loop),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outgoing => f.write_str("out"),
            Direction::Incoming => f.write_str("in"),
            Direction::Loop => f.write_str("loop"),
        }
    }
}

/// Per-type entry in a dense node's group chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelationshipGroupRecord {
    /// Record id.
    pub id: GroupId,
    /// Whether the record holds a live group.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Relationship type of every member.
    pub ty: TypeId,
    /// Dense node the group belongs to.
    pub owning_node: NodeId,
    /// Previous group of the node.
    pub prev: Option<GroupId>,
    /// Next group of the node, in ascending type order.
    pub next: Option<GroupId>,
    /// Head of the outgoing sub-chain.
    pub first_out: Option<RelId>,
    /// Head of the incoming sub-chain.
    pub first_in: Option<RelId>,
    /// Head of the loop sub-chain.
    pub first_loop: Option<RelId>,
    /// Outgoing degree is tracked outside the chain.
    pub external_degrees_out: bool,
    /// Incoming degree is tracked outside the chain.
    pub external_degrees_in: bool,
    /// Loop degree is tracked outside the chain.
    pub external_degrees_loop: bool,
    /// Continuation unit.
    pub secondary: SecondaryUnit,
}

impl RelationshipGroupRecord {
    /// A blank, unused group.
    pub fn unused(id: GroupId) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            ty: TypeId(0),
            owning_node: NodeId(NULL_REFERENCE),
            prev: None,
            next: None,
            first_out: None,
            first_in: None,
            first_loop: None,
            external_degrees_out: false,
            external_degrees_in: false,
            external_degrees_loop: false,
            secondary: SecondaryUnit::default(),
        }
    }

    /// Head of the `direction` sub-chain.
    pub fn head(&self, direction: Direction) -> Option<RelId> {
        match direction {
            Direction::Outgoing => self.first_out,
            Direction::Incoming => self.first_in,
            Direction::Loop => self.first_loop,
        }
    }

    /// Replaces the head of the `direction` sub-chain.
    pub fn set_head(&mut self, direction: Direction, head: Option<RelId>) {
        match direction {
            Direction::Outgoing => self.first_out = head,
            Direction::Incoming => self.first_in = head,
            Direction::Loop => self.first_loop = head,
        }
    }

    /// Whether the `direction` degree is tracked outside the chain.
    pub fn has_external_degrees(&self, direction: Direction) -> bool {
        match direction {
            Direction::Outgoing => self.external_degrees_out,
            Direction::Incoming => self.external_degrees_in,
            Direction::Loop => self.external_degrees_loop,
        }
    }

    /// Moves the `direction` degree outside the chain.
    pub fn set_external_degrees(&mut self, direction: Direction) {
        match direction {
            Direction::Outgoing => self.external_degrees_out = true,
            Direction::Incoming => self.external_degrees_in = true,
            Direction::Loop => self.external_degrees_loop = true,
        }
    }

    /// True when none of the three sub-chains has a head.
    pub fn is_empty(&self) -> bool {
        Direction::ALL.iter().all(|d| self.head(*d).is_none())
    }
}

impl_record!(
    RelationshipGroupRecord,
    GroupId,
    RecordKind::RelationshipGroup,
    secondary
);
