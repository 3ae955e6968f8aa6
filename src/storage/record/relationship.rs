use smallvec::SmallVec;

use crate::types::{NodeId, PropId, RecordKind, RelId, TypeId, NULL_REFERENCE};

use super::{Direction, SecondaryUnit};

/// Content of a relationship's "previous" slot for one chain end.
///
/// The head of a chain has no predecessor; its slot holds the chain's degree
/// instead. Persisted as the raw value plus a first-in-chain flag bit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrevLink {
    /// Chain head carrying the number of relationships in the chain.
    Degree(u64),
    /// Predecessor in the chain.
    Rel(RelId),
}

impl PrevLink {
    /// True for a chain head.
    pub fn is_first_in_chain(self) -> bool {
        matches!(self, PrevLink::Degree(_))
    }

    /// Chain degree held by a head.
    pub fn degree(self) -> Option<u64> {
        match self {
            PrevLink::Degree(count) => Some(count),
            PrevLink::Rel(_) => None,
        }
    }

    /// Predecessor, when not the head.
    pub fn rel(self) -> Option<RelId> {
        match self {
            PrevLink::Rel(id) => Some(id),
            PrevLink::Degree(_) => None,
        }
    }

    /// Persisted form: `(raw value, first-in-chain flag)`.
    pub fn to_raw(self) -> (u64, bool) {
        match self {
            PrevLink::Degree(count) => (count, true),
            PrevLink::Rel(id) => (id.0, false),
        }
    }

    /// Reverses [`PrevLink::to_raw`].
    pub fn from_raw(raw: u64, first_in_chain: bool) -> Self {
        if first_in_chain {
            PrevLink::Degree(raw)
        } else {
            PrevLink::Rel(RelId(raw))
        }
    }
}

/// One of the two chain memberships of a relationship.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChainEnd {
    /// Membership in the first (source) node's chain.
    First,
    /// Membership in the second (target) node's chain.
    Second,
}

impl ChainEnd {
    /// Name used in messages: `source` or `target`.
    pub fn name(self) -> &'static str {
        match self {
            ChainEnd::First => "source",
            ChainEnd::Second => "target",
        }
    }
}

/// A relationship and its place in both endpoints' chains.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelationshipRecord {
    /// Record id.
    pub id: RelId,
    /// Whether the record holds a live relationship.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Source node.
    pub first_node: NodeId,
    /// Target node.
    pub second_node: NodeId,
    /// Relationship type.
    pub ty: TypeId,
    /// Previous slot in the source node's chain.
    pub first_prev: PrevLink,
    /// Next relationship in the source node's chain.
    pub first_next: Option<RelId>,
    /// Previous slot in the target node's chain.
    pub second_prev: PrevLink,
    /// Next relationship in the target node's chain.
    pub second_next: Option<RelId>,
    /// First record of the property chain.
    pub next_prop: Option<PropId>,
    /// Continuation unit.
    pub secondary: SecondaryUnit,
}

impl RelationshipRecord {
    /// A blank, unused relationship.
    pub fn unused(id: RelId) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            first_node: NodeId(NULL_REFERENCE),
            second_node: NodeId(NULL_REFERENCE),
            ty: TypeId(0),
            first_prev: PrevLink::Degree(1),
            first_next: None,
            second_prev: PrevLink::Degree(1),
            second_next: None,
            next_prop: None,
            secondary: SecondaryUnit::default(),
        }
    }

    /// Sets the identity fields of a fresh relationship, unlinked.
    pub fn initialize(&mut self, first: NodeId, second: NodeId, ty: TypeId) {
        self.in_use = true;
        self.first_node = first;
        self.second_node = second;
        self.ty = ty;
        self.first_prev = PrevLink::Degree(1);
        self.first_next = None;
        self.second_prev = PrevLink::Degree(1);
        self.second_next = None;
        self.next_prop = None;
    }

    /// True when both endpoints are the same node.
    pub fn is_loop(&self) -> bool {
        self.first_node == self.second_node
    }

    /// Endpoint owning `end`'s chain.
    pub fn node(&self, end: ChainEnd) -> NodeId {
        match end {
            ChainEnd::First => self.first_node,
            ChainEnd::Second => self.second_node,
        }
    }

    /// Previous slot of `end`'s chain.
    pub fn prev(&self, end: ChainEnd) -> PrevLink {
        match end {
            ChainEnd::First => self.first_prev,
            ChainEnd::Second => self.second_prev,
        }
    }

    /// Replaces the previous slot of `end`'s chain.
    pub fn set_prev(&mut self, end: ChainEnd, link: PrevLink) {
        match end {
            ChainEnd::First => self.first_prev = link,
            ChainEnd::Second => self.second_prev = link,
        }
    }

    /// Next relationship in `end`'s chain.
    pub fn next(&self, end: ChainEnd) -> Option<RelId> {
        match end {
            ChainEnd::First => self.first_next,
            ChainEnd::Second => self.second_next,
        }
    }

    /// Replaces the next link of `end`'s chain.
    pub fn set_next(&mut self, end: ChainEnd, next: Option<RelId>) {
        match end {
            ChainEnd::First => self.first_next = next,
            ChainEnd::Second => self.second_next = next,
        }
    }

    /// Chain ends this relationship has in `node`'s chain: both for a loop,
    /// one for a plain endpoint, none when `node` is not an endpoint.
    pub fn ends_for(&self, node: NodeId) -> SmallVec<[ChainEnd; 2]> {
        let mut ends = SmallVec::new();
        if self.first_node == node {
            ends.push(ChainEnd::First);
        }
        if self.second_node == node {
            ends.push(ChainEnd::Second);
        }
        ends
    }

    /// First chain end belonging to `node`.
    pub fn end_for(&self, node: NodeId) -> Option<ChainEnd> {
        if self.first_node == node {
            Some(ChainEnd::First)
        } else if self.second_node == node {
            Some(ChainEnd::Second)
        } else {
            None
        }
    }

    /// Successor in `node`'s chain.
    pub fn next_for(&self, node: NodeId) -> Option<RelId> {
        self.end_for(node).and_then(|end| self.next(end))
    }

    /// Direction of this relationship as seen from `node`.
    pub fn direction_for(&self, node: NodeId) -> Direction {
        if self.is_loop() {
            Direction::Loop
        } else if self.first_node == node {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }
}

impl_record!(RelationshipRecord, RelId, RecordKind::Relationship, secondary);
