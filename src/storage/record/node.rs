use crate::types::{GroupId, LabelId, NodeId, PropId, RecordKind, RelId};

use super::{DynamicRecord, SecondaryUnit};

/// Labels kept inline before spilling into dynamic label records.
pub const INLINE_LABEL_CAPACITY: usize = 4;

/// Entry point of a node's relationships.
///
/// Sparse nodes point straight at the head of one mixed relationship chain.
/// Dense nodes point at the first record of a group chain sorted by type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeChain {
    /// Head of the relationship chain.
    Sparse(Option<RelId>),
    /// First group record.
    Dense(Option<GroupId>),
}

/// A node: its relationship entry point, properties and labels.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeRecord {
    /// Record id.
    pub id: NodeId,
    /// Whether the record holds a live node.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Where the relationships start.
    pub chain: NodeChain,
    /// First record of the property chain.
    pub next_prop: Option<PropId>,
    /// Label ids, sorted ascending.
    pub labels: Vec<LabelId>,
    /// Overflow encoding of `labels` once they outgrow the inline field.
    pub dynamic_labels: Vec<DynamicRecord>,
    /// Continuation unit.
    pub secondary: SecondaryUnit,
}

impl NodeRecord {
    /// A blank, unused node.
    pub fn unused(id: NodeId) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            chain: NodeChain::Sparse(None),
            next_prop: None,
            labels: Vec::new(),
            dynamic_labels: Vec::new(),
            secondary: SecondaryUnit::default(),
        }
    }

    /// True when the node keeps its relationships in groups.
    pub fn is_dense(&self) -> bool {
        matches!(self.chain, NodeChain::Dense(_))
    }

    /// Head of the sparse chain; `None` for dense nodes too.
    pub fn sparse_head(&self) -> Option<RelId> {
        match self.chain {
            NodeChain::Sparse(head) => head,
            NodeChain::Dense(_) => None,
        }
    }

    /// First group of a dense node.
    pub fn first_group(&self) -> Option<GroupId> {
        match self.chain {
            NodeChain::Dense(group) => group,
            NodeChain::Sparse(_) => None,
        }
    }

    /// Raw value of the first-relationship field, rel or group id.
    pub fn next_rel_raw(&self) -> Option<u64> {
        match self.chain {
            NodeChain::Sparse(head) => head.map(|id| id.0),
            NodeChain::Dense(group) => group.map(|id| id.0),
        }
    }

    /// True when no relationship is reachable from the node field itself.
    pub fn has_no_chain(&self) -> bool {
        self.next_rel_raw().is_none()
    }

    /// True while the labels fit the inline field.
    pub fn labels_inline(&self) -> bool {
        self.dynamic_labels.is_empty()
    }
}

impl_record!(NodeRecord, NodeId, RecordKind::Node, secondary);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_accessors_follow_density() {
        let mut node = NodeRecord::unused(NodeId(1));
        assert!(!node.is_dense());
        node.chain = NodeChain::Sparse(Some(RelId(4)));
        assert_eq!(node.sparse_head(), Some(RelId(4)));
        assert_eq!(node.next_rel_raw(), Some(4));
        node.chain = NodeChain::Dense(Some(GroupId(9)));
        assert!(node.is_dense());
        assert_eq!(node.sparse_head(), None);
        assert_eq!(node.first_group(), Some(GroupId(9)));
    }
}
