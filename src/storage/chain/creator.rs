use smallvec::SmallVec;
use tracing::debug;

use crate::storage::record::{Direction, NodeChain, PrevLink, RelationshipGroupRecord};
use crate::types::{GroupId, NodeId, RelId, Result, SombraError, TypeId};

use super::{get_or_create_group, ChainAccess};

/// Inserts relationships at the head of their endpoints' chains.
#[derive(Copy, Clone, Debug)]
pub struct RelationshipCreator {
    dense_threshold: u64,
    external_degrees_threshold: u64,
}

impl RelationshipCreator {
    /// Creator promoting nodes to dense at `dense_threshold` relationships and
    /// moving group degrees out of the chain at `external_degrees_threshold`.
    pub fn new(dense_threshold: u64, external_degrees_threshold: u64) -> Self {
        Self {
            dense_threshold,
            external_degrees_threshold,
        }
    }

    /// Relationship count at which a node turns dense.
    pub fn dense_threshold(&self) -> u64 {
        self.dense_threshold
    }

    /// Creates relationship `id` of type `ty` from `first` to `second`.
    ///
    /// Returns the endpoints that were promoted to dense on the way.
    pub fn relationship_create(
        &self,
        access: &mut ChainAccess<'_>,
        id: RelId,
        ty: TypeId,
        first: NodeId,
        second: NodeId,
    ) -> Result<SmallVec<[NodeId; 2]>> {
        access.changes.nodes.get_or_load(first, ())?;
        access.changes.nodes.get_or_load(second, ())?;

        let mut promoted = SmallVec::new();
        if self.convert_node_to_dense_if_necessary(access, first)? {
            promoted.push(first);
        }
        if second != first && self.convert_node_to_dense_if_necessary(access, second)? {
            promoted.push(second);
        }

        {
            let mut proxy = access.changes.relationships.create(id, ())?;
            proxy.for_changing_data().initialize(first, second, ty);
        }
        self.connect_to_node(access, first, id, ty)?;
        if second != first {
            self.connect_to_node(access, second, id, ty)?;
        }
        Ok(promoted)
    }

    fn connect_to_node(
        &self,
        access: &mut ChainAccess<'_>,
        node: NodeId,
        id: RelId,
        ty: TypeId,
    ) -> Result<()> {
        let chain = access
            .changes
            .nodes
            .get_or_load(node, ())?
            .for_reading_linkage()
            .chain;
        match chain {
            NodeChain::Sparse(head) => {
                connect(access, node, head, id)?;
                access.changes.nodes.get_or_load(node, ())?.for_changing_data().chain =
                    NodeChain::Sparse(Some(id));
                Ok(())
            }
            NodeChain::Dense(_) => {
                let direction = match access.changes.relationships.peek(id) {
                    Some(rel) => rel.direction_for(node),
                    None => return Err(SombraError::Invalid("relationship is not staged")),
                };
                self.connect_to_dense_node(access, node, id, ty, direction)
            }
        }
    }

    fn connect_to_dense_node(
        &self,
        access: &mut ChainAccess<'_>,
        node: NodeId,
        id: RelId,
        ty: TypeId,
        direction: Direction,
    ) -> Result<()> {
        let group_id = get_or_create_group(node, ty, access.changes, access.group_ids)?;
        let head = access
            .changes
            .groups
            .get_or_load(group_id, ())?
            .for_reading_linkage()
            .head(direction);
        let degree = connect(access, node, head, id)?;
        let mut proxy = access.changes.groups.get_or_load(group_id, ())?;
        let group = proxy.for_changing_data();
        group.set_head(direction, Some(id));
        self.track_external_degree(access.degrees, group_id, group, direction, degree);
        Ok(())
    }

    fn track_external_degree(
        &self,
        degrees: &mut dyn super::DegreeUpdater,
        group_id: GroupId,
        group: &mut RelationshipGroupRecord,
        direction: Direction,
        degree: u64,
    ) {
        if group.has_external_degrees(direction) {
            degrees.increment(group_id, direction, 1);
        } else if degree >= self.external_degrees_threshold {
            group.set_external_degrees(direction);
            degrees.increment(group_id, direction, degree as i64);
            debug!(
                group = group_id.0,
                %direction,
                degree,
                "chain.group.external_degrees"
            );
        }
    }

    /// Promotes a sparse node whose chain holds at least the dense threshold.
    ///
    /// Every relationship of the old chain is relinked into the sub-chain for
    /// its type and direction. Records keep their ids.
    fn convert_node_to_dense_if_necessary(
        &self,
        access: &mut ChainAccess<'_>,
        node: NodeId,
    ) -> Result<bool> {
        let head = match access
            .changes
            .nodes
            .get_or_load(node, ())?
            .for_reading_linkage()
            .chain
        {
            NodeChain::Sparse(Some(head)) => head,
            _ => return Ok(false),
        };
        let degree = head_degree(access, node, head)?;
        if degree < self.dense_threshold {
            return Ok(false);
        }

        access.changes.nodes.get_or_load(node, ())?.for_changing_data().chain =
            NodeChain::Dense(None);
        let mut cursor = Some(head);
        let mut moved = 0u64;
        while let Some(rel_id) = cursor {
            let (ty, direction, next) = {
                let proxy = access.changes.relationships.get_or_load(rel_id, ())?;
                let rel = proxy.for_reading_linkage();
                (rel.ty, rel.direction_for(node), rel.next_for(node))
            };
            self.connect_to_dense_node(access, node, rel_id, ty, direction)?;
            moved += 1;
            cursor = next;
        }
        if moved != degree {
            return Err(SombraError::integrity(
                "chain-degree",
                format!("node {node} chain head says {degree} relationships, walked {moved}"),
            ));
        }
        debug!(node = node.0, degree, "chain.node.promoted");
        Ok(true)
    }
}

/// Degree carried by the head `head` of `node`'s chain.
fn head_degree(access: &mut ChainAccess<'_>, node: NodeId, head: RelId) -> Result<u64> {
    let proxy = access.changes.relationships.get_or_load(head, ())?;
    let rel = proxy.for_reading_linkage();
    let end = rel.end_for(node).ok_or_else(|| {
        SombraError::integrity(
            "chain-membership",
            format!("relationship {head} heads the chain of node {node} but does not touch it"),
        )
    })?;
    match rel.prev(end) {
        PrevLink::Degree(degree) => Ok(degree),
        PrevLink::Rel(prev) => Err(SombraError::integrity(
            "chain-head",
            format!(
                "relationship {head} heads the {} chain of node {node} but has prev {prev}",
                end.name()
            ),
        )),
    }
}

/// Links `id` in front of `head` in `node`'s chain, moving the degree
/// counter onto `id`. Returns the new degree.
fn connect(
    access: &mut ChainAccess<'_>,
    node: NodeId,
    head: Option<RelId>,
    id: RelId,
) -> Result<u64> {
    let degree = match head {
        Some(head) => {
            let degree = head_degree(access, node, head)?;
            let mut proxy = access.changes.relationships.get_or_load(head, ())?;
            let old_head = proxy.for_changing_data();
            for end in old_head.ends_for(node) {
                old_head.set_prev(end, PrevLink::Rel(id));
            }
            degree
        }
        None => 0,
    };
    let mut proxy = access.changes.relationships.get_or_load(id, ())?;
    let rel = proxy.for_changing_data();
    for end in rel.ends_for(node) {
        rel.set_prev(end, PrevLink::Degree(degree + 1));
        rel.set_next(end, head);
    }
    Ok(degree + 1)
}
