use tracing::trace;

use crate::storage::record::{
    ChainEnd, NodeChain, PrevLink, PropertyOwner, PropertyRecord, RelationshipRecord,
};
use crate::storage::staging::RecordChanges;
use crate::types::{NodeId, PropId, RelId, Result, SombraError};

use super::{find_group, ChainAccess};

/// Clears the property chain of a deleted entity.
pub trait PropertyDeleter: Send + Sync {
    /// Marks the chain starting at `first` and every value record it owns unused.
    fn delete_property_chain(
        &self,
        first: Option<PropId>,
        owner: PropertyOwner,
        properties: &mut RecordChanges<PropertyRecord, PropertyOwner>,
    ) -> Result<()>;
}

/// Walks the chain marking every property record and its value records
/// unused.
#[derive(Copy, Clone, Debug, Default)]
pub struct PropertyChainDeleter;

impl PropertyDeleter for PropertyChainDeleter {
    fn delete_property_chain(
        &self,
        first: Option<PropId>,
        owner: PropertyOwner,
        properties: &mut RecordChanges<PropertyRecord, PropertyOwner>,
    ) -> Result<()> {
        let mut cursor = first;
        while let Some(id) = cursor {
            let mut proxy = properties.get_or_load(id, owner)?;
            let record = proxy.for_changing_data();
            cursor = record.next_prop;
            let keys: Vec<_> = record.blocks.iter().map(|b| b.key).collect();
            for key in keys {
                record.remove_block(key);
            }
            record.in_use = false;
        }
        Ok(())
    }
}

/// Unlinks relationships from both endpoints' chains.
pub struct RelationshipDeleter {
    properties: Box<dyn PropertyDeleter>,
}

impl Default for RelationshipDeleter {
    fn default() -> Self {
        Self::new(Box::new(PropertyChainDeleter))
    }
}

impl RelationshipDeleter {
    /// Deleter clearing properties through `properties`.
    pub fn new(properties: Box<dyn PropertyDeleter>) -> Self {
        Self { properties }
    }

    /// Deletes relationship `id`, its properties and its chain membership.
    pub fn relationship_delete(&self, access: &mut ChainAccess<'_>, id: RelId) -> Result<()> {
        let rel = access
            .changes
            .relationships
            .get_or_load(id, ())?
            .for_reading_data()
            .clone();
        self.properties.delete_property_chain(
            rel.next_prop,
            PropertyOwner::Relationship(id),
            &mut access.changes.properties,
        )?;

        disconnect(access, &rel, ChainEnd::First)?;
        if !rel.is_loop() {
            disconnect(access, &rel, ChainEnd::Second)?;
        }
        update_node(access, &rel, ChainEnd::First)?;
        if !rel.is_loop() {
            update_node(access, &rel, ChainEnd::Second)?;
        }

        let mut proxy = access.changes.relationships.get_or_load(id, ())?;
        let record = proxy.for_changing_data();
        record.in_use = false;
        record.next_prop = None;
        trace!(rel = id.0, "chain.relationship.deleted");
        Ok(())
    }
}

/// Links the neighbours of `rel` in `end`'s chain to each other.
fn disconnect(access: &mut ChainAccess<'_>, rel: &RelationshipRecord, end: ChainEnd) -> Result<()> {
    let node = rel.node(end);
    let prev = rel.prev(end);
    let next = rel.next(end);
    if let PrevLink::Rel(prev_id) = prev {
        let mut proxy = access.changes.relationships.get_or_load(prev_id, ())?;
        let neighbour = proxy.for_changing_data();
        let ends = neighbour_ends(neighbour, node, rel.id)?;
        for neighbour_end in ends {
            neighbour.set_next(neighbour_end, next);
        }
    }
    if let Some(next_id) = next {
        let mut proxy = access.changes.relationships.get_or_load(next_id, ())?;
        let neighbour = proxy.for_changing_data();
        let ends = neighbour_ends(neighbour, node, rel.id)?;
        for neighbour_end in ends {
            neighbour.set_prev(neighbour_end, prev);
        }
    }
    Ok(())
}

fn neighbour_ends(
    neighbour: &RelationshipRecord,
    node: NodeId,
    rel: RelId,
) -> Result<smallvec::SmallVec<[ChainEnd; 2]>> {
    let ends = neighbour.ends_for(node);
    if ends.is_empty() {
        return Err(SombraError::integrity(
            "chain-membership",
            format!(
                "relationship {} is linked next to {rel} in the chain of node {node} but is between other nodes",
                neighbour.id
            ),
        ));
    }
    Ok(ends)
}

/// Moves the chain head off `rel` when it was first, then decrements the
/// degree on whatever heads the chain afterwards.
fn update_node(access: &mut ChainAccess<'_>, rel: &RelationshipRecord, end: ChainEnd) -> Result<()> {
    let node = rel.node(end);
    let was_first = rel.prev(end).is_first_in_chain();
    let next = rel.next(end);
    let chain = access
        .changes
        .nodes
        .get_or_load(node, ())?
        .for_reading_linkage()
        .chain;
    let head = match chain {
        NodeChain::Sparse(head) => {
            if !was_first {
                head
            } else if head == Some(rel.id) {
                access.changes.nodes.get_or_load(node, ())?.for_changing_data().chain =
                    NodeChain::Sparse(next);
                next
            } else {
                return Err(SombraError::integrity(
                    "chain-head",
                    format!(
                        "relationship {} claims to head the chain of node {node} which starts at {:?}",
                        rel.id, head
                    ),
                ));
            }
        }
        NodeChain::Dense(first_group) => {
            let position = find_group(node, first_group, rel.ty, &mut access.changes.groups)?;
            let group_id = position.group.ok_or_else(|| {
                SombraError::integrity(
                    "group-missing",
                    format!(
                        "dense node {node} has no group for type {} of relationship {}",
                        rel.ty, rel.id
                    ),
                )
            })?;
            let direction = rel.direction_for(node);
            let mut proxy = access.changes.groups.get_or_load(group_id, ())?;
            let head = if was_first {
                let current = proxy.for_reading_linkage().head(direction);
                if current != Some(rel.id) {
                    return Err(SombraError::integrity(
                        "chain-head",
                        format!(
                            "relationship {} claims to head the {direction} chain of group {group_id} (node {node}) which starts at {:?}",
                            rel.id, current
                        ),
                    ));
                }
                let group = proxy.for_changing_data();
                group.set_head(direction, next);
                next
            } else {
                proxy.for_reading_linkage().head(direction)
            };
            if proxy.for_reading_linkage().has_external_degrees(direction) {
                access.degrees.increment(group_id, direction, -1);
            }
            head
        }
    };
    decrement_degree(access, rel, end, head)
}

fn decrement_degree(
    access: &mut ChainAccess<'_>,
    rel: &RelationshipRecord,
    end: ChainEnd,
    head: Option<RelId>,
) -> Result<()> {
    let Some(head) = head else {
        return Ok(());
    };
    let node = rel.node(end);
    let mut proxy = access.changes.relationships.get_or_load(head, ())?;
    let record = proxy.for_changing_data();
    let ends = record.ends_for(node);
    let Some(&head_end) = ends.first() else {
        return Err(SombraError::integrity(
            "chain-membership",
            format!("chain head {head} of node {node} is a relationship between other nodes"),
        ));
    };
    let current = match (rel.prev(end), record.prev(head_end)) {
        (PrevLink::Degree(degree), _) => degree,
        (PrevLink::Rel(_), PrevLink::Degree(degree)) => degree,
        (PrevLink::Rel(_), PrevLink::Rel(prev)) => {
            return Err(SombraError::integrity(
                "chain-head",
                format!("chain head {head} of node {node} has prev {prev} instead of a degree"),
            ))
        }
    };
    let degree = current.checked_sub(1).ok_or_else(|| {
        SombraError::integrity(
            "chain-degree",
            format!("chain of node {node} headed by {head} has degree zero"),
        )
    })?;
    for head_end in ends {
        record.set_prev(head_end, PrevLink::Degree(degree));
    }
    Ok(())
}
