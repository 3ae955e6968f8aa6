use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::storage::record::{
    Direction, NodeChain, NodeRecord, PrevLink, RelationshipGroupRecord, RelationshipRecord,
};
use crate::storage::store::{CountsKey, RecordLoad, Stores};
use crate::types::{GroupId, NodeId, RelId, Result, TypeId};

const MAX_FINDINGS: usize = 32;

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Broken chain structure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }
}

/// Statistics collected while walking the chains.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// In-use node records.
    pub nodes_found: u64,
    /// Nodes whose relationships are split into groups.
    pub dense_nodes: u64,
    /// In-use relationship records.
    pub relationships_found: u64,
    /// In-use group records reached from a node.
    pub groups_found: u64,
    /// Chain links followed, counting each relationship once per chain.
    pub chain_entries: u64,
}

/// Complete report of a chain verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Whether verification passed without finding any issues.
    pub success: bool,
    /// Issues found, at most 32.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the records examined.
    pub counts: VerifyCounts,
}

/// Walks every relationship chain reachable from an in-use node.
///
/// Checks, per chain: back-pointers, that every member has the node as an
/// endpoint, that the head's degree matches the walked length and that no
/// member is unused. Group chains must be owned by their node, sorted by
/// strictly ascending type and doubly linked; members of a group sub-chain
/// must have the group's type and direction. Finally every in-use
/// relationship must appear in the chains of both of its endpoints.
///
/// Store read failures are returned as errors; structural problems become
/// findings.
pub fn verify_chains(stores: &Stores) -> Result<VerifyReport> {
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();
    let mut linked: HashSet<(u64, u64)> = HashSet::new();

    for raw in 0..stores.nodes.high_id() {
        let node = stores.nodes.get_record(NodeId(raw), RecordLoad::Always)?;
        if !node.in_use {
            continue;
        }
        counts.nodes_found += 1;
        match node.chain {
            NodeChain::Sparse(head) => {
                let mut walk = ChainWalk::new(node.id, None, &mut findings, &mut counts);
                walk.run(stores, head, &mut linked)?;
            }
            NodeChain::Dense(first) => {
                counts.dense_nodes += 1;
                check_groups(stores, &node, first, &mut findings, &mut counts, &mut linked)?;
            }
        }
        if findings.len() >= MAX_FINDINGS {
            break;
        }
    }

    if findings.len() < MAX_FINDINGS {
        for raw in 0..stores.relationships.high_id() {
            let rel = stores.relationships.get_record(RelId(raw), RecordLoad::Always)?;
            if !rel.in_use {
                continue;
            }
            counts.relationships_found += 1;
            for node in [rel.first_node, rel.second_node] {
                if !linked.contains(&(node.0, raw)) {
                    push_error(
                        &mut findings,
                        format!("relationship {raw} is missing from the chain of node {node}"),
                    );
                }
            }
            if findings.len() >= MAX_FINDINGS {
                break;
            }
        }
    }

    if findings.is_empty() {
        debug!(
            nodes = counts.nodes_found,
            relationships = counts.relationships_found,
            "verify.chains.ok"
        );
    } else {
        warn!(findings = findings.len(), "verify.chains.failed");
    }
    Ok(VerifyReport {
        success: findings.is_empty(),
        findings,
        counts,
    })
}

fn check_groups(
    stores: &Stores,
    node: &NodeRecord,
    first: Option<GroupId>,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
    linked: &mut HashSet<(u64, u64)>,
) -> Result<()> {
    let mut previous: Option<RelationshipGroupRecord> = None;
    let mut seen = HashSet::new();
    let mut cursor = first;
    while let Some(id) = cursor {
        if !seen.insert(id) {
            push_error(findings, format!("group chain of node {} loops at group {id}", node.id));
            break;
        }
        let group = stores.groups.get_record(id, RecordLoad::Always)?;
        if !group.in_use {
            push_error(findings, format!("node {} references unused group {id}", node.id));
            break;
        }
        counts.groups_found += 1;
        if group.owning_node != node.id {
            push_error(
                findings,
                format!(
                    "group {id} in the chain of node {} is owned by node {}",
                    node.id, group.owning_node
                ),
            );
        }
        if group.prev != previous.as_ref().map(|p| p.id) {
            push_error(
                findings,
                format!(
                    "group {id} of node {} links back to {:?}, expected {:?}",
                    node.id,
                    group.prev,
                    previous.as_ref().map(|p| p.id)
                ),
            );
        }
        if let Some(prev) = &previous {
            if prev.ty >= group.ty {
                push_error(
                    findings,
                    format!(
                        "groups of node {} out of order: type {} follows type {}",
                        node.id, group.ty, prev.ty
                    ),
                );
            }
        }
        for direction in Direction::ALL {
            let mut walk = ChainWalk::new(
                node.id,
                Some((group.ty, direction)),
                findings,
                counts,
            );
            let walked = walk.run(stores, group.head(direction), linked)?;
            if group.has_external_degrees(direction) {
                let key = CountsKey::GroupDegree {
                    group: id,
                    direction,
                };
                let external = stores.counts.get(&key);
                if external != walked as i64 {
                    push_error(
                        findings,
                        format!(
                            "group {id} {direction:?} external degree {external} but chain holds {walked}"
                        ),
                    );
                }
            }
        }
        if findings.len() >= MAX_FINDINGS {
            break;
        }
        cursor = group.next;
        previous = Some(group);
    }
    Ok(())
}

/// One walk over a sparse chain or a group sub-chain.
struct ChainWalk<'a> {
    node: NodeId,
    group: Option<(TypeId, Direction)>,
    findings: &'a mut Vec<VerifyFinding>,
    counts: &'a mut VerifyCounts,
}

impl<'a> ChainWalk<'a> {
    fn new(
        node: NodeId,
        group: Option<(TypeId, Direction)>,
        findings: &'a mut Vec<VerifyFinding>,
        counts: &'a mut VerifyCounts,
    ) -> Self {
        Self {
            node,
            group,
            findings,
            counts,
        }
    }

    fn chain_name(&self) -> String {
        match self.group {
            Some((ty, direction)) => format!("{direction:?} chain of type {ty} on node {}", self.node),
            None => format!("chain of node {}", self.node),
        }
    }

    /// Returns the number of relationships walked.
    fn run(
        &mut self,
        stores: &Stores,
        head: Option<RelId>,
        linked: &mut HashSet<(u64, u64)>,
    ) -> Result<u64> {
        let mut expected_degree = None;
        let mut previous: Option<RelId> = None;
        let mut walked = 0u64;
        let mut cursor = head;
        while let Some(id) = cursor {
            if !linked.insert((self.node.0, id.0)) {
                self.error(format!("{} reaches relationship {id} twice", self.chain_name()));
                return Ok(walked);
            }
            let rel = stores.relationships.get_record(id, RecordLoad::Always)?;
            if !rel.in_use {
                self.error(format!("{} references unused relationship {id}", self.chain_name()));
                return Ok(walked);
            }
            let Some(end) = rel.end_for(self.node) else {
                self.error(format!(
                    "{} contains relationship {id} between nodes {} and {}",
                    self.chain_name(),
                    rel.first_node,
                    rel.second_node
                ));
                return Ok(walked);
            };
            walked += 1;
            self.counts.chain_entries += 1;
            self.check_group_membership(&rel);
            match (previous, rel.prev(end)) {
                (None, PrevLink::Degree(degree)) => expected_degree = Some(degree),
                (None, PrevLink::Rel(other)) => self.error(format!(
                    "head {id} of the {} links back to {other}",
                    self.chain_name()
                )),
                (Some(prev), PrevLink::Rel(other)) if other == prev => {}
                (Some(prev), link) => self.error(format!(
                    "relationship {id} in the {} links back to {link:?}, expected {prev}",
                    self.chain_name()
                )),
            }
            previous = Some(id);
            cursor = rel.next(end);
        }
        if let Some(degree) = expected_degree {
            if degree != walked {
                self.error(format!(
                    "{} head degree {degree} but {walked} relationships walked",
                    self.chain_name()
                ));
            }
        }
        Ok(walked)
    }

    fn check_group_membership(&mut self, rel: &RelationshipRecord) {
        let Some((ty, direction)) = self.group else {
            return;
        };
        if rel.ty != ty || rel.direction_for(self.node) != direction {
            self.error(format!(
                "relationship {} of type {} ({:?}) sits in the {}",
                rel.id,
                rel.ty,
                rel.direction_for(self.node),
                self.chain_name()
            ));
        }
    }

    fn error(&mut self, message: String) {
        push_error(self.findings, message);
    }
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding::error(message.into()));
    }
}
