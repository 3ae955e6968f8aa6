//! Commands: before/after record pairs and counter deltas, the unit the
//! applier pipeline and the command log work with.

use std::fmt;

use crate::storage::record::{
    Direction, MetaDataRecord, NodeRecord, PropertyRecord, Record, RelationshipGroupRecord,
    RelationshipRecord, SchemaRecord, TokenKind, TokenRecord,
};
use crate::types::{GroupId, LabelId, RecordId, Result, TxId, TypeId};

mod codec;
mod grouper;

pub use codec::{decode_batch, encode_batch, read_command, write_command};
pub use grouper::{EntityCommandGrouper, EntityGroupCursor, EntityKind};

/// Before and after image of one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordCommand<R> {
    /// Record as the stores hold it before the command.
    pub before: R,
    /// Record as the command leaves it.
    pub after: R,
}

/// What a record command does to its record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandMode {
    /// The record is created by this command.
    Create,
    /// An in-use record changes.
    Update,
    /// The record ends up unused.
    Delete,
}

impl<R: Record> RecordCommand<R> {
    /// Pairs the two images.
    pub fn new(before: R, after: R) -> Self {
        Self { before, after }
    }

    /// Id of the record, taken from the after image.
    pub fn id(&self) -> R::Id {
        self.after.id()
    }

    /// Create, update or delete, judged from the after image.
    pub fn mode(&self) -> CommandMode {
        if self.after.is_created() {
            CommandMode::Create
        } else if !self.after.in_use() {
            CommandMode::Delete
        } else {
            CommandMode::Update
        }
    }
}

/// Every kind of change the engine applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Node record change.
    Node(RecordCommand<NodeRecord>),
    /// Relationship record change.
    Relationship(RecordCommand<RelationshipRecord>),
    /// Relationship group record change.
    RelationshipGroup(RecordCommand<RelationshipGroupRecord>),
    /// Property record change.
    Property(RecordCommand<PropertyRecord>),
    /// Label token change.
    LabelToken(RecordCommand<TokenRecord>),
    /// Relationship type token change.
    RelationshipTypeToken(RecordCommand<TokenRecord>),
    /// Property key token change.
    PropertyKeyToken(RecordCommand<TokenRecord>),
    /// Schema rule change.
    Schema(RecordCommand<SchemaRecord>),
    /// Metadata slot change.
    MetaData(RecordCommand<MetaDataRecord>),
    /// Change in the number of nodes with `label`, or of all nodes.
    NodeCount {
        /// Counted label; `None` counts every node.
        label: Option<LabelId>,
        /// Signed change.
        delta: i64,
    },
    /// Change in the number of relationships matching the pattern.
    RelationshipCount {
        /// Label of the start node, `None` for any.
        start_label: Option<LabelId>,
        /// Relationship type, `None` for any.
        ty: Option<TypeId>,
        /// Label of the end node, `None` for any.
        end_label: Option<LabelId>,
        /// Signed change.
        delta: i64,
    },
    /// Change in the externally tracked degree of a group sub-chain.
    GroupDegree {
        /// Group owning the sub-chain.
        group: GroupId,
        /// Which sub-chain.
        direction: Direction,
        /// Signed change.
        delta: i64,
    },
}

impl Command {
    /// Wraps a token command in the variant for `kind`.
    pub fn token(kind: TokenKind, command: RecordCommand<TokenRecord>) -> Self {
        match kind {
            TokenKind::Label => Command::LabelToken(command),
            TokenKind::RelationshipType => Command::RelationshipTypeToken(command),
            TokenKind::PropertyKey => Command::PropertyKeyToken(command),
        }
    }

    /// Dispatches to the visitor method for this variant. `Ok(true)` means
    /// the visitor consumed the command.
    pub fn accept(&self, visitor: &mut dyn CommandVisitor) -> Result<bool> {
        match self {
            Command::Node(c) => visitor.visit_node_command(c),
            Command::Relationship(c) => visitor.visit_relationship_command(c),
            Command::RelationshipGroup(c) => visitor.visit_relationship_group_command(c),
            Command::Property(c) => visitor.visit_property_command(c),
            Command::LabelToken(c) => visitor.visit_label_token_command(c),
            Command::RelationshipTypeToken(c) => visitor.visit_relationship_type_token_command(c),
            Command::PropertyKeyToken(c) => visitor.visit_property_key_token_command(c),
            Command::Schema(c) => visitor.visit_schema_command(c),
            Command::MetaData(c) => visitor.visit_metadata_command(c),
            Command::NodeCount { label, delta } => visitor.visit_node_count_command(*label, *delta),
            Command::RelationshipCount {
                start_label,
                ty,
                end_label,
                delta,
            } => visitor.visit_relationship_count_command(*start_label, *ty, *end_label, *delta),
            Command::GroupDegree {
                group,
                direction,
                delta,
            } => visitor.visit_group_degree_command(*group, *direction, *delta),
        }
    }

    /// Raw id of the record the command targets; `None` for counters.
    pub fn record_id(&self) -> Option<u64> {
        match self {
            Command::Node(c) => Some(c.id().raw()),
            Command::Relationship(c) => Some(c.id().raw()),
            Command::RelationshipGroup(c) => Some(c.id().raw()),
            Command::Property(c) => Some(c.id().raw()),
            Command::LabelToken(c)
            | Command::RelationshipTypeToken(c)
            | Command::PropertyKeyToken(c) => Some(c.id().raw()),
            Command::Schema(c) => Some(c.id().raw()),
            Command::MetaData(c) => Some(c.id().raw()),
            Command::NodeCount { .. }
            | Command::RelationshipCount { .. }
            | Command::GroupDegree { .. } => None,
        }
    }

    /// Lowercase variant name used in logs and [`fmt::Display`].
    pub fn name(&self) -> &'static str {
        match self {
            Command::Node(_) => "node",
            Command::Relationship(_) => "relationship",
            Command::RelationshipGroup(_) => "relationship_group",
            Command::Property(_) => "property",
            Command::LabelToken(_) => "label_token",
            Command::RelationshipTypeToken(_) => "relationship_type_token",
            Command::PropertyKeyToken(_) => "property_key_token",
            Command::Schema(_) => "schema",
            Command::MetaData(_) => "metadata",
            Command::NodeCount { .. } => "node_count",
            Command::RelationshipCount { .. } => "relationship_count",
            Command::GroupDegree { .. } => "group_degree",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.record_id() {
            Some(id) => write!(f, "{}[{id}]", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

/// Per-variant command handlers. Every method defaults to "not handled".
#[allow(unused_variables)]
pub trait CommandVisitor {
    /// Node record commands.
    fn visit_node_command(&mut self, command: &RecordCommand<NodeRecord>) -> Result<bool> {
        Ok(false)
    }
    /// Relationship record commands.
    fn visit_relationship_command(
        &mut self,
        command: &RecordCommand<RelationshipRecord>,
    ) -> Result<bool> {
        Ok(false)
    }
    /// Relationship group record commands.
    fn visit_relationship_group_command(
        &mut self,
        command: &RecordCommand<RelationshipGroupRecord>,
    ) -> Result<bool> {
        Ok(false)
    }
    /// Property record commands.
    fn visit_property_command(&mut self, command: &RecordCommand<PropertyRecord>) -> Result<bool> {
        Ok(false)
    }
    /// Label token commands.
    fn visit_label_token_command(&mut self, command: &RecordCommand<TokenRecord>) -> Result<bool> {
        Ok(false)
    }
    /// Relationship type token commands.
    fn visit_relationship_type_token_command(
        &mut self,
        command: &RecordCommand<TokenRecord>,
    ) -> Result<bool> {
        Ok(false)
    }
    /// Property key token commands.
    fn visit_property_key_token_command(
        &mut self,
        command: &RecordCommand<TokenRecord>,
    ) -> Result<bool> {
        Ok(false)
    }
    /// Schema commands.
    fn visit_schema_command(&mut self, command: &RecordCommand<SchemaRecord>) -> Result<bool> {
        Ok(false)
    }
    /// Metadata commands.
    fn visit_metadata_command(&mut self, command: &RecordCommand<MetaDataRecord>) -> Result<bool> {
        Ok(false)
    }
    /// Node counter changes.
    fn visit_node_count_command(&mut self, label: Option<LabelId>, delta: i64) -> Result<bool> {
        Ok(false)
    }
    /// Relationship counter changes.
    fn visit_relationship_count_command(
        &mut self,
        start_label: Option<LabelId>,
        ty: Option<TypeId>,
        end_label: Option<LabelId>,
        delta: i64,
    ) -> Result<bool> {
        Ok(false)
    }
    /// External group degree changes.
    fn visit_group_degree_command(
        &mut self,
        group: GroupId,
        direction: Direction,
        delta: i64,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Commands of one transaction, in application order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBatch {
    /// Transaction the batch was committed as.
    pub tx_id: TxId,
    /// Commands in application order.
    pub commands: Vec<Command>,
}

impl CommandBatch {
    /// Batch of `commands` for `tx_id`.
    pub fn new(tx_id: TxId, commands: Vec<Command>) -> Self {
        Self { tx_id, commands }
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True for a batch without commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod samples {
    //! One command of every variant, with awkward field values.

    use super::*;
    use crate::storage::record::{
        ChainEnd, DynamicRecord, NodeChain, PrevLink, PropertyBlock, PropertyOwner, SecondaryUnit,
    };
    use crate::types::{DynId, MetaId, NodeId, PropId, PropKeyId, RelId, SchemaId, TokenId};

    pub fn dynamic(id: u64, start: bool, data: &[u8], next: Option<u64>) -> DynamicRecord {
        DynamicRecord {
            id: DynId(id),
            in_use: true,
            created: true,
            start_record: start,
            data: data.to_vec(),
            next_block: next.map(DynId),
        }
    }

    pub fn node(id: u64) -> RecordCommand<NodeRecord> {
        let before = NodeRecord::unused(NodeId(id));
        let mut after = before.clone();
        after.in_use = true;
        after.created = true;
        after.chain = NodeChain::Dense(Some(GroupId(3)));
        after.next_prop = Some(PropId(9));
        after.labels = vec![LabelId(1), LabelId(2), LabelId(3), LabelId(4), LabelId(u32::MAX)];
        after.dynamic_labels = vec![dynamic(40, true, &[0, 1, 2], Some(41)), dynamic(41, false, &[3], None)];
        after.secondary = SecondaryUnit {
            required: true,
            id: Some(77),
        };
        RecordCommand::new(before, after)
    }

    pub fn relationship(id: u64) -> RecordCommand<RelationshipRecord> {
        let mut before = RelationshipRecord::unused(RelId(id));
        before.initialize(NodeId(1), NodeId(2), TypeId(u32::MAX));
        before.set_prev(ChainEnd::First, PrevLink::Degree(12));
        before.set_next(ChainEnd::First, Some(RelId(4)));
        let mut after = before.clone();
        after.set_prev(ChainEnd::First, PrevLink::Rel(RelId(8)));
        after.set_prev(ChainEnd::Second, PrevLink::Degree(1));
        after.next_prop = Some(PropId(5));
        after.secondary = SecondaryUnit {
            required: true,
            id: None,
        };
        RecordCommand::new(before, after)
    }

    pub fn group(id: u64) -> RecordCommand<RelationshipGroupRecord> {
        let before = RelationshipGroupRecord::unused(GroupId(id));
        let mut after = before.clone();
        after.in_use = true;
        after.ty = TypeId(u32::MAX);
        after.owning_node = NodeId(6);
        after.next = Some(GroupId(id + 1));
        after.first_out = Some(RelId(3));
        after.first_loop = Some(RelId(4));
        after.set_external_degrees(Direction::Incoming);
        RecordCommand::new(before, after)
    }

    pub fn property(id: u64) -> RecordCommand<PropertyRecord> {
        let mut before = PropertyRecord::unused(PropId(id));
        before.in_use = true;
        before.owner = Some(PropertyOwner::Relationship(RelId(2)));
        before.blocks.push(PropertyBlock {
            key: PropKeyId(1),
            inline: vec![],
            value_records: vec![dynamic(50, true, &[7; 30], None)],
        });
        let mut after = before.clone();
        after.remove_block(PropKeyId(1));
        after.blocks.push(PropertyBlock {
            key: PropKeyId(u32::MAX),
            inline: vec![1, 2, 3],
            value_records: Vec::new(),
        });
        after.prev_prop = Some(PropId(id + 1));
        RecordCommand::new(before, after)
    }

    pub fn token(id: u32) -> RecordCommand<TokenRecord> {
        let before = TokenRecord::unused(TokenId(id));
        let mut after = before.clone();
        after.in_use = true;
        after.created = true;
        after.internal = true;
        after.name_id = Some(DynId(60));
        after.name_records = vec![dynamic(60, true, b"KNOWS", None)];
        RecordCommand::new(before, after)
    }

    pub fn all() -> Vec<Command> {
        let schema_before = SchemaRecord::unused(SchemaId(2));
        let mut schema_after = schema_before.clone();
        schema_after.in_use = true;
        schema_after.constraint = true;
        schema_after.rule = b"unique(:Person.name)".to_vec();
        let meta_before = MetaDataRecord::unused(MetaId(1));
        let mut meta_after = meta_before.clone();
        meta_after.in_use = true;
        meta_after.value = u64::MAX;
        vec![
            Command::Node(node(11)),
            Command::Relationship(relationship(12)),
            Command::RelationshipGroup(group(13)),
            Command::Property(property(14)),
            Command::LabelToken(token(1)),
            Command::RelationshipTypeToken(token(u32::MAX - 1)),
            Command::PropertyKeyToken(token(0)),
            Command::Schema(RecordCommand::new(schema_before, schema_after)),
            Command::MetaData(RecordCommand::new(meta_before, meta_after)),
            Command::NodeCount {
                label: Some(LabelId(u32::MAX)),
                delta: -3,
            },
            Command::RelationshipCount {
                start_label: None,
                ty: Some(TypeId(7)),
                end_label: None,
                delta: i64::MIN,
            },
            Command::GroupDegree {
                group: GroupId(13),
                direction: Direction::Loop,
                delta: 11,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<&'static str>,
        consume_nodes: bool,
    }

    impl CommandVisitor for Recorder {
        fn visit_node_command(&mut self, _command: &RecordCommand<NodeRecord>) -> Result<bool> {
            self.seen.push("node");
            Ok(self.consume_nodes)
        }

        fn visit_group_degree_command(
            &mut self,
            _group: GroupId,
            _direction: Direction,
            _delta: i64,
        ) -> Result<bool> {
            self.seen.push("group_degree");
            Ok(false)
        }
    }

    #[test]
    fn accept_dispatches_by_variant() -> Result<()> {
        let mut recorder = Recorder {
            consume_nodes: true,
            ..Recorder::default()
        };
        let mut consumed = 0;
        for command in samples::all() {
            if command.accept(&mut recorder)? {
                consumed += 1;
            }
        }
        assert_eq!(recorder.seen, vec!["node", "group_degree"]);
        assert_eq!(consumed, 1);
        Ok(())
    }

    #[test]
    fn mode_follows_record_state() {
        let create = samples::node(1);
        assert_eq!(create.mode(), CommandMode::Create);
        let mut delete = samples::group(1);
        delete.before = delete.after.clone();
        delete.after.in_use = false;
        assert_eq!(delete.mode(), CommandMode::Delete);
        assert_eq!(samples::relationship(1).mode(), CommandMode::Update);
    }

    #[test]
    fn display_names_target() {
        let command = Command::Relationship(samples::relationship(12));
        assert_eq!(command.to_string(), "relationship[12]");
        let count = Command::NodeCount {
            label: None,
            delta: 1,
        };
        assert_eq!(count.to_string(), "node_count");
    }
}
