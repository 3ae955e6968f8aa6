//! Binary command format.
//!
//! Each command is `tag: u8`, the record id, then the before and after
//! images, all big-endian. Counter commands carry their key fields and a
//! delta instead of images. Absent references are written as
//! [`NULL_REFERENCE`](crate::types::NULL_REFERENCE).

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::storage::record::{
    Direction, DynamicRecord, MetaDataRecord, NodeChain, NodeRecord, PrevLink, PropertyBlock,
    PropertyOwner, PropertyRecord, Record, RelationshipGroupRecord, RelationshipRecord,
    SchemaRecord, SecondaryUnit, TokenRecord, MAX_BLOCKS_PER_RECORD,
};
use crate::types::{
    id_or_none, raw_or_null, DynId, GroupId, LabelId, MetaId, NodeId, PropId, PropKeyId, RecordId,
    RelId, Result, SchemaId, SombraError, TokenId, TypeId,
};

use super::{Command, RecordCommand};

const TAG_NODE: u8 = 1;
const TAG_RELATIONSHIP: u8 = 2;
const TAG_RELATIONSHIP_GROUP: u8 = 3;
const TAG_PROPERTY: u8 = 4;
const TAG_LABEL_TOKEN: u8 = 5;
const TAG_RELATIONSHIP_TYPE_TOKEN: u8 = 6;
const TAG_PROPERTY_KEY_TOKEN: u8 = 7;
const TAG_SCHEMA: u8 = 8;
const TAG_METADATA: u8 = 9;
const TAG_NODE_COUNT: u8 = 10;
const TAG_RELATIONSHIP_COUNT: u8 = 11;
const TAG_GROUP_DEGREE: u8 = 12;

const FLAG_IN_USE: u8 = 0x1;
const FLAG_CREATED: u8 = 0x2;
const FLAG_REQUIRES_SECONDARY: u8 = 0x4;
const FLAG_HAS_SECONDARY: u8 = 0x8;
const FLAG_MASK: u8 = 0xF;

const FIRST_IN_FIRST_CHAIN: u8 = 0x1;
const FIRST_IN_SECOND_CHAIN: u8 = 0x2;

const OWNER_NONE: u8 = 0;
const OWNER_NODE: u8 = 1;
const OWNER_RELATIONSHIP: u8 = 2;

/// Serializes a batch as a command count followed by the commands.
///
/// Fails with an invalid-argument error, before producing any bytes, when
/// a count or length does not fit its field.
pub fn encode_batch(commands: &[Command]) -> Result<Vec<u8>> {
    let mut w = ByteWriter::with_capacity(commands.len() * 64 + 4);
    w.put_len(commands.len(), "command batch")?;
    for command in commands {
        write_command(&mut w, command)?;
    }
    Ok(w.into_inner())
}

/// Reverses [`encode_batch`]. Trailing bytes are corruption.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Command>> {
    let mut r = ByteReader::new(bytes);
    let count = r.get_u32()? as usize;
    let mut commands = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        match read_command(&mut r)? {
            Some(command) => commands.push(command),
            None => {
                return Err(SombraError::Truncated {
                    needed: 1,
                    available: 0,
                })
            }
        }
    }
    if !r.is_exhausted() {
        return Err(SombraError::Corruption("trailing bytes after command batch"));
    }
    Ok(commands)
}

/// Appends one command. On error the writer may hold a partial command.
pub fn write_command(w: &mut ByteWriter, command: &Command) -> Result<()> {
    match command {
        Command::Node(c) => {
            w.put_u8(TAG_NODE);
            w.put_u64(c.id().raw());
            write_node(w, &c.before)?;
            write_node(w, &c.after)?;
        }
        Command::Relationship(c) => {
            w.put_u8(TAG_RELATIONSHIP);
            w.put_u64(c.id().raw());
            write_relationship(w, &c.before);
            write_relationship(w, &c.after);
        }
        Command::RelationshipGroup(c) => {
            w.put_u8(TAG_RELATIONSHIP_GROUP);
            w.put_u64(c.id().raw());
            write_group(w, &c.before);
            write_group(w, &c.after);
        }
        Command::Property(c) => {
            w.put_u8(TAG_PROPERTY);
            w.put_u64(c.id().raw());
            write_property(w, &c.before)?;
            write_property(w, &c.after)?;
        }
        Command::LabelToken(c) => write_token_command(w, TAG_LABEL_TOKEN, c)?,
        Command::RelationshipTypeToken(c) => write_token_command(w, TAG_RELATIONSHIP_TYPE_TOKEN, c)?,
        Command::PropertyKeyToken(c) => write_token_command(w, TAG_PROPERTY_KEY_TOKEN, c)?,
        Command::Schema(c) => {
            w.put_u8(TAG_SCHEMA);
            w.put_u64(c.id().raw());
            write_schema(w, &c.before)?;
            write_schema(w, &c.after)?;
        }
        Command::MetaData(c) => {
            w.put_u8(TAG_METADATA);
            w.put_u64(c.id().raw());
            write_meta(w, &c.before);
            write_meta(w, &c.after);
        }
        Command::NodeCount { label, delta } => {
            w.put_u8(TAG_NODE_COUNT);
            w.put_u64(raw_or_null(*label));
            w.put_i64(*delta);
        }
        Command::RelationshipCount {
            start_label,
            ty,
            end_label,
            delta,
        } => {
            w.put_u8(TAG_RELATIONSHIP_COUNT);
            w.put_u64(raw_or_null(*start_label));
            w.put_u64(raw_or_null(*ty));
            w.put_u64(raw_or_null(*end_label));
            w.put_i64(*delta);
        }
        Command::GroupDegree {
            group,
            direction,
            delta,
        } => {
            w.put_u8(TAG_GROUP_DEGREE);
            w.put_u64(group.0);
            w.put_u8(direction.as_u8());
            w.put_i64(*delta);
        }
    }
    Ok(())
}

/// Reads the next command.
///
/// Returns `Ok(None)` when the reader is exhausted exactly at a command
/// boundary, and [`SombraError::Truncated`] when it ends inside one.
pub fn read_command(r: &mut ByteReader<'_>) -> Result<Option<Command>> {
    if r.is_exhausted() {
        return Ok(None);
    }
    let tag = r.get_u8()?;
    let command = match tag {
        TAG_NODE => {
            let id = NodeId(r.get_u64()?);
            Command::Node(read_pair(r, id, read_node)?)
        }
        TAG_RELATIONSHIP => {
            let id = RelId(r.get_u64()?);
            Command::Relationship(read_pair(r, id, read_relationship)?)
        }
        TAG_RELATIONSHIP_GROUP => {
            let id = GroupId(r.get_u64()?);
            Command::RelationshipGroup(read_pair(r, id, read_group)?)
        }
        TAG_PROPERTY => {
            let id = PropId(r.get_u64()?);
            Command::Property(read_pair(r, id, read_property)?)
        }
        TAG_LABEL_TOKEN => Command::LabelToken(read_token_command(r)?),
        TAG_RELATIONSHIP_TYPE_TOKEN => Command::RelationshipTypeToken(read_token_command(r)?),
        TAG_PROPERTY_KEY_TOKEN => Command::PropertyKeyToken(read_token_command(r)?),
        TAG_SCHEMA => {
            let id = SchemaId(r.get_u64()?);
            Command::Schema(read_pair(r, id, read_schema)?)
        }
        TAG_METADATA => {
            let id = MetaId(r.get_u64()?);
            Command::MetaData(read_pair(r, id, read_meta)?)
        }
        TAG_NODE_COUNT => Command::NodeCount {
            label: id_or_none(r.get_u64()?),
            delta: r.get_i64()?,
        },
        TAG_RELATIONSHIP_COUNT => Command::RelationshipCount {
            start_label: id_or_none(r.get_u64()?),
            ty: id_or_none(r.get_u64()?),
            end_label: id_or_none(r.get_u64()?),
            delta: r.get_i64()?,
        },
        TAG_GROUP_DEGREE => {
            let group = GroupId(r.get_u64()?);
            let direction = Direction::from_u8(r.get_u8()?)
                .ok_or(SombraError::Corruption("unknown group degree direction"))?;
            Command::GroupDegree {
                group,
                direction,
                delta: r.get_i64()?,
            }
        }
        other => {
            return Err(SombraError::CorruptionOwned(format!(
                "unknown command tag {other}"
            )))
        }
    };
    Ok(Some(command))
}

fn read_pair<R: Record>(
    r: &mut ByteReader<'_>,
    id: R::Id,
    read: fn(&mut ByteReader<'_>) -> Result<R>,
) -> Result<RecordCommand<R>> {
    let before = read(r)?;
    let after = read(r)?;
    if before.id() != id || after.id() != id {
        return Err(SombraError::CorruptionOwned(format!(
            "{} command {id} carries images of {} and {}",
            R::KIND,
            before.id(),
            after.id()
        )));
    }
    Ok(RecordCommand::new(before, after))
}

fn write_token_command(
    w: &mut ByteWriter,
    tag: u8,
    command: &RecordCommand<TokenRecord>,
) -> Result<()> {
    w.put_u8(tag);
    w.put_u32(command.id().0);
    write_token(w, &command.before)?;
    write_token(w, &command.after)
}

fn read_token_command(r: &mut ByteReader<'_>) -> Result<RecordCommand<TokenRecord>> {
    let id = TokenId(r.get_u32()?);
    read_pair(r, id, read_token)
}

struct Flags {
    in_use: bool,
    created: bool,
    secondary: SecondaryUnit,
}

fn put_flags(w: &mut ByteWriter, in_use: bool, created: bool, secondary: Option<&SecondaryUnit>) {
    let mut flags = 0u8;
    if in_use {
        flags |= FLAG_IN_USE;
    }
    if created {
        flags |= FLAG_CREATED;
    }
    let secondary_id = secondary.and_then(|unit| {
        if unit.required {
            flags |= FLAG_REQUIRES_SECONDARY;
        }
        unit.id
    });
    if secondary_id.is_some() {
        flags |= FLAG_HAS_SECONDARY;
    }
    w.put_u8(flags);
    if let Some(id) = secondary_id {
        w.put_u64(id);
    }
}

fn get_flags(r: &mut ByteReader<'_>) -> Result<Flags> {
    let flags = r.get_u8()?;
    if flags & !FLAG_MASK != 0 {
        return Err(SombraError::CorruptionOwned(format!(
            "unknown record flags {flags:#04x}"
        )));
    }
    let id = if flags & FLAG_HAS_SECONDARY != 0 {
        Some(r.get_u64()?)
    } else {
        None
    };
    Ok(Flags {
        in_use: flags & FLAG_IN_USE != 0,
        created: flags & FLAG_CREATED != 0,
        secondary: SecondaryUnit {
            required: flags & FLAG_REQUIRES_SECONDARY != 0,
            id,
        },
    })
}

fn write_dynamic(w: &mut ByteWriter, record: &DynamicRecord) -> Result<()> {
    w.put_u64(record.id.0);
    put_flags(w, record.in_use, record.created, None);
    w.put_bool(record.start_record);
    w.put_bytes(&record.data)?;
    w.put_u64(raw_or_null(record.next_block));
    Ok(())
}

fn read_dynamic(r: &mut ByteReader<'_>) -> Result<DynamicRecord> {
    let id = DynId(r.get_u64()?);
    let flags = get_flags(r)?;
    Ok(DynamicRecord {
        id,
        in_use: flags.in_use,
        created: flags.created,
        start_record: r.get_bool()?,
        data: r.get_bytes()?,
        next_block: id_or_none(r.get_u64()?),
    })
}

fn write_dynamics(w: &mut ByteWriter, records: &[DynamicRecord]) -> Result<()> {
    w.put_len(records.len(), "dynamic record chain")?;
    for record in records {
        write_dynamic(w, record)?;
    }
    Ok(())
}

fn read_dynamics(r: &mut ByteReader<'_>) -> Result<Vec<DynamicRecord>> {
    let count = r.get_u32()? as usize;
    let mut records = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        records.push(read_dynamic(r)?);
    }
    Ok(records)
}

fn write_node(w: &mut ByteWriter, node: &NodeRecord) -> Result<()> {
    w.put_u64(node.id.0);
    put_flags(w, node.in_use, node.created, Some(&node.secondary));
    w.put_bool(node.is_dense());
    w.put_u64(node.next_rel_raw().unwrap_or(crate::types::NULL_REFERENCE));
    w.put_u64(raw_or_null(node.next_prop));
    w.put_len(node.labels.len(), "node label set")?;
    for label in &node.labels {
        w.put_u32(label.0);
    }
    write_dynamics(w, &node.dynamic_labels)
}

fn read_node(r: &mut ByteReader<'_>) -> Result<NodeRecord> {
    let id = NodeId(r.get_u64()?);
    let flags = get_flags(r)?;
    let dense = r.get_bool()?;
    let next_rel = r.get_u64()?;
    let chain = if dense {
        NodeChain::Dense(id_or_none(next_rel))
    } else {
        NodeChain::Sparse(id_or_none(next_rel))
    };
    let next_prop = id_or_none(r.get_u64()?);
    let label_count = r.get_u32()? as usize;
    let mut labels = Vec::with_capacity(label_count.min(r.remaining() / 4));
    for _ in 0..label_count {
        labels.push(LabelId(r.get_u32()?));
    }
    Ok(NodeRecord {
        id,
        in_use: flags.in_use,
        created: flags.created,
        chain,
        next_prop,
        labels,
        dynamic_labels: read_dynamics(r)?,
        secondary: flags.secondary,
    })
}

fn write_relationship(w: &mut ByteWriter, rel: &RelationshipRecord) {
    w.put_u64(rel.id.0);
    put_flags(w, rel.in_use, rel.created, Some(&rel.secondary));
    w.put_u64(rel.first_node.0);
    w.put_u64(rel.second_node.0);
    w.put_u32(rel.ty.0);
    let (first_prev, first_in_first) = rel.first_prev.to_raw();
    let (second_prev, first_in_second) = rel.second_prev.to_raw();
    w.put_u64(first_prev);
    w.put_u64(raw_or_null(rel.first_next));
    w.put_u64(second_prev);
    w.put_u64(raw_or_null(rel.second_next));
    w.put_u64(raw_or_null(rel.next_prop));
    let mut extra = 0u8;
    if first_in_first {
        extra |= FIRST_IN_FIRST_CHAIN;
    }
    if first_in_second {
        extra |= FIRST_IN_SECOND_CHAIN;
    }
    w.put_u8(extra);
}

fn read_relationship(r: &mut ByteReader<'_>) -> Result<RelationshipRecord> {
    let id = RelId(r.get_u64()?);
    let flags = get_flags(r)?;
    let first_node = NodeId(r.get_u64()?);
    let second_node = NodeId(r.get_u64()?);
    let ty = TypeId(r.get_u32()?);
    let first_prev = r.get_u64()?;
    let first_next = id_or_none(r.get_u64()?);
    let second_prev = r.get_u64()?;
    let second_next = id_or_none(r.get_u64()?);
    let next_prop = id_or_none(r.get_u64()?);
    let extra = r.get_u8()?;
    if extra & !(FIRST_IN_FIRST_CHAIN | FIRST_IN_SECOND_CHAIN) != 0 {
        return Err(SombraError::Corruption("unknown relationship chain flags"));
    }
    Ok(RelationshipRecord {
        id,
        in_use: flags.in_use,
        created: flags.created,
        first_node,
        second_node,
        ty,
        first_prev: PrevLink::from_raw(first_prev, extra & FIRST_IN_FIRST_CHAIN != 0),
        first_next,
        second_prev: PrevLink::from_raw(second_prev, extra & FIRST_IN_SECOND_CHAIN != 0),
        second_next,
        next_prop,
        secondary: flags.secondary,
    })
}

fn write_group(w: &mut ByteWriter, group: &RelationshipGroupRecord) {
    w.put_u64(group.id.0);
    put_flags(w, group.in_use, group.created, Some(&group.secondary));
    w.put_u32(group.ty.0);
    w.put_u64(group.owning_node.0);
    w.put_u64(raw_or_null(group.prev));
    w.put_u64(raw_or_null(group.next));
    let mut external = 0u8;
    for (bit, direction) in Direction::ALL.iter().enumerate() {
        w.put_u64(raw_or_null(group.head(*direction)));
        if group.has_external_degrees(*direction) {
            external |= 1 << bit;
        }
    }
    w.put_u8(external);
}

fn read_group(r: &mut ByteReader<'_>) -> Result<RelationshipGroupRecord> {
    let mut group = RelationshipGroupRecord::unused(GroupId(r.get_u64()?));
    let flags = get_flags(r)?;
    group.in_use = flags.in_use;
    group.created = flags.created;
    group.secondary = flags.secondary;
    group.ty = TypeId(r.get_u32()?);
    group.owning_node = NodeId(r.get_u64()?);
    group.prev = id_or_none(r.get_u64()?);
    group.next = id_or_none(r.get_u64()?);
    for direction in Direction::ALL {
        group.set_head(direction, id_or_none(r.get_u64()?));
    }
    let external = r.get_u8()?;
    if external & !0b111 != 0 {
        return Err(SombraError::Corruption("unknown external degree flags"));
    }
    for (bit, direction) in Direction::ALL.iter().enumerate() {
        if external & (1 << bit) != 0 {
            group.set_external_degrees(*direction);
        }
    }
    Ok(group)
}

fn write_property(w: &mut ByteWriter, property: &PropertyRecord) -> Result<()> {
    w.put_u64(property.id.0);
    put_flags(w, property.in_use, property.created, Some(&property.secondary));
    match property.owner {
        None => w.put_u8(OWNER_NONE),
        Some(PropertyOwner::Node(node)) => {
            w.put_u8(OWNER_NODE);
            w.put_u64(node.0);
        }
        Some(PropertyOwner::Relationship(rel)) => {
            w.put_u8(OWNER_RELATIONSHIP);
            w.put_u64(rel.0);
        }
    }
    w.put_u64(raw_or_null(property.prev_prop));
    w.put_u64(raw_or_null(property.next_prop));
    if property.blocks.len() > MAX_BLOCKS_PER_RECORD {
        return Err(SombraError::InvalidOwned(format!(
            "property record {} holds {} blocks, at most {MAX_BLOCKS_PER_RECORD} fit",
            property.id,
            property.blocks.len()
        )));
    }
    w.put_u8(property.blocks.len() as u8);
    for block in &property.blocks {
        w.put_u32(block.key.0);
        w.put_bytes(&block.inline)?;
        write_dynamics(w, &block.value_records)?;
    }
    write_dynamics(w, &property.deleted_records)
}

fn read_property(r: &mut ByteReader<'_>) -> Result<PropertyRecord> {
    let id = PropId(r.get_u64()?);
    let flags = get_flags(r)?;
    let owner = match r.get_u8()? {
        OWNER_NONE => None,
        OWNER_NODE => Some(PropertyOwner::Node(NodeId(r.get_u64()?))),
        OWNER_RELATIONSHIP => Some(PropertyOwner::Relationship(RelId(r.get_u64()?))),
        _ => return Err(SombraError::Corruption("unknown property owner kind")),
    };
    let prev_prop = id_or_none(r.get_u64()?);
    let next_prop = id_or_none(r.get_u64()?);
    let block_count = r.get_u8()? as usize;
    if block_count > MAX_BLOCKS_PER_RECORD {
        return Err(SombraError::CorruptionOwned(format!(
            "property record {id} claims {block_count} blocks"
        )));
    }
    let mut blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        blocks.push(PropertyBlock {
            key: PropKeyId(r.get_u32()?),
            inline: r.get_bytes()?,
            value_records: read_dynamics(r)?,
        });
    }
    Ok(PropertyRecord {
        id,
        in_use: flags.in_use,
        created: flags.created,
        owner,
        prev_prop,
        next_prop,
        blocks,
        deleted_records: read_dynamics(r)?,
        secondary: flags.secondary,
    })
}

fn write_token(w: &mut ByteWriter, token: &TokenRecord) -> Result<()> {
    w.put_u32(token.id.0);
    put_flags(w, token.in_use, token.created, None);
    w.put_bool(token.internal);
    w.put_u64(raw_or_null(token.name_id));
    write_dynamics(w, &token.name_records)
}

fn read_token(r: &mut ByteReader<'_>) -> Result<TokenRecord> {
    let id = TokenId(r.get_u32()?);
    let flags = get_flags(r)?;
    Ok(TokenRecord {
        id,
        in_use: flags.in_use,
        created: flags.created,
        internal: r.get_bool()?,
        name_id: id_or_none(r.get_u64()?),
        name_records: read_dynamics(r)?,
    })
}

fn write_schema(w: &mut ByteWriter, schema: &SchemaRecord) -> Result<()> {
    w.put_u64(schema.id.0);
    put_flags(w, schema.in_use, schema.created, Some(&schema.secondary));
    w.put_bool(schema.constraint);
    w.put_u64(raw_or_null(schema.next_prop));
    w.put_bytes(&schema.rule)
}

fn read_schema(r: &mut ByteReader<'_>) -> Result<SchemaRecord> {
    let id = SchemaId(r.get_u64()?);
    let flags = get_flags(r)?;
    Ok(SchemaRecord {
        id,
        in_use: flags.in_use,
        created: flags.created,
        constraint: r.get_bool()?,
        next_prop: id_or_none(r.get_u64()?),
        rule: r.get_bytes()?,
        secondary: flags.secondary,
    })
}

fn write_meta(w: &mut ByteWriter, meta: &MetaDataRecord) {
    w.put_u64(meta.id.0);
    put_flags(w, meta.in_use, meta.created, None);
    w.put_u64(meta.value);
}

fn read_meta(r: &mut ByteReader<'_>) -> Result<MetaDataRecord> {
    let id = MetaId(r.get_u64()?);
    let flags = get_flags(r)?;
    Ok(MetaDataRecord {
        id,
        in_use: flags.in_use,
        created: flags.created,
        value: r.get_u64()?,
    })
}
