use crate::storage::record::{PropertyOwner, PropertyRecord};
use crate::types::{RecordId, Result, SombraError};

use super::{Command, RecordCommand};

/// Entity whose commands a grouper collects.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntityKind {
    /// Node commands and node-owned property commands.
    Node,
    /// Relationship commands and relationship-owned property commands.
    Relationship,
}

impl EntityKind {
    fn owner_id(self, owner: PropertyOwner) -> Option<u64> {
        match (self, owner) {
            (EntityKind::Node, PropertyOwner::Node(id)) => Some(id.raw()),
            (EntityKind::Relationship, PropertyOwner::Relationship(id)) => Some(id.raw()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Slot {
    entity: u64,
    // 0 for the entity command, then property record id + 1.
    order: u64,
    command: Command,
}

/// Groups an interleaved stream of entity and property commands by entity.
#[derive(Debug)]
pub struct EntityCommandGrouper {
    kind: EntityKind,
    slots: Vec<Slot>,
}

impl EntityCommandGrouper {
    /// Creates an empty grouper for `kind` entities.
    pub fn with_capacity(kind: EntityKind, capacity: usize) -> Self {
        Self {
            kind,
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Entity kind collected.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Number of collected commands.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Adds an entity command of this grouper's kind or a property command
    /// owned by such an entity. Property commands owned by the other kind
    /// are ignored and reported as `false`.
    pub fn add(&mut self, command: Command) -> Result<bool> {
        let (entity, order) = match (&command, self.kind) {
            (Command::Node(c), EntityKind::Node) => (c.id().raw(), 0),
            (Command::Relationship(c), EntityKind::Relationship) => (c.id().raw(), 0),
            (Command::Property(c), _) => match property_owner(c).and_then(|o| self.kind.owner_id(o)) {
                Some(entity) => (entity, c.id().raw() + 1),
                None => return Ok(false),
            },
            (other, kind) => {
                return Err(SombraError::InvalidOwned(format!(
                    "{other} cannot be grouped by {kind:?}"
                )))
            }
        };
        self.slots.push(Slot {
            entity,
            order,
            command,
        });
        Ok(true)
    }

    /// Sorts the collected commands and returns a cursor over the groups.
    pub fn sort_and_access_groups(&mut self) -> EntityGroupCursor<'_> {
        self.slots.sort_by_key(|slot| (slot.entity, slot.order));
        EntityGroupCursor {
            slots: &self.slots,
            group_start: 0,
            group_end: 0,
            property: 0,
        }
    }

    /// Drops every collected command.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Owner of a property command: the after image when in use, else the before.
fn property_owner(command: &RecordCommand<PropertyRecord>) -> Option<PropertyOwner> {
    if command.after.in_use {
        command.after.owner
    } else {
        command.before.owner.or(command.after.owner)
    }
}

/// Cursor over entity groups in ascending entity id order.
#[derive(Debug)]
pub struct EntityGroupCursor<'a> {
    slots: &'a [Slot],
    group_start: usize,
    group_end: usize,
    property: usize,
}

impl<'a> EntityGroupCursor<'a> {
    /// Advances to the next entity and returns its id.
    pub fn next_entity(&mut self) -> Option<u64> {
        self.group_start = self.group_end;
        let entity = self.slots.get(self.group_start)?.entity;
        self.group_end = self.group_start
            + self.slots[self.group_start..]
                .iter()
                .take_while(|slot| slot.entity == entity)
                .count();
        self.property = self.group_start;
        if self.slots[self.group_start].order == 0 {
            self.property += 1;
        }
        Some(entity)
    }

    /// The current entity's own command, if the batch carried one.
    pub fn current_entity_command(&self) -> Option<&'a Command> {
        let slots: &'a [Slot] = self.slots;
        slots[self.group_start..self.group_end]
            .first()
            .filter(|slot| slot.order == 0)
            .map(|slot| &slot.command)
    }

    /// Next property command of the current entity, in property id order.
    pub fn next_property(&mut self) -> Option<&'a RecordCommand<PropertyRecord>> {
        let slots: &'a [Slot] = self.slots;
        while self.property < self.group_end {
            let slot = &slots[self.property];
            self.property += 1;
            if let Command::Property(command) = &slot.command {
                return Some(command);
            }
        }
        None
    }
}
