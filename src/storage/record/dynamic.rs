use crate::types::{DynId, RecordKind};

/// Overflow block holding part of a variable-length value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DynamicRecord {
    /// Record id.
    pub id: DynId,
    /// Whether the block is live.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// First block of its chain.
    pub start_record: bool,
    /// Payload bytes of this block.
    pub data: Vec<u8>,
    /// Following block of the chain.
    pub next_block: Option<DynId>,
}

impl DynamicRecord {
    /// A blank, unused block.
    pub fn unused(id: DynId) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            start_record: true,
            data: Vec::new(),
            next_block: None,
        }
    }
}

impl_record!(DynamicRecord, DynId, RecordKind::Dynamic);

/// Splits `data` into a chain of created, in-use blocks of at most
/// `block_size` bytes. Empty input still yields one (empty) block.
pub fn split_into_dynamic_records(
    data: &[u8],
    block_size: usize,
    mut next_id: impl FnMut() -> DynId,
) -> Vec<DynamicRecord> {
    let block_size = block_size.max(1);
    let mut records: Vec<DynamicRecord> = Vec::with_capacity(data.len() / block_size + 1);
    let mut chunks = data.chunks(block_size).peekable();
    if chunks.peek().is_none() {
        return vec![DynamicRecord {
            id: next_id(),
            in_use: true,
            created: true,
            start_record: true,
            data: Vec::new(),
            next_block: None,
        }];
    }
    for chunk in chunks {
        let id = next_id();
        if let Some(prev) = records.last_mut() {
            prev.next_block = Some(id);
        }
        records.push(DynamicRecord {
            id,
            in_use: true,
            created: true,
            start_record: records.is_empty(),
            data: chunk.to_vec(),
            next_block: None,
        });
    }
    records
}

/// Concatenates the payload of in-use blocks, following `next_block` from
/// the start record.
pub fn read_dynamic_chain(records: &[DynamicRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cursor = records.iter().find(|r| r.start_record && r.in_use);
    let mut guard = records.len();
    while let Some(record) = cursor {
        out.extend_from_slice(&record.data);
        guard = guard.saturating_sub(1);
        if guard == 0 {
            break;
        }
        cursor = record
            .next_block
            .and_then(|next| records.iter().find(|r| r.id == next && r.in_use));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_links_blocks_in_order() {
        let mut next = 10u64;
        let records = split_into_dynamic_records(b"abcdefghij", 4, || {
            next += 1;
            DynId(next)
        });
        assert_eq!(records.len(), 3);
        assert!(records[0].start_record);
        assert!(!records[1].start_record);
        assert_eq!(records[0].next_block, Some(DynId(12)));
        assert_eq!(records[2].next_block, None);
        assert_eq!(read_dynamic_chain(&records), b"abcdefghij".to_vec());
    }

    #[test]
    fn empty_value_still_allocates_a_block() {
        let records = split_into_dynamic_records(&[], 8, || DynId(1));
        assert_eq!(records.len(), 1);
        assert!(records[0].data.is_empty());
    }
}
