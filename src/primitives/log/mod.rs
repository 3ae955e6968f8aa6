#![forbid(unsafe_code)]
//! Append-only command log with checksummed, chained entries.
//!
//! Layout: a 32-byte file header followed by entries. Each entry is a 32-byte
//! header plus an opaque payload (one serialized command batch). Every entry
//! header carries the CRC of the chain so far, so a torn or reordered tail is
//! detected on read and iteration stops at the last intact entry.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{Result, SombraError, TxId};

const LOG_MAGIC: [u8; 4] = *b"SOMC";
const LOG_FORMAT_VERSION: u16 = 1;
/// Size of the file header.
pub const FILE_HEADER_LEN: usize = 32;
/// Size of every entry header.
pub const ENTRY_HEADER_LEN: usize = 32;

/// Statistics tracking log operations.
#[derive(Clone, Debug, Default)]
pub struct LogStats {
    /// Entries appended since open.
    pub entries_appended: u64,
    /// Bytes appended since open, headers included.
    pub bytes_appended: u64,
    /// Number of sync operations performed.
    pub syncs: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    start_tx: TxId,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.start_tx.0.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != LOG_MAGIC {
            return Err(SombraError::Corruption("command log magic mismatch"));
        }
        if u16::from_be_bytes([src[4], src[5]]) != LOG_FORMAT_VERSION {
            return Err(SombraError::Corruption("command log version mismatch"));
        }
        let stored_crc = be_u32(&src[28..32]);
        if compute_crc32(&[&src[..28]]) != stored_crc {
            return Err(SombraError::Corruption("command log header crc mismatch"));
        }
        Ok(Self {
            start_tx: TxId(be_u64(&src[8..16])),
        })
    }
}

#[derive(Clone, Debug)]
struct EntryHeader {
    tx_id: TxId,
    payload_len: u32,
    payload_crc32: u32,
    prev_chain: u64,
}

impl EntryHeader {
    fn encode(&self) -> [u8; ENTRY_HEADER_LEN] {
        let mut buf = [0u8; ENTRY_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.tx_id.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.payload_crc32.to_be_bytes());
        buf[16..24].copy_from_slice(&self.prev_chain.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; ENTRY_HEADER_LEN]) -> Option<Self> {
        if compute_crc32(&[&src[..28]]) != be_u32(&src[28..32]) {
            return None;
        }
        Some(Self {
            tx_id: TxId(be_u64(&src[0..8])),
            payload_len: be_u32(&src[8..12]),
            payload_crc32: be_u32(&src[12..16]),
            prev_chain: be_u64(&src[16..24]),
        })
    }
}

fn next_chain(prev_chain: u64, header: &[u8; ENTRY_HEADER_LEN], payload: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&prev_chain.to_be_bytes());
    hasher.update(header);
    hasher.update(payload);
    let entry_size = (ENTRY_HEADER_LEN + payload.len()) as u64;
    (entry_size << 32) | u64::from(hasher.finalize())
}

struct LogState {
    append_offset: u64,
    prev_chain: u64,
    last_tx: Option<TxId>,
    stats: LogStats,
}

/// Durable, append-only sequence of command batches.
pub struct CommandLog {
    io: Arc<dyn FileIo>,
    state: Mutex<LogState>,
}

/// One decoded log entry.
pub struct LogEntry {
    /// Transaction the payload belongs to.
    pub tx_id: TxId,
    /// Serialized command batch.
    pub payload: Vec<u8>,
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEntry")
            .field("tx_id", &self.tx_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl CommandLog {
    /// Largest payload a single entry can carry.
    pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize;

    /// Opens or creates a log.
    ///
    /// An existing log is scanned so that appends continue right after the
    /// last intact entry; a torn tail is overwritten by the next append.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader { start_tx: TxId(1) };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            return Ok(Self {
                io,
                state: Mutex::new(LogState {
                    append_offset: FILE_HEADER_LEN as u64,
                    prev_chain: 0,
                    last_tx: None,
                    stats: LogStats::default(),
                }),
            });
        }
        let log = Self {
            io,
            state: Mutex::new(LogState {
                append_offset: FILE_HEADER_LEN as u64,
                prev_chain: 0,
                last_tx: None,
                stats: LogStats::default(),
            }),
        };
        let mut iter = log.iter()?;
        let mut last_tx = None;
        while let Some(entry) = iter.next_entry()? {
            last_tx = Some(entry.tx_id);
        }
        {
            let mut state = log.state.lock();
            state.append_offset = iter.valid_up_to();
            state.prev_chain = iter.prev_chain;
            state.last_tx = last_tx;
        }
        if iter.valid_up_to() < len {
            warn!(
                valid_up_to = iter.valid_up_to(),
                file_len = len,
                "command_log.open.torn_tail"
            );
        }
        Ok(log)
    }

    /// Appends one entry and returns the offset it was written at.
    ///
    /// Does not sync; call [`CommandLog::sync`] for durability.
    pub fn append(&self, tx_id: TxId, payload: &[u8]) -> Result<u64> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| SombraError::Invalid("command log payload too large"))?;
        let mut state = self.state.lock();
        if let Some(last) = state.last_tx {
            if tx_id <= last {
                return Err(SombraError::InvalidOwned(format!(
                    "command log tx id {tx_id} not after {last}"
                )));
            }
        }
        let header = EntryHeader {
            tx_id,
            payload_len,
            payload_crc32: log_entry_crc32(tx_id.0, payload),
            prev_chain: state.prev_chain,
        }
        .encode();
        let offset = state.append_offset;
        let mut buf = Vec::with_capacity(ENTRY_HEADER_LEN + payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);
        self.io.write_at(offset, &buf)?;
        state.prev_chain = next_chain(state.prev_chain, &header, payload);
        state.append_offset += buf.len() as u64;
        state.last_tx = Some(tx_id);
        state.stats.entries_appended += 1;
        state.stats.bytes_appended += buf.len() as u64;
        debug!(
            tx_id = tx_id.0,
            offset,
            bytes = buf.len(),
            "command_log.append"
        );
        Ok(offset)
    }

    /// Syncs appended entries to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Creates an iterator over the intact entries.
    pub fn iter(&self) -> Result<LogIterator> {
        let len = self.io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            return Err(SombraError::Corruption("command log truncated header"));
        }
        let mut header_buf = [0u8; FILE_HEADER_LEN];
        self.io.read_at(0, &mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;
        Ok(LogIterator {
            io: Arc::clone(&self.io),
            offset: FILE_HEADER_LEN as u64,
            end: len,
            prev_chain: 0,
            valid_up_to: FILE_HEADER_LEN as u64,
            start_tx: header.start_tx,
        })
    }

    /// Cuts the file at `offset`, dropping everything after it.
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        let offset = offset.max(FILE_HEADER_LEN as u64);
        let state = self.state.lock();
        if offset != state.append_offset {
            return Err(SombraError::Invalid(
                "command log can only be truncated at its append offset",
            ));
        }
        self.io.truncate(offset)?;
        self.io.sync_all()
    }

    /// Id of the last intact entry, if any.
    pub fn last_tx_id(&self) -> Option<TxId> {
        self.state.lock().last_tx
    }

    /// Offset the next entry will be written at.
    pub fn append_offset(&self) -> u64 {
        self.state.lock().append_offset
    }

    /// Returns current statistics for this log.
    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }
}

/// Iterator over intact log entries.
///
/// Stops at the first entry whose header, payload or chain checksum does not
/// verify, or that runs past the end of the file.
pub struct LogIterator {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    prev_chain: u64,
    valid_up_to: u64,
    start_tx: TxId,
}

impl LogIterator {
    /// Reads the next intact entry.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        if self.offset + ENTRY_HEADER_LEN as u64 > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut header_buf = [0u8; ENTRY_HEADER_LEN];
        self.io.read_at(self.offset, &mut header_buf)?;
        let Some(header) = EntryHeader::decode(&header_buf) else {
            self.offset = self.end;
            return Ok(None);
        };
        if header.prev_chain != self.prev_chain || header.tx_id < self.start_tx {
            self.offset = self.end;
            return Ok(None);
        }
        let payload_off = self.offset + ENTRY_HEADER_LEN as u64;
        if payload_off + u64::from(header.payload_len) > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        self.io.read_at(payload_off, &mut payload)?;
        if log_entry_crc32(header.tx_id.0, &payload) != header.payload_crc32 {
            self.offset = self.end;
            return Ok(None);
        }
        self.prev_chain = next_chain(self.prev_chain, &header_buf, &payload);
        self.offset = payload_off + payload.len() as u64;
        self.valid_up_to = self.offset;
        Ok(Some(LogEntry {
            tx_id: header.tx_id,
            payload,
        }))
    }

    /// Returns the file offset up to which entries have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }
}

/// CRC32 over an entry's transaction id followed by its payload.
fn log_entry_crc32(tx_id: u64, payload: &[u8]) -> u32 {
    compute_crc32(&[&tx_id.to_be_bytes(), payload])
}

fn compute_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

fn be_u32(src: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    u32::from_be_bytes(buf)
}

fn be_u64(src: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    u64::from_be_bytes(buf)
}
