pub mod redo;

pub use redo::{redo, replay};

use crate::error::{Error, Result};
use crate::storage::page::{BlockNumber, Lsn, OffsetNumber};
use bincode::{Decode, Encode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FRAME_OVERHEAD: usize = 8;
const MAX_FRAME_BODY: usize = 1024 * 1024;

/// Redo records for every change the range map makes to index pages.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum BrinWalRecord {
    /// Metapage written at block 0 of a new index.
    CreateIndex { pages_per_range: u32, is_ao: bool },
    /// A revmap page added at `target_blk`. For append-only indexes the page is
    /// appended to the chain of `block_seq`, after `prev_tail` if the chain was not empty.
    RevmapExtend {
        target_blk: BlockNumber,
        is_ao: bool,
        block_seq: u32,
        logical_page_num: u32,
        prev_tail: BlockNumber,
    },
    /// A new summary tuple placed at `(reg_blk, offset)` and linked from the revmap.
    Insert {
        heap_blk: BlockNumber,
        pages_per_range: u32,
        is_ao: bool,
        revmap_blk: BlockNumber,
        reg_blk: BlockNumber,
        offset: OffsetNumber,
        tuple: Vec<u8>,
        init_page: bool,
    },
    /// A summary tuple moved to a new location, either to replace it or to
    /// clear a regular page that is being turned into a revmap page.
    Update {
        heap_blk: BlockNumber,
        pages_per_range: u32,
        is_ao: bool,
        revmap_blk: BlockNumber,
        old_blk: BlockNumber,
        old_offset: OffsetNumber,
        new_blk: BlockNumber,
        new_offset: OffsetNumber,
        tuple: Vec<u8>,
        init_page: bool,
    },
    /// The summary of one range removed: revmap pointer cleared, tuple deleted.
    Desummarize {
        pages_per_range: u32,
        is_ao: bool,
        heap_blk: BlockNumber,
        revmap_blk: BlockNumber,
        reg_blk: BlockNumber,
        reg_offset: OffsetNumber,
    },
}

impl BrinWalRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            BrinWalRecord::CreateIndex { .. } => "create_index",
            BrinWalRecord::RevmapExtend { .. } => "revmap_extend",
            BrinWalRecord::Insert { .. } => "insert",
            BrinWalRecord::Update { .. } => "update",
            BrinWalRecord::Desummarize { .. } => "desummarize",
        }
    }
}

/// Encode one record as `len | bincode(body) | crc32(body)`.
pub fn encode_frame(record: &BrinWalRecord) -> Result<Bytes> {
    let body = bincode::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let mut frame = BytesMut::with_capacity(body.len() + FRAME_OVERHEAD);
    frame.put_u32_le(body.len() as u32);
    frame.put_slice(&body);
    frame.put_u32_le(crc32fast::hash(&body));
    Ok(frame.freeze())
}

/// Decode the frame at the front of `buf`, advancing past it.
/// Returns `Ok(None)` when `buf` holds no complete frame (clean end or torn tail).
pub fn decode_frame(buf: &mut Bytes) -> Result<Option<BrinWalRecord>> {
    if buf.remaining() < FRAME_OVERHEAD {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 || len > MAX_FRAME_BODY {
        return Err(Error::Wal(format!("invalid frame length {len}")));
    }
    if buf.remaining() < len + FRAME_OVERHEAD {
        return Ok(None);
    }
    buf.advance(4);
    let body = buf.split_to(len);
    let expected = buf.get_u32_le();
    let found = crc32fast::hash(&body);
    if expected != found {
        return Err(Error::Wal(format!(
            "checksum mismatch: expected {expected:08x}, found {found:08x}"
        )));
    }
    let (record, _) = bincode::decode_from_slice(&body, bincode::config::standard())
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(Some(record))
}

/// Decode every frame of a log image. LSNs are the end offsets of each frame.
pub fn decode_log(image: Bytes) -> Result<Vec<(Lsn, BrinWalRecord)>> {
    let total = image.len();
    let mut buf = image;
    let mut records = Vec::new();
    while let Some(record) = decode_frame(&mut buf)? {
        records.push(((total - buf.remaining()) as Lsn, record));
    }
    if buf.has_remaining() {
        warn!(bytes = buf.remaining(), "ignoring torn WAL tail");
    }
    Ok(records)
}

/// Destination for redo records. The returned LSN is stamped on every page the
/// record touches and is strictly increasing.
pub trait WalSink: Send + Sync + std::fmt::Debug {
    fn log(&self, record: BrinWalRecord) -> Result<Lsn>;
}

/// WAL kept in memory as a contiguous frame stream.
#[derive(Debug, Default)]
pub struct MemoryWal {
    log: Mutex<BytesMut>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self) -> Bytes {
        Bytes::copy_from_slice(&self.log.lock())
    }

    pub fn records(&self) -> Result<Vec<(Lsn, BrinWalRecord)>> {
        decode_log(self.image())
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}

impl WalSink for MemoryWal {
    fn log(&self, record: BrinWalRecord) -> Result<Lsn> {
        let frame = encode_frame(&record)?;
        let mut log = self.log.lock();
        log.extend_from_slice(&frame);
        let lsn = log.len() as Lsn;
        debug!(kind = record.kind(), lsn, "wal record");
        Ok(lsn)
    }
}

/// Append-only WAL file. Every record is flushed before its LSN is returned.
#[derive(Debug)]
pub struct FileWal {
    path: PathBuf,
    file: Mutex<(File, Lsn)>,
}

impl FileWal {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new((file, 0)),
        })
    }

    /// Open an existing log for appending; the next LSN continues after its last byte.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().append(true).read(true).open(path)?;
        let end = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new((file, end)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(path: &Path) -> Result<Vec<(Lsn, BrinWalRecord)>> {
        let mut image = Vec::new();
        File::open(path)?.read_to_end(&mut image)?;
        decode_log(Bytes::from(image))
    }
}

impl WalSink for FileWal {
    fn log(&self, record: BrinWalRecord) -> Result<Lsn> {
        let frame = encode_frame(&record)?;
        let mut guard = self.file.lock();
        let (file, end) = &mut *guard;
        file.write_all(&frame)?;
        file.sync_data()?;
        *end += frame.len() as Lsn;
        debug!(kind = record.kind(), lsn = *end, "wal record");
        Ok(*end)
    }
}
