use crate::error::{Error, Result};
use crate::storage::page::{BlockNumber, Page};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Shared state of one buffered block.
#[derive(Debug)]
pub struct BufferSlot {
    block: BlockNumber,
    page: Arc<RwLock<Page>>,
    pins: AtomicUsize,
    dirty: AtomicBool,
}

impl BufferSlot {
    fn new(block: BlockNumber) -> Self {
        Self {
            block,
            page: Arc::new(RwLock::new(Page::new_zeroed())),
            pins: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
        }
    }
}

/// A pinned buffer. The pin is released when the handle is dropped.
pub struct Buffer {
    slot: Arc<BufferSlot>,
    pinned: Arc<AtomicUsize>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("block", &self.slot.block).finish()
    }
}

impl Buffer {
    fn pin(slot: Arc<BufferSlot>, pinned: Arc<AtomicUsize>) -> Self {
        slot.pins.fetch_add(1, Ordering::AcqRel);
        pinned.fetch_add(1, Ordering::AcqRel);
        Self { slot, pinned }
    }

    pub fn block_number(&self) -> BlockNumber {
        self.slot.block
    }

    pub fn lock_shared(&self) -> PageReadGuard {
        self.slot.page.read_arc()
    }

    pub fn lock_exclusive(&self) -> PageWriteGuard {
        self.slot.page.write_arc()
    }

    pub fn mark_dirty(&self) {
        self.slot.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.slot.dirty.load(Ordering::Acquire)
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Buffer::pin(self.slot.clone(), self.pinned.clone())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.slot.pins.fetch_sub(1, Ordering::AcqRel);
        self.pinned.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Page I/O boundary used by the range map. Implementations must be safe to share
/// between workers extending and reading the same index.
pub trait BufferManager: Send + Sync + fmt::Debug {
    /// Pin an existing block.
    fn read_buffer(&self, block: BlockNumber) -> Result<Buffer>;

    /// Extend the relation by one zeroed page and return it pinned.
    fn allocate_new_page(&self) -> Result<Buffer>;

    /// Current physical length of the relation in blocks.
    fn number_of_blocks(&self) -> BlockNumber;

    /// Pin `block`, extending the relation with empty pages first if needed. Used by redo.
    fn read_buffer_extend(&self, block: BlockNumber) -> Result<Buffer> {
        while self.number_of_blocks() <= block {
            drop(self.allocate_new_page()?);
        }
        self.read_buffer(block)
    }
}

/// In-memory buffer pool holding every block of one relation.
#[derive(Debug, Default)]
pub struct MemoryBufferManager {
    blocks: RwLock<Vec<Arc<BufferSlot>>>,
    extension_lock: Mutex<()>,
    pinned: Arc<AtomicUsize>,
}

impl MemoryBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pins currently held across all blocks.
    pub fn pinned_buffers(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn dirty_blocks(&self) -> Vec<BlockNumber> {
        self.blocks
            .read()
            .iter()
            .filter(|slot| slot.dirty.load(Ordering::Acquire))
            .map(|slot| slot.block)
            .collect()
    }

    /// Copy of every page image, in block order.
    pub fn snapshot(&self) -> Vec<Page> {
        self.blocks
            .read()
            .iter()
            .map(|slot| slot.page.read().clone())
            .collect()
    }
}

impl BufferManager for MemoryBufferManager {
    fn read_buffer(&self, block: BlockNumber) -> Result<Buffer> {
        let blocks = self.blocks.read();
        let slot = blocks
            .get(block as usize)
            .cloned()
            .ok_or(Error::InvalidBlock(block))?;
        Ok(Buffer::pin(slot, self.pinned.clone()))
    }

    fn allocate_new_page(&self) -> Result<Buffer> {
        let _extension = self.extension_lock.lock();
        let mut blocks = self.blocks.write();
        let block = BlockNumber::try_from(blocks.len())
            .map_err(|_| Error::InvalidBlock(BlockNumber::MAX))?;
        let slot = Arc::new(BufferSlot::new(block));
        blocks.push(slot.clone());
        Ok(Buffer::pin(slot, self.pinned.clone()))
    }

    fn number_of_blocks(&self) -> BlockNumber {
        self.blocks.read().len() as BlockNumber
    }
}
