//! Physical layout of a BRIN index: page type tags, the special area, the metapage
//! and the block arithmetic that maps heap blocks onto revmap slots.
//!
//! Block 0 is always the metapage. For heap tables the revmap pages follow it
//! contiguously. For append-only tables each block sequence owns its own chain of
//! revmap pages, allocated wherever the relation ended at the time.

use crate::error::{Error, Result};
use crate::storage::page::{BlockNumber, OffsetNumber, Page, BLCKSZ, INVALID_BLOCK, PAGE_HEADER_SIZE};
use serde::{Deserialize, Serialize};

pub const BRIN_PAGETYPE_META: u16 = 0xF091;
pub const BRIN_PAGETYPE_REVMAP: u16 = 0xF092;
pub const BRIN_PAGETYPE_REGULAR: u16 = 0xF093;

pub const BRIN_EVACUATE_PAGE: u16 = 1 << 0;

pub const BRIN_META_MAGIC: u32 = 0xA810_9CFA;
pub const BRIN_CURRENT_VERSION: u32 = 1;
pub const BRIN_METAPAGE_BLKNO: BlockNumber = 0;

pub const BRIN_DEFAULT_PAGES_PER_RANGE: u32 = 32;
pub const BRIN_DEFAULT_PAGES_PER_RANGE_AO: u32 = 1;

/// Number of concurrent insertion streams (block sequences) an append-only table can have.
pub const MAX_AOREL_CONCURRENCY: usize = 128;

/// logical page number (u32) + next revmap page (u32) + four u16 slots (flags, type last).
pub const BRIN_SPECIAL_SIZE: usize = 16;

const ITEM_POINTER_SIZE: usize = 6;

pub const REVMAP_CONTENT_SIZE: usize = BLCKSZ - PAGE_HEADER_SIZE - BRIN_SPECIAL_SIZE;
pub const REVMAP_PAGE_MAXITEMS: u32 = (REVMAP_CONTENT_SIZE / ITEM_POINTER_SIZE) as u32;

/// Append-only block numbers carry the block sequence in their top bits.
const AO_BLOCK_SEQUENCE_SHIFT: u32 = 25;

pub type LogicalPageNum = u32;
pub const INVALID_LOGICAL_PAGE: LogicalPageNum = 0;

const CHAIN_INFO_SIZE: usize = 12;
const META_FIXED_SIZE: usize = 20;
pub const META_DATA_SIZE: usize = META_FIXED_SIZE + MAX_AOREL_CONCURRENCY * CHAIN_INFO_SIZE;

// Special area offsets, all relative to the end of the page.
const SPECIAL_LOGICAL_PAGE: usize = BLCKSZ - 16;
const SPECIAL_NEXT_REVMAP: usize = BLCKSZ - 12;
const SPECIAL_FLAGS: usize = BLCKSZ - 4;
const SPECIAL_TYPE: usize = BLCKSZ - 2;

/// 6-byte tuple identifier: block split into two halves plus a 1-based offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemPointer {
    pub block: BlockNumber,
    pub offset: OffsetNumber,
}

impl ItemPointer {
    pub const INVALID: ItemPointer = ItemPointer {
        block: INVALID_BLOCK,
        offset: 0,
    };

    pub fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }

    pub fn is_valid(&self) -> bool {
        self.offset != 0
    }

    fn read(page: &Page, at: usize) -> Self {
        let hi = page.read_u16(at) as u32;
        let lo = page.read_u16(at + 2) as u32;
        Self {
            block: (hi << 16) | lo,
            offset: page.read_u16(at + 4),
        }
    }

    fn write(&self, page: &mut Page, at: usize) {
        page.write_u16(at, (self.block >> 16) as u16);
        page.write_u16(at + 2, (self.block & 0xFFFF) as u16);
        page.write_u16(at + 4, self.offset);
    }
}

/// Per block-sequence bookkeeping for append-only revmap chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub first_page: BlockNumber,
    pub last_page: BlockNumber,
    pub last_logical_page_num: LogicalPageNum,
}

impl Default for ChainInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl ChainInfo {
    pub const EMPTY: ChainInfo = ChainInfo {
        first_page: INVALID_BLOCK,
        last_page: INVALID_BLOCK,
        last_logical_page_num: INVALID_LOGICAL_PAGE,
    };

    pub fn is_empty(&self) -> bool {
        self.first_page == INVALID_BLOCK
    }
}

/// Contents of the metapage, stored right after the page header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPageData {
    pub magic: u32,
    pub version: u32,
    pub pages_per_range: u32,
    pub last_revmap_page: BlockNumber,
    pub is_ao: bool,
    pub chains: [ChainInfo; MAX_AOREL_CONCURRENCY],
}

impl MetaPageData {
    pub fn new(pages_per_range: u32, is_ao: bool) -> Self {
        Self {
            magic: BRIN_META_MAGIC,
            version: BRIN_CURRENT_VERSION,
            pages_per_range,
            last_revmap_page: BRIN_METAPAGE_BLKNO,
            is_ao,
            chains: [ChainInfo::EMPTY; MAX_AOREL_CONCURRENCY],
        }
    }

    pub fn read(page: &Page, index: &str, block: BlockNumber) -> Result<Self> {
        let page_type = page_type(page);
        if page_type != BRIN_PAGETYPE_META {
            return Err(Error::UnexpectedPageType {
                index: index.to_string(),
                block,
                page_type,
            });
        }
        let base = PAGE_HEADER_SIZE;
        let magic = page.read_u32(base);
        if magic != BRIN_META_MAGIC {
            return Err(Error::IndexCorrupted {
                index: index.to_string(),
                block,
                reason: format!("bad metapage magic 0x{magic:08X}"),
            });
        }
        let mut chains = [ChainInfo::EMPTY; MAX_AOREL_CONCURRENCY];
        for (slot, chain) in chains.iter_mut().enumerate() {
            let at = base + META_FIXED_SIZE + slot * CHAIN_INFO_SIZE;
            *chain = ChainInfo {
                first_page: page.read_u32(at),
                last_page: page.read_u32(at + 4),
                last_logical_page_num: page.read_u32(at + 8),
            };
        }
        Ok(Self {
            magic,
            version: page.read_u32(base + 4),
            pages_per_range: page.read_u32(base + 8),
            last_revmap_page: page.read_u32(base + 12),
            is_ao: page.bytes(base + 16, 1)[0] != 0,
            chains,
        })
    }

    /// Write the metadata and move `pd_lower` just past it so page compression keeps it.
    pub fn write(&self, page: &mut Page) {
        let base = PAGE_HEADER_SIZE;
        page.write_u32(base, self.magic);
        page.write_u32(base + 4, self.version);
        page.write_u32(base + 8, self.pages_per_range);
        page.write_u32(base + 12, self.last_revmap_page);
        page.bytes_mut(base + 16, 4).copy_from_slice(&[self.is_ao as u8, 0, 0, 0]);
        for (slot, chain) in self.chains.iter().enumerate() {
            let at = base + META_FIXED_SIZE + slot * CHAIN_INFO_SIZE;
            page.write_u32(at, chain.first_page);
            page.write_u32(at + 4, chain.last_page);
            page.write_u32(at + 8, chain.last_logical_page_num);
        }
        page.set_lower((PAGE_HEADER_SIZE + META_DATA_SIZE) as u16);
    }
}

pub fn page_type(page: &Page) -> u16 {
    page.read_u16(SPECIAL_TYPE)
}

pub fn page_flags(page: &Page) -> u16 {
    page.read_u16(SPECIAL_FLAGS)
}

pub fn set_page_flags(page: &mut Page, flags: u16) {
    page.write_u16(SPECIAL_FLAGS, flags);
}

pub fn logical_page_num(page: &Page) -> LogicalPageNum {
    page.read_u32(SPECIAL_LOGICAL_PAGE)
}

pub fn set_logical_page_num(page: &mut Page, num: LogicalPageNum) {
    page.write_u32(SPECIAL_LOGICAL_PAGE, num);
}

pub fn next_revmap_page(page: &Page) -> BlockNumber {
    page.read_u32(SPECIAL_NEXT_REVMAP)
}

pub fn set_next_revmap_page(page: &mut Page, block: BlockNumber) {
    page.write_u32(SPECIAL_NEXT_REVMAP, block);
}

pub fn is_regular_page(page: &Page) -> bool {
    page_type(page) == BRIN_PAGETYPE_REGULAR
}

pub fn is_revmap_page(page: &Page) -> bool {
    page_type(page) == BRIN_PAGETYPE_REVMAP
}

/// Initialise `page` as an empty BRIN page of the given type.
pub fn brin_page_init(page: &mut Page, page_type: u16) {
    page.init(BRIN_SPECIAL_SIZE);
    page.write_u16(SPECIAL_TYPE, page_type);
    if page_type == BRIN_PAGETYPE_REVMAP {
        set_next_revmap_page(page, INVALID_BLOCK);
    }
}

pub fn metapage_init(page: &mut Page, pages_per_range: u32, is_ao: bool) {
    brin_page_init(page, BRIN_PAGETYPE_META);
    MetaPageData::new(pages_per_range, is_ao).write(page);
}

pub fn revmap_item_pointer(page: &Page, index: u32) -> ItemPointer {
    ItemPointer::read(page, PAGE_HEADER_SIZE + index as usize * ITEM_POINTER_SIZE)
}

pub fn set_revmap_item_pointer(page: &mut Page, index: u32, tid: ItemPointer) {
    let tid = if tid.is_valid() { tid } else { ItemPointer::INVALID };
    tid.write(page, PAGE_HEADER_SIZE + index as usize * ITEM_POINTER_SIZE);
}

/// Revmap block holding the entry for `heap_blk` in a heap table (block 0 is the metapage).
pub fn heap_block_to_revmap_block(pages_per_range: u32, heap_blk: BlockNumber) -> BlockNumber {
    heap_blk / pages_per_range / REVMAP_PAGE_MAXITEMS + 1
}

pub fn block_sequence_of(heap_blk: BlockNumber) -> usize {
    (heap_blk >> AO_BLOCK_SEQUENCE_SHIFT) as usize
}

pub fn block_sequence_start(seq: usize) -> BlockNumber {
    (seq as BlockNumber) << AO_BLOCK_SEQUENCE_SHIFT
}

/// 1-based logical page number, within its block sequence's chain, of the revmap page for `heap_blk`.
pub fn heap_block_to_logical_page(pages_per_range: u32, heap_blk: BlockNumber) -> LogicalPageNum {
    let start = block_sequence_start(block_sequence_of(heap_blk));
    (heap_blk - start) / pages_per_range / REVMAP_PAGE_MAXITEMS + 1
}

/// Range addressing policy of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeAddressing {
    pub pages_per_range: u32,
    pub is_ao: bool,
}

impl RangeAddressing {
    pub fn new(pages_per_range: u32, is_ao: bool) -> Self {
        Self {
            pages_per_range,
            is_ao,
        }
    }

    /// Normalise `heap_blk` to the first block of the range covering it.
    pub fn range_start(&self, heap_blk: BlockNumber) -> BlockNumber {
        let ppr = self.pages_per_range;
        if self.is_ao {
            let start = block_sequence_start(block_sequence_of(heap_blk));
            start + ((heap_blk - start) / ppr) * ppr
        } else {
            (heap_blk / ppr) * ppr
        }
    }

    /// Slot within its revmap page. Append-only ranges count from their sequence start.
    pub fn revmap_index(&self, heap_blk: BlockNumber) -> u32 {
        let relative = if self.is_ao {
            heap_blk - block_sequence_start(block_sequence_of(heap_blk))
        } else {
            heap_blk
        };
        (relative / self.pages_per_range) % REVMAP_PAGE_MAXITEMS
    }

    pub fn heap_revmap_block(&self, heap_blk: BlockNumber) -> BlockNumber {
        heap_block_to_revmap_block(self.pages_per_range, heap_blk)
    }

    pub fn logical_page(&self, heap_blk: BlockNumber) -> LogicalPageNum {
        heap_block_to_logical_page(self.pages_per_range, heap_blk)
    }
}

pub fn default_pages_per_range(is_ao: bool) -> u32 {
    if is_ao {
        BRIN_DEFAULT_PAGES_PER_RANGE_AO
    } else {
        BRIN_DEFAULT_PAGES_PER_RANGE
    }
}
