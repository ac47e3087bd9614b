//! Range map: maps the first heap block of every page range to the location of its
//! summary tuple.
//!
//! Heap indexes keep their revmap pages contiguous right after the metapage, so the
//! revmap block for a range is pure arithmetic. Append-only indexes keep one chain of
//! revmap pages per block sequence; see `chain.rs` for how those are walked and grown.

use crate::brin::layout::{
    block_sequence_of, brin_page_init, is_regular_page, is_revmap_page, page_type,
    revmap_item_pointer, set_revmap_item_pointer, ChainInfo, ItemPointer, LogicalPageNum,
    MetaPageData, RangeAddressing, BRIN_METAPAGE_BLKNO, BRIN_PAGETYPE_REVMAP, INVALID_LOGICAL_PAGE,
    MAX_AOREL_CONCURRENCY,
};
use crate::brin::pageops::{evacuate_page, start_evacuating_page};
use crate::brin::tuple::BrinTuple;
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::storage::buffer::{Buffer, PageWriteGuard};
use crate::storage::page::{BlockNumber, OffsetNumber, Page, INVALID_BLOCK};
use crate::storage::relation::IndexRelation;
use crate::wal::BrinWalRecord;
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of one optimistic attempt to grow the revmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended(BlockNumber),
    /// Cached metadata was stale or the page was in use; state has been refreshed.
    Retry,
}

/// Position of the append-only chain iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainIterator {
    pub block_sequence: Option<usize>,
    pub revmap_page: BlockNumber,
    pub logical_page_num: LogicalPageNum,
}

impl Default for ChainIterator {
    fn default() -> Self {
        Self {
            block_sequence: None,
            revmap_page: INVALID_BLOCK,
            logical_page_num: INVALID_LOGICAL_PAGE,
        }
    }
}

/// A summary tuple fetched through the revmap, copied out of its page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundSummary {
    pub block: BlockNumber,
    pub offset: OffsetNumber,
    pub tuple: BrinTuple,
}

impl FoundSummary {
    pub fn item_pointer(&self) -> ItemPointer {
        ItemPointer::new(self.block, self.offset)
    }
}

/// Access object over the revmap of one index. Holds a pin on the metapage for its
/// whole life and at most one pinned revmap page; both are released on drop.
#[derive(Debug)]
pub struct RevmapAccessor {
    pub(crate) rel: Arc<IndexRelation>,
    pub(crate) meta_buf: Buffer,
    pub(crate) addressing: RangeAddressing,
    pub(crate) last_revmap_page: BlockNumber,
    pub(crate) chains: [ChainInfo; MAX_AOREL_CONCURRENCY],
    pub(crate) iter: ChainIterator,
    pub(crate) current: Option<Buffer>,
    pub(crate) interrupt: Interrupt,
}

impl RevmapAccessor {
    pub fn initialize(rel: Arc<IndexRelation>) -> Result<Self> {
        Self::with_interrupt(rel, Interrupt::new())
    }

    pub fn with_interrupt(rel: Arc<IndexRelation>, interrupt: Interrupt) -> Result<Self> {
        let meta_buf = rel.buffers().read_buffer(BRIN_METAPAGE_BLKNO)?;
        let meta = {
            let page = meta_buf.lock_shared();
            MetaPageData::read(&page, rel.name(), BRIN_METAPAGE_BLKNO)?
        };
        Ok(Self {
            rel,
            meta_buf,
            addressing: RangeAddressing::new(meta.pages_per_range, meta.is_ao),
            last_revmap_page: meta.last_revmap_page,
            chains: meta.chains,
            iter: ChainIterator::default(),
            current: None,
            interrupt,
        })
    }

    pub fn relation(&self) -> &Arc<IndexRelation> {
        &self.rel
    }

    pub fn pages_per_range(&self) -> u32 {
        self.addressing.pages_per_range
    }

    pub fn is_ao(&self) -> bool {
        self.addressing.is_ao
    }

    pub fn addressing(&self) -> RangeAddressing {
        self.addressing
    }

    pub fn last_revmap_page(&self) -> BlockNumber {
        self.last_revmap_page
    }

    pub fn iterator(&self) -> ChainIterator {
        self.iter
    }

    /// Cached chain bookkeeping for one block sequence.
    pub fn chain(&self, seq: usize) -> Result<ChainInfo> {
        self.chains.get(seq).copied().ok_or(Error::InvalidSlot(seq))
    }

    pub(crate) fn corrupted(&self, block: BlockNumber, reason: impl Into<String>) -> Error {
        Error::IndexCorrupted {
            index: self.rel.name().to_string(),
            block,
            reason: reason.into(),
        }
    }

    pub(crate) fn unexpected_page(&self, block: BlockNumber, page: &Page) -> Error {
        Error::UnexpectedPageType {
            index: self.rel.name().to_string(),
            block,
            page_type: page_type(page),
        }
    }

    pub(crate) fn release_current(&mut self) {
        self.current = None;
    }

    /// Physical revmap block for `heap_blk`, or `None` if the revmap does not reach it yet.
    pub fn lookup(&mut self, heap_blk: BlockNumber) -> Result<Option<BlockNumber>> {
        if !self.is_ao() {
            let target = self.addressing.heap_revmap_block(heap_blk);
            return Ok((target <= self.last_revmap_page).then_some(target));
        }

        let seq = block_sequence_of(heap_blk);
        let target = self.addressing.logical_page(heap_blk);
        if self.iter.block_sequence != Some(seq) || self.iter.logical_page_num > target {
            self.position_at_start(seq)?;
        }
        self.advance_to_logical_page(target)
    }

    /// Grow the revmap until it covers `heap_blk` and return the covering revmap block.
    pub fn ensure_extended(&mut self, heap_blk: BlockNumber) -> Result<BlockNumber> {
        if !self.is_ao() {
            let target = self.addressing.heap_revmap_block(heap_blk);
            while target > self.last_revmap_page {
                self.interrupt.check()?;
                if self.extend_heap_one_page()? == ExtendOutcome::Retry {
                    trace!(index = self.rel.name(), target, "retrying revmap extension");
                }
            }
            return Ok(target);
        }

        let seq = block_sequence_of(heap_blk);
        if let Some(block) = self.lookup(heap_blk)? {
            return Ok(block);
        }
        // chains are dense: every logical page up to the tail has a revmap page
        let target = self.addressing.logical_page(heap_blk);
        self.position_at_end(seq)?;
        while target > self.iter.logical_page_num {
            self.interrupt.check()?;
            let next = self.iter.logical_page_num + 1;
            if self.extend_chain(seq, next)? == ExtendOutcome::Retry {
                trace!(index = self.rel.name(), seq, target, "retrying revmap chain extension");
            }
            self.position_at_end(seq)?;
        }
        match self.lookup(heap_blk)? {
            Some(block) => Ok(block),
            None => Err(self.corrupted(
                self.iter.revmap_page,
                format!("revmap chain of block sequence {seq} has no logical page {target}"),
            )),
        }
    }

    /// Try to add the next contiguous revmap page of a heap index.
    pub fn extend_heap_one_page(&mut self) -> Result<ExtendOutcome> {
        let meta_buf = self.meta_buf.clone();
        let mut meta_page = meta_buf.lock_exclusive();
        let mut meta = MetaPageData::read(&meta_page, self.rel.name(), BRIN_METAPAGE_BLKNO)?;

        if meta.last_revmap_page != self.last_revmap_page {
            debug!(
                index = self.rel.name(),
                cached = self.last_revmap_page,
                actual = meta.last_revmap_page,
                "stale revmap length"
            );
            self.last_revmap_page = meta.last_revmap_page;
            return Ok(ExtendOutcome::Retry);
        }

        let map_blk = meta.last_revmap_page + 1;
        let buffers = self.rel.buffers();
        let buf = if map_blk < buffers.number_of_blocks() {
            buffers.read_buffer(map_blk)?
        } else {
            let buf = buffers.allocate_new_page()?;
            if buf.block_number() != map_blk {
                // somebody extended the relation after we read its length
                debug!(index = self.rel.name(), map_blk, got = buf.block_number(), "lost extension race");
                return Ok(ExtendOutcome::Retry);
            }
            buf
        };

        let mut page = buf.lock_exclusive();
        if !page.is_new() && !is_regular_page(&page) {
            return Err(self.unexpected_page(map_blk, &page));
        }

        if start_evacuating_page(&mut page) {
            buf.mark_dirty();
            drop(meta_page);
            debug!(index = self.rel.name(), block = map_blk, "evacuating regular page for revmap");
            evacuate_page(self, buf, page)?;
            return Ok(ExtendOutcome::Retry);
        }

        brin_page_init(&mut page, BRIN_PAGETYPE_REVMAP);
        meta.last_revmap_page = map_blk;
        meta.write(&mut meta_page);
        buf.mark_dirty();
        meta_buf.mark_dirty();

        let record = BrinWalRecord::RevmapExtend {
            target_blk: map_blk,
            is_ao: false,
            block_seq: 0,
            logical_page_num: INVALID_LOGICAL_PAGE,
            prev_tail: INVALID_BLOCK,
        };
        if let Some(lsn) = self.rel.log(record)? {
            meta_page.set_lsn(lsn);
            page.set_lsn(lsn);
        }

        self.last_revmap_page = map_blk;
        debug!(index = self.rel.name(), block = map_blk, "revmap extended");
        Ok(ExtendOutcome::Extended(map_blk))
    }

    /// Pin `block` as the current revmap buffer, reusing the existing pin when possible.
    pub(crate) fn revmap_buffer(&mut self, block: BlockNumber) -> Result<Buffer> {
        if let Some(buf) = &self.current {
            if buf.block_number() == block {
                return Ok(buf.clone());
            }
        }
        let buf = self.rel.buffers().read_buffer(block)?;
        self.current = Some(buf.clone());
        Ok(buf)
    }

    /// Exclusively lock the revmap page covering `heap_blk`. The revmap must already
    /// have been extended to cover it.
    pub fn lock_revmap_page_for_update(
        &mut self,
        heap_blk: BlockNumber,
    ) -> Result<(Buffer, PageWriteGuard)> {
        let block = self
            .lookup(heap_blk)?
            .ok_or(Error::RevmapNotCovering(heap_blk))?;
        let buf = self.revmap_buffer(block)?;
        let page = buf.lock_exclusive();
        if !is_revmap_page(&page) {
            return Err(self.unexpected_page(block, &page));
        }
        Ok((buf, page))
    }

    /// Fetch the summary tuple of the range containing `heap_blk`.
    ///
    /// Returns `None` when the range has never been summarised or was desummarised
    /// concurrently. A revmap entry that keeps pointing at the same wrong tuple is
    /// reported as corruption.
    pub fn get_tuple_for_heap_block(&mut self, heap_blk: BlockNumber) -> Result<Option<FoundSummary>> {
        let heap_blk = self.addressing.range_start(heap_blk);
        let map_blk = match self.lookup(heap_blk)? {
            Some(block) => block,
            None => return Ok(None),
        };
        let index = self.addressing.revmap_index(heap_blk);
        let mut previous: Option<ItemPointer> = None;

        loop {
            self.interrupt.check()?;

            let revmap_buf = self.revmap_buffer(map_blk)?;
            let tid = {
                let page = revmap_buf.lock_shared();
                if !is_revmap_page(&page) {
                    return Err(self.unexpected_page(map_blk, &page));
                }
                revmap_item_pointer(&page, index)
            };
            if !tid.is_valid() {
                return Ok(None);
            }
            if previous == Some(tid) {
                return Err(self.corrupted(map_blk, "inconsistent range map"));
            }
            previous = Some(tid);

            let reg_buf = self.rel.buffers().read_buffer(tid.block)?;
            let page = reg_buf.lock_shared();
            if is_regular_page(&page) {
                if tid.offset > page.max_offset_number() {
                    return Ok(None);
                }
                let tuple = page.item(tid.offset).and_then(BrinTuple::decode);
                if let Some(tuple) = tuple.filter(|t| t.heap_blk == heap_blk) {
                    return Ok(Some(FoundSummary {
                        block: tid.block,
                        offset: tid.offset,
                        tuple,
                    }));
                }
            }
            trace!(index = self.rel.name(), heap_blk, ?tid, "stale revmap entry, retrying");
        }
    }
}

/// Point the revmap entry for `heap_blk` at `tid` (or clear it with an invalid TID).
/// Shared by normal operation and redo.
pub fn set_heap_block_item_pointer(
    page: &mut Page,
    pages_per_range: u32,
    heap_blk: BlockNumber,
    tid: ItemPointer,
    is_ao: bool,
) {
    let index = RangeAddressing::new(pages_per_range, is_ao).revmap_index(heap_blk);
    set_revmap_item_pointer(page, index, tid);
}

/// Remove the summary of the range containing `heap_blk`.
///
/// Returns `Ok(true)` when the range is now unsummarised (including when it never was)
/// and `Ok(false)` when a concurrent change got in the way and the caller should retry.
pub fn desummarize_range(rel: &Arc<IndexRelation>, heap_blk: BlockNumber) -> Result<bool> {
    let mut revmap = RevmapAccessor::initialize(rel.clone())?;
    let heap_blk = revmap.addressing.range_start(heap_blk);
    if revmap.is_ao() {
        revmap.position_at_start(block_sequence_of(heap_blk))?;
    }

    let revmap_blk = match revmap.lookup(heap_blk)? {
        Some(block) => block,
        None => return Ok(true),
    };
    let index = revmap.addressing.revmap_index(heap_blk);
    let tid = {
        let buf = revmap.revmap_buffer(revmap_blk)?;
        let page = buf.lock_shared();
        if !is_revmap_page(&page) {
            return Err(revmap.unexpected_page(revmap_blk, &page));
        }
        revmap_item_pointer(&page, index)
    };
    if !tid.is_valid() {
        return Ok(true);
    }

    let reg_buf = rel.buffers().read_buffer(tid.block)?;
    let mut reg_page = reg_buf.lock_exclusive();
    if !is_regular_page(&reg_page) {
        return Ok(false);
    }
    let (revmap_buf, mut revmap_page) = revmap.lock_revmap_page_for_update(heap_blk)?;
    if revmap_item_pointer(&revmap_page, index) != tid {
        return Ok(false);
    }

    if tid.offset > reg_page.max_offset_number() || !reg_page.item_id(tid.offset).is_used() {
        return Err(revmap.corrupted(tid.block, "inconsistent range map"));
    }

    set_revmap_item_pointer(&mut revmap_page, index, ItemPointer::INVALID);
    reg_page.delete_item_no_compact(tid.offset);
    reg_buf.mark_dirty();
    revmap_buf.mark_dirty();

    let record = BrinWalRecord::Desummarize {
        pages_per_range: revmap.pages_per_range(),
        is_ao: revmap.is_ao(),
        heap_blk,
        revmap_blk,
        reg_blk: tid.block,
        reg_offset: tid.offset,
    };
    if let Some(lsn) = rel.log(record)? {
        revmap_page.set_lsn(lsn);
        reg_page.set_lsn(lsn);
    }
    debug!(index = rel.name(), heap_blk, "range desummarized");
    Ok(true)
}
