//! Revmap chains of append-only indexes.
//!
//! Every block sequence of an append-only table gets its own singly linked list of
//! revmap pages. Pages are appended at the physical end of the index and carry a
//! logical page number that strictly increases along the chain. Extension through
//! `ensure_extended` keeps the numbers dense, starting at 1, so ranges can be
//! summarized in any order.

use crate::brin::layout::{
    brin_page_init, is_revmap_page, logical_page_num, next_revmap_page, set_logical_page_num,
    set_next_revmap_page, LogicalPageNum, MetaPageData, BRIN_METAPAGE_BLKNO, BRIN_PAGETYPE_REVMAP,
    INVALID_LOGICAL_PAGE, MAX_AOREL_CONCURRENCY,
};
use crate::brin::revmap::{ChainIterator, ExtendOutcome, RevmapAccessor};
use crate::error::{Error, Result};
use crate::storage::page::{BlockNumber, INVALID_BLOCK};
use crate::wal::BrinWalRecord;
use tracing::debug;

impl RevmapAccessor {
    fn check_slot(seq: usize) -> Result<()> {
        if seq >= MAX_AOREL_CONCURRENCY {
            return Err(Error::InvalidSlot(seq));
        }
        Ok(())
    }

    /// Point the iterator at the first page of the chain for `seq`. Briefly share-locks
    /// that page to learn its logical page number.
    pub fn position_at_start(&mut self, seq: usize) -> Result<()> {
        Self::check_slot(seq)?;
        self.release_current();
        let first = self.chains[seq].first_page;
        let logical = if first == INVALID_BLOCK {
            INVALID_LOGICAL_PAGE
        } else {
            let buf = self.rel.buffers().read_buffer(first)?;
            let page = buf.lock_shared();
            if !is_revmap_page(&page) {
                return Err(self.unexpected_page(first, &page));
            }
            logical_page_num(&page)
        };
        self.iter = ChainIterator {
            block_sequence: Some(seq),
            revmap_page: first,
            logical_page_num: logical,
        };
        Ok(())
    }

    /// Point the iterator at the cached tail of the chain for `seq`. Takes no locks.
    pub fn position_at_end(&mut self, seq: usize) -> Result<()> {
        Self::check_slot(seq)?;
        let chain = self.chains[seq];
        self.iter = ChainIterator {
            block_sequence: Some(seq),
            revmap_page: chain.last_page,
            logical_page_num: chain.last_logical_page_num,
        };
        Ok(())
    }

    /// Walk forward from the iterator until it reaches logical page `target`.
    ///
    /// Pins one chain member at a time. Returns `None` when the chain ends first or
    /// skips over `target`.
    pub fn advance_to_logical_page(&mut self, target: LogicalPageNum) -> Result<Option<BlockNumber>> {
        if self.iter.logical_page_num == INVALID_LOGICAL_PAGE {
            return Ok(None);
        }

        let mut next = self.iter.revmap_page;
        while self.iter.logical_page_num < target && next != INVALID_BLOCK {
            self.interrupt.check()?;

            let buf = self.rel.buffers().read_buffer(next)?;
            let page = buf.lock_shared();
            if !is_revmap_page(&page) {
                return Err(self.unexpected_page(next, &page));
            }
            let logical = logical_page_num(&page);
            if next != self.iter.revmap_page && logical <= self.iter.logical_page_num {
                return Err(self.corrupted(
                    next,
                    format!(
                        "revmap chain goes from logical page {} to {}",
                        self.iter.logical_page_num, logical
                    ),
                ));
            }
            self.iter.revmap_page = next;
            self.iter.logical_page_num = logical;
            next = next_revmap_page(&page);
        }

        Ok((self.iter.logical_page_num == target).then_some(self.iter.revmap_page))
    }

    /// Try to append a revmap page with logical number `target` to the chain of `seq`.
    ///
    /// The cached tail is validated against the metapage under its exclusive lock; a
    /// mismatch refreshes the cache and yields `Retry`.
    pub fn extend_chain(&mut self, seq: usize, target: LogicalPageNum) -> Result<ExtendOutcome> {
        Self::check_slot(seq)?;
        let meta_buf = self.meta_buf.clone();
        let mut meta_page = meta_buf.lock_exclusive();
        let mut meta = MetaPageData::read(&meta_page, self.rel.name(), BRIN_METAPAGE_BLKNO)?;

        if meta.chains[seq].last_page != self.chains[seq].last_page {
            debug!(
                index = self.rel.name(),
                seq,
                cached = self.chains[seq].last_page,
                actual = meta.chains[seq].last_page,
                "stale revmap chain tail"
            );
            self.chains[seq] = meta.chains[seq];
            return Ok(ExtendOutcome::Retry);
        }
        debug_assert!(target > meta.chains[seq].last_logical_page_num);

        let buf = self.rel.buffers().allocate_new_page()?;
        let map_blk = buf.block_number();
        let mut page = buf.lock_exclusive();
        if !page.is_new() {
            return Err(self.unexpected_page(map_blk, &page));
        }

        let prev_tail = meta.chains[seq].last_page;
        let mut tail = if prev_tail != INVALID_BLOCK {
            let tail_buf = self.rel.buffers().read_buffer(prev_tail)?;
            let tail_page = tail_buf.lock_exclusive();
            if !is_revmap_page(&tail_page) {
                return Err(self.unexpected_page(prev_tail, &tail_page));
            }
            Some((tail_buf, tail_page))
        } else {
            None
        };

        brin_page_init(&mut page, BRIN_PAGETYPE_REVMAP);
        set_logical_page_num(&mut page, target);
        buf.mark_dirty();

        match tail.as_mut() {
            Some((tail_buf, tail_page)) => {
                set_next_revmap_page(tail_page, map_blk);
                tail_buf.mark_dirty();
            }
            None => meta.chains[seq].first_page = map_blk,
        }
        meta.chains[seq].last_page = map_blk;
        meta.chains[seq].last_logical_page_num = target;
        meta.write(&mut meta_page);
        meta_buf.mark_dirty();
        self.chains[seq] = meta.chains[seq];

        let record = BrinWalRecord::RevmapExtend {
            target_blk: map_blk,
            is_ao: true,
            block_seq: seq as u32,
            logical_page_num: target,
            prev_tail,
        };
        if let Some(lsn) = self.rel.log(record)? {
            meta_page.set_lsn(lsn);
            page.set_lsn(lsn);
            if let Some((_, tail_page)) = tail.as_mut() {
                tail_page.set_lsn(lsn);
            }
        }

        debug!(index = self.rel.name(), seq, block = map_blk, logical = target, "revmap chain extended");
        Ok(ExtendOutcome::Extended(map_blk))
    }
}
