//! Operations on regular BRIN pages: index creation, summary insertion and moves, and
//! the evacuation protocol that frees a regular page so the heap revmap can grow into it.
//!
//! Lock order everywhere: metapage, then regular pages in ascending block order, then
//! the revmap page.

use crate::brin::layout::{
    brin_page_init, is_regular_page, metapage_init, page_flags, revmap_item_pointer,
    set_page_flags, set_revmap_item_pointer, ItemPointer, BRIN_EVACUATE_PAGE,
    BRIN_METAPAGE_BLKNO, BRIN_PAGETYPE_REGULAR, BRIN_SPECIAL_SIZE,
};
use crate::brin::revmap::RevmapAccessor;
use crate::brin::tuple::BrinTuple;
use crate::error::{Error, Result};
use crate::storage::buffer::{Buffer, PageWriteGuard};
use crate::storage::page::{BlockNumber, OffsetNumber, Page, BLCKSZ, INVALID_BLOCK, PAGE_HEADER_SIZE};
use crate::storage::relation::IndexRelation;
use crate::wal::BrinWalRecord;
use tracing::{debug, info};

pub const BRIN_MAX_PAGES_PER_RANGE: u32 = 131_072;

/// Largest encoded summary tuple that fits on an empty regular page.
pub const BRIN_MAX_TUPLE_SIZE: usize = (BLCKSZ - PAGE_HEADER_SIZE - BRIN_SPECIAL_SIZE - 4) & !7;

/// Write the metapage of a new, empty index.
pub fn init_metapage(rel: &IndexRelation, pages_per_range: u32, is_ao: bool) -> Result<()> {
    if pages_per_range == 0 || pages_per_range > BRIN_MAX_PAGES_PER_RANGE {
        return Err(Error::Config(format!(
            "pages_per_range must be between 1 and {BRIN_MAX_PAGES_PER_RANGE}, got {pages_per_range}"
        )));
    }
    let buffers = rel.buffers();
    if buffers.number_of_blocks() != 0 {
        return Err(Error::Config(format!("index \"{}\" is not empty", rel.name())));
    }
    let buf = buffers.allocate_new_page()?;
    if buf.block_number() != BRIN_METAPAGE_BLKNO {
        return Err(Error::InvalidBlock(buf.block_number()));
    }

    let mut page = buf.lock_exclusive();
    metapage_init(&mut page, pages_per_range, is_ao);
    buf.mark_dirty();
    if let Some(lsn) = rel.log(BrinWalRecord::CreateIndex { pages_per_range, is_ao })? {
        page.set_lsn(lsn);
    }
    info!(index = rel.name(), pages_per_range, is_ao, "BRIN index created");
    Ok(())
}

/// Flag a regular page that still holds summaries so no new tuples land on it.
/// Returns `false` when the page holds nothing and can be reused right away.
pub fn start_evacuating_page(page: &mut Page) -> bool {
    if page.is_new() || !page.has_live_items() {
        return false;
    }
    set_page_flags(page, page_flags(page) | BRIN_EVACUATE_PAGE);
    true
}

/// Move every live summary off a page flagged by [`start_evacuating_page`] and
/// repoint the revmap at the new copies.
pub fn evacuate_page(revmap: &mut RevmapAccessor, buf: Buffer, page: PageWriteGuard) -> Result<()> {
    let block = buf.block_number();
    let tuples: Vec<(OffsetNumber, Vec<u8>)> = page
        .live_items()
        .map(|(offset, bytes)| (offset, bytes.to_vec()))
        .collect();
    drop(page);

    for (offset, bytes) in tuples {
        revmap.interrupt.check()?;
        let tuple = BrinTuple::decode(&bytes)
            .ok_or_else(|| revmap.corrupted(block, format!("unreadable summary tuple at offset {offset}")))?;
        let old = ItemPointer::new(block, offset);
        match move_summary(revmap, tuple.heap_blk, old, &bytes)? {
            Some(new) => debug!(index = revmap.rel.name(), heap_blk = tuple.heap_blk, ?old, ?new, "summary evacuated"),
            None => debug!(index = revmap.rel.name(), heap_blk = tuple.heap_blk, ?old, "summary already moved"),
        }
    }
    Ok(())
}

/// Store the summary of the range containing `heap_blk`, replacing any existing one.
/// Extends the revmap as needed and returns the tuple's new location.
pub fn insert_summary(revmap: &mut RevmapAccessor, heap_blk: BlockNumber, payload: &[u8]) -> Result<ItemPointer> {
    let addressing = revmap.addressing();
    let heap_blk = addressing.range_start(heap_blk);
    let tuple = BrinTuple::new(heap_blk, payload).encode();
    if tuple.len() > BRIN_MAX_TUPLE_SIZE {
        return Err(Error::PageFull(INVALID_BLOCK));
    }

    revmap.ensure_extended(heap_blk)?;
    let index = addressing.revmap_index(heap_blk);

    loop {
        revmap.interrupt.check()?;

        if let Some(found) = revmap.get_tuple_for_heap_block(heap_blk)? {
            match move_summary(revmap, heap_blk, found.item_pointer(), &tuple)? {
                Some(tid) => return Ok(tid),
                None => continue,
            }
        }

        let (buf, mut page, init_page) = get_insert_buffer(&revmap.rel, None, tuple.len())?;
        let (revmap_buf, mut revmap_page) = revmap.lock_revmap_page_for_update(heap_blk)?;
        if revmap_item_pointer(&revmap_page, index).is_valid() {
            // summarised concurrently; replace that one instead
            continue;
        }

        let reg_blk = buf.block_number();
        let offset = page.add_item(&tuple, None).ok_or(Error::PageFull(reg_blk))?;
        let tid = ItemPointer::new(reg_blk, offset);
        set_revmap_item_pointer(&mut revmap_page, index, tid);
        buf.mark_dirty();
        revmap_buf.mark_dirty();

        let record = BrinWalRecord::Insert {
            heap_blk,
            pages_per_range: addressing.pages_per_range,
            is_ao: addressing.is_ao,
            revmap_blk: revmap_buf.block_number(),
            reg_blk,
            offset,
            tuple,
            init_page,
        };
        if let Some(lsn) = revmap.rel.log(record)? {
            page.set_lsn(lsn);
            revmap_page.set_lsn(lsn);
        }
        debug!(index = revmap.rel.name(), heap_blk, ?tid, "summary inserted");
        return Ok(tid);
    }
}

/// Move the summary of `heap_blk` from `old` to a page with room, writing `tuple`
/// there. Returns `None` when the summary is no longer at `old`.
fn move_summary(
    revmap: &mut RevmapAccessor,
    heap_blk: BlockNumber,
    old: ItemPointer,
    tuple: &[u8],
) -> Result<Option<ItemPointer>> {
    let addressing = revmap.addressing();
    let old_buf = revmap.rel.buffers().read_buffer(old.block)?;
    let mut old_page = old_buf.lock_exclusive();
    if !is_regular_page(&old_page) {
        return Ok(None);
    }
    let still_there = old_page
        .item(old.offset)
        .and_then(BrinTuple::decode)
        .is_some_and(|t| t.heap_blk == heap_blk);
    if !still_there {
        return Ok(None);
    }

    let (new_buf, mut new_page, init_page) = get_insert_buffer(&revmap.rel, Some(old.block), tuple.len())?;
    let (revmap_buf, mut revmap_page) = revmap.lock_revmap_page_for_update(heap_blk)?;
    let index = addressing.revmap_index(heap_blk);
    if revmap_item_pointer(&revmap_page, index) != old {
        return Ok(None);
    }

    let new_blk = new_buf.block_number();
    let new_offset = new_page.add_item(tuple, None).ok_or(Error::PageFull(new_blk))?;
    old_page.delete_item_no_compact(old.offset);
    let new = ItemPointer::new(new_blk, new_offset);
    set_revmap_item_pointer(&mut revmap_page, index, new);
    old_buf.mark_dirty();
    new_buf.mark_dirty();
    revmap_buf.mark_dirty();

    let record = BrinWalRecord::Update {
        heap_blk,
        pages_per_range: addressing.pages_per_range,
        is_ao: addressing.is_ao,
        revmap_blk: revmap_buf.block_number(),
        old_blk: old.block,
        old_offset: old.offset,
        new_blk,
        new_offset,
        tuple: tuple.to_vec(),
        init_page,
    };
    if let Some(lsn) = revmap.rel.log(record)? {
        old_page.set_lsn(lsn);
        new_page.set_lsn(lsn);
        revmap_page.set_lsn(lsn);
    }
    Ok(Some(new))
}

/// Exclusively lock a regular page with room for `item_len` bytes: the last block of
/// the index when it qualifies, otherwise a freshly allocated one. The flag in the
/// result says whether the page was initialised here.
fn get_insert_buffer(
    rel: &IndexRelation,
    exclude: Option<BlockNumber>,
    item_len: usize,
) -> Result<(Buffer, PageWriteGuard, bool)> {
    let buffers = rel.buffers();
    loop {
        let nblocks = buffers.number_of_blocks();
        if nblocks > 1 && exclude != Some(nblocks - 1) {
            let buf = buffers.read_buffer(nblocks - 1)?;
            let page = buf.lock_exclusive();
            if is_regular_page(&page)
                && page_flags(&page) & BRIN_EVACUATE_PAGE == 0
                && page.fits(item_len)
            {
                return Ok((buf, page, false));
            }
        }

        let buf = buffers.allocate_new_page()?;
        let mut page = buf.lock_exclusive();
        if !page.is_new() {
            // taken over by a concurrent revmap extension
            debug!(index = rel.name(), block = buf.block_number(), "fresh page claimed, retrying");
            continue;
        }
        brin_page_init(&mut page, BRIN_PAGETYPE_REGULAR);
        return Ok((buf, page, true));
    }
}
