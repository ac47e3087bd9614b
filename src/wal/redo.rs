//! Replay of BRIN redo records onto index pages.
//!
//! Every page touched by a record is only modified when its LSN is older than the
//! record's, so replaying a log more than once leaves the index unchanged.

use crate::brin::layout::{
    brin_page_init, metapage_init, set_logical_page_num, set_next_revmap_page, ItemPointer,
    MetaPageData, BRIN_METAPAGE_BLKNO, BRIN_PAGETYPE_REGULAR, BRIN_PAGETYPE_REVMAP,
};
use crate::brin::revmap::set_heap_block_item_pointer;
use crate::error::{Error, Result};
use crate::storage::page::{BlockNumber, Lsn, Page, INVALID_BLOCK};
use crate::storage::relation::IndexRelation;
use crate::wal::BrinWalRecord;
use tracing::trace;

/// Apply `f` to `block` unless the page already reflects `lsn`.
fn apply<F>(rel: &IndexRelation, block: BlockNumber, lsn: Lsn, f: F) -> Result<()>
where
    F: FnOnce(&mut Page) -> Result<()>,
{
    let buf = rel.buffers().read_buffer_extend(block)?;
    let mut page = buf.lock_exclusive();
    if page.lsn() >= lsn {
        trace!(block, lsn, page_lsn = page.lsn(), "redo skipped");
        return Ok(());
    }
    f(&mut *page)?;
    page.set_lsn(lsn);
    buf.mark_dirty();
    Ok(())
}

fn add_tuple(page: &mut Page, block: BlockNumber, tuple: &[u8], offset: u16, init_page: bool) -> Result<()> {
    if init_page {
        brin_page_init(page, BRIN_PAGETYPE_REGULAR);
    }
    match page.add_item(tuple, Some(offset)) {
        Some(_) => Ok(()),
        None => Err(Error::Wal(format!("failed to add BRIN tuple at ({block}, {offset})"))),
    }
}

/// Replay one record logged at `lsn`.
pub fn redo(record: &BrinWalRecord, lsn: Lsn, rel: &IndexRelation) -> Result<()> {
    match record {
        BrinWalRecord::CreateIndex { pages_per_range, is_ao } => {
            apply(rel, BRIN_METAPAGE_BLKNO, lsn, |page| {
                metapage_init(page, *pages_per_range, *is_ao);
                Ok(())
            })
        }
        BrinWalRecord::RevmapExtend {
            target_blk,
            is_ao,
            block_seq,
            logical_page_num,
            prev_tail,
        } => {
            let seq = *block_seq as usize;
            apply(rel, BRIN_METAPAGE_BLKNO, lsn, |page| {
                let mut meta = MetaPageData::read(page, rel.name(), BRIN_METAPAGE_BLKNO)?;
                if *is_ao {
                    let chain = meta.chains.get_mut(seq).ok_or(Error::InvalidSlot(seq))?;
                    if *prev_tail == INVALID_BLOCK {
                        chain.first_page = *target_blk;
                    }
                    chain.last_page = *target_blk;
                    chain.last_logical_page_num = *logical_page_num;
                } else {
                    meta.last_revmap_page = *target_blk;
                }
                meta.write(page);
                Ok(())
            })?;
            apply(rel, *target_blk, lsn, |page| {
                brin_page_init(page, BRIN_PAGETYPE_REVMAP);
                if *is_ao {
                    set_logical_page_num(page, *logical_page_num);
                }
                Ok(())
            })?;
            if *is_ao && *prev_tail != INVALID_BLOCK {
                apply(rel, *prev_tail, lsn, |page| {
                    set_next_revmap_page(page, *target_blk);
                    Ok(())
                })?;
            }
            Ok(())
        }
        BrinWalRecord::Insert {
            heap_blk,
            pages_per_range,
            is_ao,
            revmap_blk,
            reg_blk,
            offset,
            tuple,
            init_page,
        } => {
            apply(rel, *reg_blk, lsn, |page| add_tuple(page, *reg_blk, tuple, *offset, *init_page))?;
            apply(rel, *revmap_blk, lsn, |page| {
                let tid = ItemPointer::new(*reg_blk, *offset);
                set_heap_block_item_pointer(page, *pages_per_range, *heap_blk, tid, *is_ao);
                Ok(())
            })
        }
        BrinWalRecord::Update {
            heap_blk,
            pages_per_range,
            is_ao,
            revmap_blk,
            old_blk,
            old_offset,
            new_blk,
            new_offset,
            tuple,
            init_page,
        } => {
            apply(rel, *old_blk, lsn, |page| {
                page.delete_item_no_compact(*old_offset);
                if old_blk == new_blk {
                    add_tuple(page, *new_blk, tuple, *new_offset, false)?;
                }
                Ok(())
            })?;
            if old_blk != new_blk {
                apply(rel, *new_blk, lsn, |page| add_tuple(page, *new_blk, tuple, *new_offset, *init_page))?;
            }
            apply(rel, *revmap_blk, lsn, |page| {
                let tid = ItemPointer::new(*new_blk, *new_offset);
                set_heap_block_item_pointer(page, *pages_per_range, *heap_blk, tid, *is_ao);
                Ok(())
            })
        }
        BrinWalRecord::Desummarize {
            pages_per_range,
            is_ao,
            heap_blk,
            revmap_blk,
            reg_blk,
            reg_offset,
        } => {
            apply(rel, *revmap_blk, lsn, |page| {
                set_heap_block_item_pointer(page, *pages_per_range, *heap_blk, ItemPointer::INVALID, *is_ao);
                Ok(())
            })?;
            apply(rel, *reg_blk, lsn, |page| {
                page.delete_item_no_compact(*reg_offset);
                Ok(())
            })
        }
    }
}

/// Replay a whole log, in order, onto `rel`.
pub fn replay(records: &[(Lsn, BrinWalRecord)], rel: &IndexRelation) -> Result<()> {
    for (lsn, record) in records {
        redo(record, *lsn, rel)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brin::layout::{revmap_item_pointer, MetaPageData};

    #[test]
    fn test_redo_is_idempotent() {
        let rel = IndexRelation::in_memory("replayed");
        let records = vec![
            (10, BrinWalRecord::CreateIndex { pages_per_range: 4, is_ao: false }),
            (
                20,
                BrinWalRecord::RevmapExtend {
                    target_blk: 1,
                    is_ao: false,
                    block_seq: 0,
                    logical_page_num: 0,
                    prev_tail: INVALID_BLOCK,
                },
            ),
            (
                30,
                BrinWalRecord::Insert {
                    heap_blk: 8,
                    pages_per_range: 4,
                    is_ao: false,
                    revmap_blk: 1,
                    reg_blk: 2,
                    offset: 1,
                    tuple: vec![8, 0, 0, 0, 1],
                    init_page: true,
                },
            ),
        ];
        replay(&records, &rel).unwrap();
        replay(&records, &rel).unwrap();

        let meta_page = rel.buffers().read_buffer(0).unwrap().lock_shared().clone();
        let meta = MetaPageData::read(&meta_page, "replayed", 0).unwrap();
        assert_eq!(meta.last_revmap_page, 1);

        let revmap = rel.buffers().read_buffer(1).unwrap().lock_shared().clone();
        assert_eq!(revmap_item_pointer(&revmap, 2), ItemPointer::new(2, 1));
        let regular = rel.buffers().read_buffer(2).unwrap().lock_shared().clone();
        assert_eq!(regular.max_offset_number(), 1);
        assert_eq!(regular.lsn(), 30);
    }

    #[test]
    fn test_redo_ao_extend_links_chain() {
        let rel = IndexRelation::in_memory("ao_replayed");
        redo(&BrinWalRecord::CreateIndex { pages_per_range: 1, is_ao: true }, 1, &rel).unwrap();
        for (lsn, target, logical, prev) in [(2, 1, 1, INVALID_BLOCK), (3, 2, 4, 1)] {
            let record = BrinWalRecord::RevmapExtend {
                target_blk: target,
                is_ao: true,
                block_seq: 3,
                logical_page_num: logical,
                prev_tail: prev,
            };
            redo(&record, lsn, &rel).unwrap();
        }
        let meta_page = rel.buffers().read_buffer(0).unwrap().lock_shared().clone();
        let meta = MetaPageData::read(&meta_page, "ao_replayed", 0).unwrap();
        assert_eq!(meta.chains[3].first_page, 1);
        assert_eq!(meta.chains[3].last_page, 2);
        assert_eq!(meta.chains[3].last_logical_page_num, 4);
        let first = rel.buffers().read_buffer(1).unwrap().lock_shared().clone();
        assert_eq!(crate::brin::layout::next_revmap_page(&first), 2);
    }
}
