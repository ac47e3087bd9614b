use mpp_core::brin::{
    desummarize_range, init_metapage, insert_summary, MetaPageData, RevmapAccessor, REVMAP_PAGE_MAXITEMS,
};
use mpp_core::storage::MemoryBufferManager;
use mpp_core::wal::{replay, BrinWalRecord, FileWal, WalSink};
use mpp_core::IndexRelation;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn logged_index(path: &Path, ppr: u32, is_ao: bool) -> Arc<IndexRelation> {
    let wal: Arc<dyn WalSink> = Arc::new(FileWal::create(path).unwrap());
    let rel = Arc::new(IndexRelation::new(
        "logged_brin",
        Arc::new(MemoryBufferManager::new()),
        Some(wal),
    ));
    init_metapage(&rel, ppr, is_ao).unwrap();
    rel
}

fn metapage(rel: &IndexRelation) -> MetaPageData {
    let page = rel.buffers().read_buffer(0).unwrap().lock_shared().clone();
    MetaPageData::read(&page, rel.name(), 0).unwrap()
}

fn summaries(rel: &Arc<IndexRelation>, blocks: &[u32]) -> Vec<Option<Vec<u8>>> {
    let mut revmap = RevmapAccessor::initialize(rel.clone()).unwrap();
    blocks
        .iter()
        .map(|blk| {
            revmap
                .get_tuple_for_heap_block(*blk)
                .unwrap()
                .map(|found| found.tuple.payload)
        })
        .collect()
}

/// Build a heap index that exercises every record kind, including evacuation
fn populate_heap(rel: &Arc<IndexRelation>) -> Vec<u32> {
    let mut revmap = RevmapAccessor::initialize(rel.clone()).unwrap();
    let mut blocks: Vec<u32> = (0..40).collect();
    for blk in &blocks {
        insert_summary(&mut revmap, *blk, format!("range {blk}").as_bytes()).unwrap();
    }
    // pushes the revmap onto the regular page holding the summaries above
    insert_summary(&mut revmap, REVMAP_PAGE_MAXITEMS + 3, b"far").unwrap();
    blocks.push(REVMAP_PAGE_MAXITEMS + 3);
    insert_summary(&mut revmap, 7, b"widened range 7").unwrap();
    assert!(desummarize_range(rel, 12).unwrap());
    blocks
}

#[test]
fn test_replay_rebuilds_heap_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("brin.wal");
    let original = logged_index(&path, 1, false);
    let blocks = populate_heap(&original);

    let records = FileWal::read_all(&path).unwrap();
    let kinds: Vec<&str> = records.iter().map(|(_, r)| r.kind()).collect();
    for kind in ["create_index", "revmap_extend", "insert", "update", "desummarize"] {
        assert!(kinds.contains(&kind), "no {kind} record in {kinds:?}");
    }

    let replayed = Arc::new(IndexRelation::in_memory("replayed_brin"));
    replay(&records, &replayed).unwrap();

    assert_eq!(metapage(&replayed), metapage(&original));
    let expected = summaries(&original, &blocks);
    assert_eq!(summaries(&replayed, &blocks), expected);
    assert_eq!(expected[7].as_deref(), Some(&b"widened range 7"[..]));
    assert_eq!(expected[12], None);
}

#[test]
fn test_replay_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("brin.wal");
    let original = logged_index(&path, 1, false);
    let blocks = populate_heap(&original);
    let records = FileWal::read_all(&path).unwrap();

    let replayed = Arc::new(IndexRelation::in_memory("replayed_twice"));
    replay(&records, &replayed).unwrap();
    let once = summaries(&replayed, &blocks);
    replay(&records, &replayed).unwrap();
    // a crash halfway through recovery replays the tail again
    replay(&records[records.len() / 2..], &replayed).unwrap();

    assert_eq!(summaries(&replayed, &blocks), once);
    assert_eq!(metapage(&replayed), metapage(&original));
}

#[test]
fn test_lsns_are_log_end_offsets() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("brin.wal");
    let original = logged_index(&path, 4, false);
    populate_heap(&original);

    let records = FileWal::read_all(&path).unwrap();
    assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
    let file_len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(records.last().unwrap().0, file_len);

    // the metapage carries the LSN of the last record that touched it
    let meta_lsn = original.buffers().read_buffer(0).unwrap().lock_shared().lsn();
    assert!(records.iter().any(|(lsn, _)| *lsn == meta_lsn));
}

#[test]
fn test_torn_tail_is_dropped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("brin.wal");
    let original = logged_index(&path, 1, false);
    populate_heap(&original);
    let complete = FileWal::read_all(&path).unwrap();

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - 3).unwrap();
    drop(file);

    let records = FileWal::read_all(&path).unwrap();
    assert_eq!(records.len(), complete.len() - 1);
    assert_eq!(records[..], complete[..complete.len() - 1]);
    replay(&records, &IndexRelation::in_memory("prefix")).unwrap();
}

#[test]
fn test_replay_rebuilds_ao_chains() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ao_brin.wal");
    let original = logged_index(&path, 1, true);

    let mut blocks = Vec::new();
    {
        let mut revmap = RevmapAccessor::initialize(original.clone()).unwrap();
        for seq in [0u32, 2, 5] {
            for offset in [0, 1, REVMAP_PAGE_MAXITEMS * 2] {
                let blk = (seq << 25) + offset;
                insert_summary(&mut revmap, blk, &blk.to_le_bytes()).unwrap();
                blocks.push(blk);
            }
        }
    }

    let records = FileWal::read_all(&path).unwrap();
    let extends = records
        .iter()
        .filter(|(_, r)| matches!(r, BrinWalRecord::RevmapExtend { is_ao: true, .. }))
        .count();
    assert!(extends >= 6, "only {extends} chain extensions logged");

    let replayed = Arc::new(IndexRelation::in_memory("replayed_ao"));
    replay(&records, &replayed).unwrap();

    let meta = metapage(&replayed);
    assert!(meta.is_ao);
    assert_eq!(meta.chains, metapage(&original).chains);
    let restored = summaries(&replayed, &blocks);
    for (blk, payload) in blocks.iter().zip(restored) {
        assert_eq!(payload, Some(blk.to_le_bytes().to_vec()));
    }
}
