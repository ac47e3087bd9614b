//! Block range index storage: metapage, revmap and summary pages, for both contiguous
//! heap tables and segmented append-only tables.

pub mod chain;
pub mod layout;
pub mod pageops;
pub mod revmap;
pub mod tuple;

pub use layout::{
    default_pages_per_range, ChainInfo, ItemPointer, MetaPageData, RangeAddressing,
    MAX_AOREL_CONCURRENCY, REVMAP_PAGE_MAXITEMS,
};
pub use pageops::{evacuate_page, init_metapage, insert_summary, start_evacuating_page};
pub use revmap::{
    desummarize_range, set_heap_block_item_pointer, ChainIterator, ExtendOutcome, FoundSummary,
    RevmapAccessor,
};
pub use tuple::BrinTuple;
