pub mod buffer;
pub mod page;
pub mod relation;

pub use buffer::{Buffer, BufferManager, MemoryBufferManager, PageReadGuard, PageWriteGuard};
pub use page::*;
pub use relation::IndexRelation;
