use crate::error::{Error, Result};
use std::fmt;

/// Size of every index page in bytes.
pub const BLCKSZ: usize = 32768;
/// Fixed page header: lsn, checksum, flags, lower, upper, special, size/version, prune xid.
pub const PAGE_HEADER_SIZE: usize = 24;
const ITEM_ID_SIZE: usize = 4;
const PAGE_LAYOUT_VERSION: u16 = 4;

pub type BlockNumber = u32;
pub type OffsetNumber = u16;
pub type Lsn = u64;

pub const INVALID_BLOCK: BlockNumber = 0xFFFF_FFFF;
pub const INVALID_OFFSET: OffsetNumber = 0;

const LP_UNUSED: u8 = 0;
const LP_NORMAL: u8 = 1;

const fn max_align(len: usize) -> usize {
    (len + 7) & !7
}

/// Line pointer stored in the item array of a page: 15-bit offset, 2-bit flags, 15-bit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemId {
    pub offset: u16,
    pub flags: u8,
    pub length: u16,
}

impl ItemId {
    fn decode(raw: u32) -> Self {
        Self {
            offset: (raw & 0x7FFF) as u16,
            flags: ((raw >> 15) & 0x3) as u8,
            length: ((raw >> 17) & 0x7FFF) as u16,
        }
    }

    fn encode(&self) -> u32 {
        (self.offset as u32 & 0x7FFF)
            | ((self.flags as u32 & 0x3) << 15)
            | ((self.length as u32 & 0x7FFF) << 17)
    }

    pub fn is_used(&self) -> bool {
        self.flags != LP_UNUSED
    }
}

/// A single index page image.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8]>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("lsn", &self.lsn())
            .field("lower", &self.lower())
            .field("upper", &self.upper())
            .field("special", &self.special())
            .finish()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl Page {
    pub fn new_zeroed() -> Self {
        Self {
            data: vec![0u8; BLCKSZ].into_boxed_slice(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLCKSZ {
            return Err(Error::Serialization(format!(
                "page image has {} bytes, expected {}",
                bytes.len(),
                BLCKSZ
            )));
        }
        Ok(Self {
            data: bytes.to_vec().into_boxed_slice(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Zero the page and lay out an empty header with `special_size` bytes reserved at the end.
    pub fn init(&mut self, special_size: usize) {
        let special_size = max_align(special_size);
        self.data.fill(0);
        let special = (BLCKSZ - special_size) as u16;
        self.set_lower(PAGE_HEADER_SIZE as u16);
        self.set_upper(special);
        self.write_u16(16, special);
        self.write_u16(18, (BLCKSZ as u16) | PAGE_LAYOUT_VERSION);
    }

    /// A page that has never been initialised.
    pub fn is_new(&self) -> bool {
        self.upper() == 0
    }

    pub fn lsn(&self) -> Lsn {
        u64::from_le_bytes(self.fixed::<8>(0))
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data[0..8].copy_from_slice(&lsn.to_le_bytes());
    }

    pub fn lower(&self) -> u16 {
        self.read_u16(12)
    }

    pub fn set_lower(&mut self, lower: u16) {
        self.write_u16(12, lower);
    }

    pub fn upper(&self) -> u16 {
        self.read_u16(14)
    }

    fn set_upper(&mut self, upper: u16) {
        self.write_u16(14, upper);
    }

    pub fn special(&self) -> u16 {
        self.read_u16(16)
    }

    pub fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes(self.fixed::<2>(at))
    }

    pub fn write_u16(&mut self, at: usize, value: u16) {
        self.data[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.fixed::<4>(at))
    }

    pub fn write_u32(&mut self, at: usize, value: u32) {
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn bytes(&self, at: usize, len: usize) -> &[u8] {
        &self.data[at..at + len]
    }

    pub fn bytes_mut(&mut self, at: usize, len: usize) -> &mut [u8] {
        &mut self.data[at..at + len]
    }

    fn fixed<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[at..at + N]);
        out
    }

    pub fn max_offset_number(&self) -> OffsetNumber {
        let lower = self.lower() as usize;
        if lower <= PAGE_HEADER_SIZE {
            0
        } else {
            ((lower - PAGE_HEADER_SIZE) / ITEM_ID_SIZE) as OffsetNumber
        }
    }

    fn item_id_pos(offset: OffsetNumber) -> usize {
        PAGE_HEADER_SIZE + (offset as usize - 1) * ITEM_ID_SIZE
    }

    /// Line pointer for a 1-based offset. Offsets beyond the array read as unused.
    pub fn item_id(&self, offset: OffsetNumber) -> ItemId {
        if offset == INVALID_OFFSET || offset > self.max_offset_number() {
            return ItemId::default();
        }
        ItemId::decode(self.read_u32(Self::item_id_pos(offset)))
    }

    fn set_item_id(&mut self, offset: OffsetNumber, id: ItemId) {
        self.write_u32(Self::item_id_pos(offset), id.encode());
    }

    pub fn item(&self, offset: OffsetNumber) -> Option<&[u8]> {
        let id = self.item_id(offset);
        if id.flags != LP_NORMAL {
            return None;
        }
        Some(self.bytes(id.offset as usize, id.length as usize))
    }

    pub fn live_items(&self) -> impl Iterator<Item = (OffsetNumber, &[u8])> + '_ {
        (1..=self.max_offset_number()).filter_map(move |off| self.item(off).map(|bytes| (off, bytes)))
    }

    pub fn has_live_items(&self) -> bool {
        (1..=self.max_offset_number()).any(|off| self.item_id(off).is_used())
    }

    /// Space available for one more item including a fresh line pointer.
    pub fn free_space(&self) -> usize {
        let gap = self.upper() as usize;
        let used = self.lower() as usize + ITEM_ID_SIZE;
        gap.saturating_sub(used)
    }

    /// Whether an item of `len` bytes fits, assuming it needs a new line pointer.
    pub fn fits(&self, len: usize) -> bool {
        !self.is_new() && max_align(len) <= self.free_space()
    }

    /// Add an item, either at a caller-chosen offset (used by redo) or at the first free slot.
    /// Returns `None` when the item does not fit or the requested slot is occupied.
    pub fn add_item(&mut self, item: &[u8], offset: Option<OffsetNumber>) -> Option<OffsetNumber> {
        if self.is_new() {
            return None;
        }
        let max = self.max_offset_number();
        let (target, new_pointer) = match offset {
            Some(off) if off == INVALID_OFFSET || off > max + 1 => return None,
            Some(off) if off <= max => {
                if self.item_id(off).is_used() {
                    return None;
                }
                (off, false)
            }
            Some(off) => (off, true),
            None => match (1..=max).find(|off| !self.item_id(*off).is_used()) {
                Some(off) => (off, false),
                None => (max + 1, true),
            },
        };

        let aligned = max_align(item.len());
        let lower = self.lower() as usize + if new_pointer { ITEM_ID_SIZE } else { 0 };
        let upper = self.upper() as usize;
        if upper < aligned || lower > upper - aligned {
            return None;
        }
        let start = upper - aligned;
        self.data[start..start + item.len()].copy_from_slice(item);
        self.set_upper(start as u16);
        self.set_lower(lower as u16);
        self.set_item_id(
            target,
            ItemId {
                offset: start as u16,
                flags: LP_NORMAL,
                length: item.len() as u16,
            },
        );
        Some(target)
    }

    /// Mark an item unused without renumbering the remaining line pointers.
    pub fn delete_item_no_compact(&mut self, offset: OffsetNumber) {
        let max = self.max_offset_number();
        if offset == INVALID_OFFSET || offset > max {
            return;
        }
        let id = self.item_id(offset);
        if id.is_used() && id.offset == self.upper() {
            let reclaimed = self.upper() as usize + max_align(id.length as usize);
            self.set_upper(reclaimed as u16);
        }
        self.set_item_id(offset, ItemId::default());
        if offset == max {
            self.set_lower(self.lower() - ITEM_ID_SIZE as u16);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_is_uninitialised() {
        let page = Page::new_zeroed();
        assert!(page.is_new());
        assert_eq!(page.max_offset_number(), 0);
    }

    #[test]
    fn test_init_reserves_special_area() {
        let mut page = Page::new_zeroed();
        page.init(16);
        assert!(!page.is_new());
        assert_eq!(page.lower() as usize, PAGE_HEADER_SIZE);
        assert_eq!(page.upper() as usize, BLCKSZ - 16);
        assert_eq!(page.special() as usize, BLCKSZ - 16);
    }

    #[test]
    fn test_add_and_delete_items() {
        let mut page = Page::new_zeroed();
        page.init(16);
        let a = page.add_item(b"first", None).unwrap();
        let b = page.add_item(b"second", None).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(page.item(1), Some(&b"first"[..]));

        page.delete_item_no_compact(1);
        assert!(!page.item_id(1).is_used());
        assert_eq!(page.max_offset_number(), 2);

        // the freed slot is reused before the array grows
        let c = page.add_item(b"third", None).unwrap();
        assert_eq!(c, 1);

        page.delete_item_no_compact(2);
        assert_eq!(page.max_offset_number(), 1);
    }

    #[test]
    fn test_add_item_at_explicit_offset() {
        let mut page = Page::new_zeroed();
        page.init(16);
        assert_eq!(page.add_item(b"x", Some(1)), Some(1));
        assert_eq!(page.add_item(b"y", Some(1)), None);
        assert_eq!(page.add_item(b"y", Some(3)), None);
        assert_eq!(page.add_item(b"y", Some(2)), Some(2));
    }

    #[test]
    fn test_item_id_bit_packing() {
        let id = ItemId {
            offset: 0x7ABC,
            flags: LP_NORMAL,
            length: 0x1234,
        };
        assert_eq!(ItemId::decode(id.encode()), id);
    }

    #[test]
    fn test_page_fills_up() {
        let mut page = Page::new_zeroed();
        page.init(16);
        let big = vec![7u8; 8000];
        let mut added = 0;
        while page.add_item(&big, None).is_some() {
            added += 1;
        }
        assert_eq!(added, 4);
        assert!(page.free_space() < 8000);
    }
}
