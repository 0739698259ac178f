//! # Cell Indices
//!
//! A cell index is the opaque 32-bit logical address of one cell within one
//! hive. Bit 31 selects the storage class; the remaining 31 bits are a byte
//! offset into that class, decomposed by the storage map as
//! `[directory:10][table:9][offset:12]`.
//!
//! A `CellId` is only meaningful relative to the hive that produced it and
//! is never comparable across hives. `CellId::NIL` (all bits set) is the
//! reserved "no cell" sentinel.

use crate::config::{CELL_OFFSET_BITS, MAP_TABLE_BITS};

/// Stable storage is persisted to the backing file; volatile storage lives
/// only in memory and vanishes when the hive is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StorageKind {
    Stable = 0,
    Volatile = 1,
}

impl StorageKind {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn both() -> [StorageKind; 2] {
        [StorageKind::Stable, StorageKind::Volatile]
    }
}

const KIND_BIT: u32 = 0x8000_0000;
const OFFSET_MASK: u32 = KIND_BIT - 1;

/// Logical address of a cell: storage class bit plus class-relative offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u32);

impl CellId {
    /// The "no cell" sentinel.
    pub const NIL: CellId = CellId(u32::MAX);

    pub fn new(kind: StorageKind, offset: u32) -> Self {
        debug_assert!(offset & KIND_BIT == 0, "cell offset overflows class space");
        match kind {
            StorageKind::Stable => CellId(offset),
            StorageKind::Volatile => CellId(offset | KIND_BIT),
        }
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    pub fn kind(self) -> StorageKind {
        if self.0 & KIND_BIT == 0 {
            StorageKind::Stable
        } else {
            StorageKind::Volatile
        }
    }

    /// Byte offset within the cell's storage class.
    pub fn offset(self) -> u32 {
        self.0 & OFFSET_MASK
    }

    /// Logical block number within the storage class.
    pub fn block(self) -> u32 {
        self.offset() >> CELL_OFFSET_BITS
    }

    /// Ordinal of the view window covering this cell (stable class only).
    pub fn view_window(self) -> u32 {
        self.offset() / crate::config::VIEW_SIZE as u32
    }

    /// Index of the map table covering this cell's block.
    pub fn table(self) -> usize {
        (self.block() >> MAP_TABLE_BITS) as usize
    }

    /// Index within that map table.
    pub fn table_slot(self) -> usize {
        (self.block() as usize) & ((1usize << MAP_TABLE_BITS) - 1)
    }

    /// Byte offset within the cell's block.
    pub fn block_offset(self) -> usize {
        (self.offset() as usize) & ((1usize << CELL_OFFSET_BITS) - 1)
    }

    /// The same offset re-addressed `delta` bytes later in the class.
    pub fn advanced(self, delta: u32) -> CellId {
        CellId::new(self.kind(), self.offset() + delta)
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            write!(f, "NIL")
        } else {
            write!(f, "{:08x}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_volatile_space_but_identified_first() {
        assert!(CellId::NIL.is_nil());
        assert!(!CellId::new(StorageKind::Stable, 0).is_nil());
    }

    #[test]
    fn kind_bit_selects_storage_class() {
        let stable = CellId::new(StorageKind::Stable, 0x2020);
        let volatile = CellId::new(StorageKind::Volatile, 0x2020);

        assert_eq!(stable.kind(), StorageKind::Stable);
        assert_eq!(volatile.kind(), StorageKind::Volatile);
        assert_eq!(stable.offset(), volatile.offset());
        assert_ne!(stable, volatile);
    }

    #[test]
    fn decomposition_matches_layout() {
        // offset 0x0080_3028 = block 0x803, table 4, slot 3, in-block 0x28
        let cell = CellId::new(StorageKind::Stable, 0x0080_3028);

        assert_eq!(cell.block(), 0x803);
        assert_eq!(cell.table(), 4);
        assert_eq!(cell.table_slot(), 3);
        assert_eq!(cell.block_offset(), 0x28);
    }

    #[test]
    fn advanced_stays_in_class() {
        let cell = CellId::new(StorageKind::Volatile, 0x1000);
        let next = cell.advanced(0x20);

        assert_eq!(next.kind(), StorageKind::Volatile);
        assert_eq!(next.offset(), 0x1020);
    }
}
