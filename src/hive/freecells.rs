//! # Free Cell Display
//!
//! Size-bucketed index of free cells, one per storage class. Lookup is a
//! summary-mask scan instead of a walk over every bin: 24 buckets, the
//! first 16 linear (one per 8-byte step, sizes 8..=128, every member is
//! exactly the bucket size) and the last 8 logarithmic (one per power of
//! two from 136 up, members vary in size and must be re-checked by the
//! allocator). Bit `c` of the summary is set exactly when bucket `c` is
//! non-empty.
//!
//! The display is authoritative: every free cell in mapped, non-discarded
//! storage is enlisted, and allocation/free keep it in sync. Cells inside
//! a bin that gets discarded are delisted first.

use smallvec::SmallVec;

use crate::config::FREE_DISPLAY_SIZE;
use crate::hive::index::CellId;

/// Buckets at or below this index hold exactly one cell size each.
pub const LINEAR_CLASSES: usize = 16;

/// Bucket for a free cell of `size` bytes (header included). `size` must
/// be a positive multiple of 8.
pub fn size_class(size: u32) -> usize {
    debug_assert!(size >= 8 && size % 8 == 0, "bad free cell size {size}");
    let linear = (size as usize >> 3) - 1;
    if linear < LINEAR_CLASSES {
        return linear;
    }
    // logarithmic region: bucket by highest set bit, 136..=255 lands in
    // bucket 16, each doubling advances one, capped at the last bucket
    let bit = 31 - size.leading_zeros() as usize;
    (LINEAR_CLASSES + bit.saturating_sub(7)).min(FREE_DISPLAY_SIZE - 1)
}

/// Exact byte size of every member of a linear bucket.
pub fn linear_class_size(class: usize) -> u32 {
    debug_assert!(class < LINEAR_CLASSES);
    ((class + 1) << 3) as u32
}

type ClassList = SmallVec<[CellId; 8]>;

#[derive(Default)]
pub struct FreeDisplay {
    summary: u32,
    lists: [ClassList; FREE_DISPLAY_SIZE],
}

impl FreeDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> u32 {
        self.summary
    }

    pub fn is_empty(&self) -> bool {
        self.summary == 0
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(|l| l.len()).sum()
    }

    /// Records `cell` (a free cell of `size` bytes) in its bucket.
    pub fn enlist(&mut self, cell: CellId, size: u32) {
        let class = size_class(size);
        self.lists[class].push(cell);
        self.summary |= 1 << class;
    }

    /// Removes `cell` from the bucket for `size`. Returns false when the
    /// cell was not enlisted, which callers treat as corruption upstream.
    pub fn delist(&mut self, cell: CellId, size: u32) -> bool {
        let class = size_class(size);
        let list = &mut self.lists[class];
        let Some(pos) = list.iter().position(|&c| c == cell) else {
            return false;
        };
        list.swap_remove(pos);
        if list.is_empty() {
            self.summary &= !(1 << class);
        }
        true
    }

    /// First non-empty bucket at or above `class`, via the summary mask.
    pub fn first_class_at_least(&self, class: usize) -> Option<usize> {
        debug_assert!(class < FREE_DISPLAY_SIZE);
        let masked = self.summary & !((1u32 << class) - 1);
        if masked == 0 {
            None
        } else {
            Some(masked.trailing_zeros() as usize)
        }
    }

    pub fn list(&self, class: usize) -> &[CellId] {
        &self.lists[class]
    }

    /// Removes and returns one cell from `class`. When `prefer_view` is
    /// given, a cell inside that view window wins over the default pick,
    /// which keeps related allocations in already-mapped windows.
    pub fn pick(&mut self, class: usize, prefer_view: Option<u32>) -> Option<CellId> {
        let list = &mut self.lists[class];
        if list.is_empty() {
            return None;
        }

        let pos = prefer_view
            .and_then(|view| list.iter().position(|c| c.view_window() == view))
            .unwrap_or(list.len() - 1);

        let cell = list.swap_remove(pos);
        if list.is_empty() {
            self.summary &= !(1 << class);
        }
        Some(cell)
    }

    /// Removes and returns the cell at `pos` within `class`; used when the
    /// allocator scanned a logarithmic bucket for an exact fit.
    pub fn take_at(&mut self, class: usize, pos: usize) -> CellId {
        let list = &mut self.lists[class];
        let cell = list.swap_remove(pos);
        if list.is_empty() {
            self.summary &= !(1 << class);
        }
        cell
    }

    /// Drops every enlisted cell that lies inside the bin starting at
    /// class offset `bin_offset` spanning `bin_size` bytes. Used when a
    /// bin is vacated or discarded.
    pub fn delist_bin(&mut self, bin_offset: u32, bin_size: u32) {
        let end = bin_offset + bin_size;
        for (class, list) in self.lists.iter_mut().enumerate() {
            list.retain(|c| {
                let off = c.offset();
                off < bin_offset || off >= end
            });
            if list.is_empty() {
                self.summary &= !(1 << class);
            }
        }
    }

    pub fn clear(&mut self) {
        for list in &mut self.lists {
            list.clear();
        }
        self.summary = 0;
    }
}
