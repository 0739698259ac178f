//! # Cell Allocator
//!
//! Allocation works inside bins: a request is padded to cell granularity,
//! satisfied from the free-cell display when a fitting free cell exists,
//! and otherwise from a new bin. Oversized free cells are split and the
//! residue re-enlisted; freed cells coalesce with free neighbors on both
//! sides. A bin that becomes entirely free is *vacated*: its bytes are
//! dropped and a free-bin record keeps the address range reusable.
//!
//! ## Granularity
//!
//! Requests round up to `CELL_PAD`. Above `CELL_GRANULARITY_THRESHOLD`
//! they round further to the next power of two, so a cell that is grown
//! repeatedly by small deltas reallocates O(log n) times instead of O(n)
//! and leaves reusable power-of-two holes behind. The threshold sits at
//! the view size: a big-value chunk cell is the largest exact-sized
//! request and must not double past a view window.
//!
//! ## Dirty Ordering
//!
//! Every path marks the affected stable blocks dirty *before* mutating
//! them. The marking is the only step that can fail with `NoLogSpace`,
//! so a failed operation leaves the hive image untouched.

use eyre::{ensure, Result};

use crate::config::{
    BIN_HEADER_SIZE, BLOCK_SIZE, CELL_GRANULARITY_THRESHOLD, CELL_HEADER_SIZE, CELL_PAD,
    MIN_FREE_CELL_SIZE, SANE_CELL_MAX, VIEW_SIZE,
};

use super::bin::{self, walk_cells, BinHeader, CellSpan};
use super::freecells::{self, LINEAR_CLASSES};
use super::map::{BinBacking, MapEntry};
use super::{CellId, FreeBin, Hive, HiveError, StorageKind};

/// Full cell size (header included) for a payload request.
fn pad_cell_size(payload: usize) -> usize {
    let raw = payload + CELL_HEADER_SIZE;
    let padded = raw.div_ceil(CELL_PAD) * CELL_PAD;
    padded.max(MIN_FREE_CELL_SIZE)
}

/// Granularity adjustment: large cells round to the next power of two.
fn adjust_cell_size(size: usize) -> usize {
    if size > CELL_GRANULARITY_THRESHOLD {
        size.next_power_of_two()
    } else {
        size
    }
}

impl Hive {
    /// Allocates a cell with at least `payload` bytes of capacity.
    /// `vicinity` biases the search toward the view window of a related
    /// cell so hot key paths cluster in few windows.
    pub fn allocate_cell(
        &mut self,
        kind: StorageKind,
        payload: usize,
        vicinity: Option<CellId>,
    ) -> Result<CellId> {
        let actual = adjust_cell_size(pad_cell_size(payload));
        if actual > SANE_CELL_MAX {
            return Err(HiveError::CellTooLarge(payload).into());
        }
        let actual = actual as u32;

        let prefer = vicinity
            .filter(|v| kind == StorageKind::Stable && v.kind() == StorageKind::Stable)
            .map(CellId::view_window);

        let (cell, free_size) = match self.find_free(kind, actual, prefer)? {
            Some(found) => found,
            None => self.add_bin(kind, actual)?,
        };

        if let Err(err) = self.mark_span_dirty(kind, cell.offset(), free_size) {
            // nothing was mutated; put the free cell back
            self.storage_mut(kind).free_display.enlist(cell, free_size);
            return Err(err);
        }

        self.carve(kind, cell, free_size, actual)?;

        // fresh cells start zeroed; reuse must not leak prior contents
        {
            let mut guard = self.cell(cell)?;
            guard.data_mut().fill(0);
        }
        Ok(cell)
    }

    /// Returns a freed cell's storage to its bin, coalescing with free
    /// neighbors. Vacates the bin when nothing allocated remains in it.
    pub fn free_cell(&mut self, cell: CellId) -> Result<()> {
        ensure!(!cell.is_nil(), "cannot free the nil cell index");
        let kind = cell.kind();
        let entry = self.storage(kind).entry(cell)?;
        ensure!(
            !entry.is_discarded(),
            "cell {} lies in a discarded bin",
            cell
        );
        let rel = (cell.offset() - entry.bin_offset) as usize;

        // one walk locates the cell and both neighbors
        let mut below: Option<CellSpan> = None;
        let mut target: Option<CellSpan> = None;
        let mut above: Option<CellSpan> = None;
        {
            let guard = self.bin_guard(kind, entry)?;
            let mut prev: Option<CellSpan> = None;
            for span in walk_cells(guard.bytes()) {
                let span = span?;
                if span.offset == rel {
                    below = prev.filter(|p| p.free);
                    target = Some(span);
                } else if target.is_some() && above.is_none() {
                    above = Some(span).filter(|s| s.free);
                    break;
                }
                prev = Some(span);
            }
        }

        let target = target.ok_or_else(|| {
            eyre::eyre!("cell {} does not start a cell in its bin", cell)
        })?;
        ensure!(!target.free, "double free of cell {}", cell);

        let final_off = below.map_or(rel, |b| b.offset);
        let final_size =
            target.size + below.map_or(0, |b| b.size) + above.map_or(0, |a| a.size);

        let class_off = entry.bin_offset + final_off as u32;
        self.mark_span_dirty(kind, class_off, final_size as u32)?;

        let display = &mut self.storage_mut(kind).free_display;
        if let Some(b) = below {
            display.delist(
                CellId::new(kind, entry.bin_offset + b.offset as u32),
                b.size as u32,
            );
        }
        if let Some(a) = above {
            display.delist(
                CellId::new(kind, entry.bin_offset + a.offset as u32),
                a.size as u32,
            );
        }

        {
            let mut guard = self.bin_guard(kind, entry)?;
            bin::set_raw_cell_size(guard.bytes_mut(), final_off, final_size as i32);
        }

        let wholly_free =
            final_off == BIN_HEADER_SIZE && final_size == entry.bin_size as usize - BIN_HEADER_SIZE;
        if wholly_free {
            self.vacate_bin(kind, entry)
        } else {
            self.storage_mut(kind)
                .free_display
                .enlist(CellId::new(kind, class_off), final_size as u32);
            Ok(())
        }
    }

    /// Grows or shrinks a cell to hold `payload` bytes. Shrinking within
    /// the current capacity is free and keeps the index; growth tries the
    /// free neighbor above before falling back to allocate-copy-free, in
    /// which case the returned index differs and old references are stale.
    pub fn reallocate_cell(&mut self, cell: CellId, payload: usize) -> Result<CellId> {
        let kind = cell.kind();
        let new_actual = adjust_cell_size(pad_cell_size(payload));
        if new_actual > SANE_CELL_MAX {
            return Err(HiveError::CellTooLarge(payload).into());
        }

        let entry = self.storage(kind).entry(cell)?;
        let rel = (cell.offset() - entry.bin_offset) as usize;

        let (cur_size, neighbor) = {
            let guard = self.bin_guard(kind, entry)?;
            let raw = bin::raw_cell_size(guard.bytes(), rel);
            ensure!(raw < 0, "cannot reallocate free cell {}", cell);
            let cur = raw.unsigned_abs() as usize;
            let next_off = rel + cur;
            let neighbor = if next_off < entry.bin_size as usize {
                let next_raw = bin::raw_cell_size(guard.bytes(), next_off);
                (next_raw > 0).then_some(next_raw as usize)
            } else {
                None
            };
            (cur, neighbor)
        };

        if new_actual <= cur_size {
            return Ok(cell);
        }

        if let Some(next_size) = neighbor {
            let combined = cur_size + next_size;
            if combined >= new_actual {
                let class_off = cell.offset();
                self.mark_span_dirty(kind, class_off, combined as u32)?;
                self.storage_mut(kind).free_display.delist(
                    CellId::new(kind, entry.bin_offset + (rel + cur_size) as u32),
                    next_size as u32,
                );
                self.carve_at(kind, entry, rel, combined, new_actual)?;
                return Ok(cell);
            }
        }

        // relocate: allocate fresh, copy, free the old cell
        let new_cell = self.allocate_cell(kind, payload, Some(cell))?;
        let data = {
            let guard = self.cell(cell)?;
            guard.data().to_vec()
        };
        {
            let mut guard = self.cell(new_cell)?;
            let n = data.len().min(guard.len());
            guard.data_mut()[..n].copy_from_slice(&data[..n]);
        }
        self.free_cell(cell)?;
        Ok(new_cell)
    }

    /// Allocates a cell in `kind` with a copy of `cell`'s payload.
    pub fn duplicate_cell(&mut self, cell: CellId, kind: StorageKind) -> Result<CellId> {
        let data = {
            let guard = self.cell(cell)?;
            guard.data().to_vec()
        };
        let copy = self.allocate_cell(kind, data.len(), None)?;
        let mut guard = self.cell(copy)?;
        guard.data_mut()[..data.len()].copy_from_slice(&data);
        drop(guard);
        if kind == StorageKind::Stable {
            self.mark_cell_dirty(copy)?;
        }
        Ok(copy)
    }

    // --- free search ----------------------------------------------------

    /// Finds and delists a free cell of at least `actual` bytes.
    fn find_free(
        &mut self,
        kind: StorageKind,
        actual: u32,
        prefer_view: Option<u32>,
    ) -> Result<Option<(CellId, u32)>> {
        let start = freecells::size_class(actual);
        let mut class = start;

        loop {
            let Some(found) = self.storage(kind).free_display.first_class_at_least(class) else {
                return Ok(None);
            };
            class = found;

            if class < LINEAR_CLASSES {
                // linear buckets at or above the start class always fit
                let size = freecells::linear_class_size(class);
                let cell = self
                    .storage_mut(kind)
                    .free_display
                    .pick(class, prefer_view)
                    .ok_or_else(|| eyre::eyre!("free display summary out of sync"))?;
                return Ok(Some((cell, size)));
            }

            // logarithmic bucket: members vary, re-check actual sizes
            let candidates: Vec<CellId> = self.storage(kind).free_display.list(class).to_vec();
            let mut fallback: Option<(usize, u32)> = None;
            for (pos, candidate) in candidates.iter().enumerate() {
                let size = self.free_cell_size(kind, *candidate)?;
                if size >= actual {
                    let preferred = prefer_view == Some(candidate.view_window());
                    if preferred {
                        let cell = self.storage_mut(kind).free_display.take_at(class, pos);
                        return Ok(Some((cell, size)));
                    }
                    if fallback.is_none() {
                        fallback = Some((pos, size));
                    }
                }
            }
            if let Some((pos, size)) = fallback {
                let cell = self.storage_mut(kind).free_display.take_at(class, pos);
                return Ok(Some((cell, size)));
            }

            class += 1;
            if class >= crate::config::FREE_DISPLAY_SIZE {
                return Ok(None);
            }
        }
    }

    fn free_cell_size(&mut self, kind: StorageKind, cell: CellId) -> Result<u32> {
        let entry = self.storage(kind).entry(cell)?;
        let rel = (cell.offset() - entry.bin_offset) as usize;
        let guard = self.bin_guard(kind, entry)?;
        let raw = bin::raw_cell_size(guard.bytes(), rel);
        ensure!(
            raw > 0,
            "enlisted cell {} is not free (size word {})",
            cell,
            raw
        );
        Ok(raw as u32)
    }

    /// Writes the allocated header for `cell` and splits off the residue
    /// of its former free cell. Dirty marking already happened.
    fn carve(&mut self, kind: StorageKind, cell: CellId, free_size: u32, actual: u32) -> Result<()> {
        let entry = self.storage(kind).entry(cell)?;
        let rel = (cell.offset() - entry.bin_offset) as usize;
        self.carve_at(kind, entry, rel, free_size as usize, actual as usize)
    }

    fn carve_at(
        &mut self,
        kind: StorageKind,
        entry: MapEntry,
        rel: usize,
        avail: usize,
        actual: usize,
    ) -> Result<()> {
        let residue = avail - actual;
        debug_assert!(residue == 0 || residue >= MIN_FREE_CELL_SIZE);
        let taken = if residue >= MIN_FREE_CELL_SIZE {
            actual
        } else {
            avail
        };

        {
            let mut guard = self.bin_guard(kind, entry)?;
            let bytes = guard.bytes_mut();
            bin::set_raw_cell_size(bytes, rel, -(taken as i32));
            if taken < avail {
                bin::set_raw_cell_size(bytes, rel + taken, (avail - taken) as i32);
            }
        }

        if taken < avail {
            self.storage_mut(kind).free_display.enlist(
                CellId::new(kind, entry.bin_offset + (rel + taken) as u32),
                (avail - taken) as u32,
            );
        }
        Ok(())
    }

    // --- bin lifecycle --------------------------------------------------

    /// Maps a new bin able to hold one cell of `actual` bytes, reusing a
    /// discarded free bin when allowed, appending at the end of storage
    /// otherwise. Returns the bin's single free cell, already enlisted in
    /// neither list (the caller carves it directly).
    fn add_bin(&mut self, kind: StorageKind, actual: u32) -> Result<(CellId, u32)> {
        let bin_size =
            ((actual as usize + BIN_HEADER_SIZE).div_ceil(BLOCK_SIZE) * BLOCK_SIZE) as u32;

        if self.config().allow_free_bin_reuse {
            self.coalesce_discarded(kind);
            if let Some(found) = self.reuse_free_bin(kind, bin_size)? {
                return Ok(found);
            }
        }

        match kind {
            StorageKind::Stable => self.append_stable_bin(bin_size),
            StorageKind::Volatile => self.append_volatile_bin(bin_size),
        }
    }

    fn append_stable_bin(&mut self, bin_size: u32) -> Result<(CellId, u32)> {
        let old_len = self.storage(StorageKind::Stable).length;

        // a bin smaller than one view must not straddle a view boundary;
        // pad to the boundary with a discardable free bin
        let mut pad: Option<(u32, u32)> = None;
        let mut bin_off = old_len;
        if (bin_size as usize) < VIEW_SIZE {
            let first_view = bin_off / VIEW_SIZE as u32;
            let last_view = (bin_off + bin_size - 1) / VIEW_SIZE as u32;
            if first_view != last_view {
                let boundary = (first_view + 1) * VIEW_SIZE as u32;
                pad = Some((bin_off, boundary - bin_off));
                bin_off = boundary;
            }
        }
        let new_len = bin_off + bin_size;

        let quota = self.config().storage_quota;
        let requested = crate::config::BASE_BLOCK_SIZE as u64 + new_len as u64;
        if requested > quota {
            return Err(HiveError::QuotaExceeded { requested, quota }.into());
        }

        let file_old = crate::config::BASE_BLOCK_SIZE as u64 + old_len as u64;
        let file_new = crate::config::BASE_BLOCK_SIZE as u64 + new_len as u64;
        self.backing_mut().set_size(file_new, file_old)?;

        // the padding bin's image goes straight to disk; it is free space
        // and never needs log protection
        if let Some((pad_off, pad_size)) = pad {
            let image = fresh_bin_image(pad_off, pad_size);
            if let Err(err) = self
                .backing_mut()
                .write_at(crate::config::BASE_BLOCK_SIZE as u64 + pad_off as u64, &image)
            {
                let _ = self.backing_mut().set_size(file_old, file_new);
                return Err(err);
            }
        }

        let first_block = bin_off / BLOCK_SIZE as u32;
        let last_block = (new_len - 1) / BLOCK_SIZE as u32;
        if let Err(err) = self.mark_blocks_dirty(first_block, last_block) {
            let _ = self.backing_mut().set_size(file_old, file_new);
            return Err(err);
        }

        let storage = self.storage_mut(StorageKind::Stable);
        let pad_record_idx = storage.free_bins.len() as u32;
        let mut entries = Vec::new();
        if let Some((pad_off, pad_size)) = pad {
            for _ in 0..pad_size as usize / BLOCK_SIZE {
                entries.push(MapEntry {
                    bin_offset: pad_off,
                    bin_size: pad_size,
                    backing: BinBacking::Discarded(pad_record_idx),
                });
            }
        }
        let pool_idx = storage.pool.iter().position(|s| s.is_none()).unwrap_or(storage.pool.len())
            as u32;
        for _ in 0..bin_size as usize / BLOCK_SIZE {
            entries.push(MapEntry {
                bin_offset: bin_off,
                bin_size,
                backing: BinBacking::Pool(pool_idx),
            });
        }
        if let Err(err) = storage.map.grow(&entries) {
            self.unmark_blocks_dirty(first_block, last_block);
            let _ = self.backing_mut().set_size(file_old, file_new);
            return Err(err);
        }

        // commit
        let storage = self.storage_mut(StorageKind::Stable);
        if let Some((pad_off, pad_size)) = pad {
            storage.free_bins.push(FreeBin {
                offset: pad_off,
                size: pad_size,
                discardable: true,
            });
        }
        let buf = fresh_bin_image(bin_off, bin_size).into_boxed_slice();
        let adopted = storage.adopt_pool_bin(buf);
        debug_assert_eq!(adopted, pool_idx);
        storage.length = new_len;

        Ok((
            CellId::new(StorageKind::Stable, bin_off + BIN_HEADER_SIZE as u32),
            bin_size - BIN_HEADER_SIZE as u32,
        ))
    }

    fn append_volatile_bin(&mut self, bin_size: u32) -> Result<(CellId, u32)> {
        let storage = self.storage_mut(StorageKind::Volatile);
        let bin_off = storage.length;

        let pool_idx =
            storage.pool.iter().position(|s| s.is_none()).unwrap_or(storage.pool.len()) as u32;
        let entries: Vec<MapEntry> = (0..bin_size as usize / BLOCK_SIZE)
            .map(|_| MapEntry {
                bin_offset: bin_off,
                bin_size,
                backing: BinBacking::Pool(pool_idx),
            })
            .collect();
        storage.map.grow(&entries)?;

        let buf = fresh_bin_image(bin_off, bin_size).into_boxed_slice();
        let adopted = storage.adopt_pool_bin(buf);
        debug_assert_eq!(adopted, pool_idx);
        storage.length = bin_off + bin_size;

        Ok((
            CellId::new(StorageKind::Volatile, bin_off + BIN_HEADER_SIZE as u32),
            bin_size - BIN_HEADER_SIZE as u32,
        ))
    }

    /// Re-materializes a discarded free bin of at least `bin_size` bytes.
    /// The whole record is reused as one bin.
    fn reuse_free_bin(&mut self, kind: StorageKind, bin_size: u32) -> Result<Option<(CellId, u32)>> {
        let candidate = {
            let storage = self.storage(kind);
            let mut best: Option<(usize, u32)> = None;
            for (idx, record) in storage.free_bins.iter().enumerate() {
                if !record.discardable || record.size < bin_size {
                    continue;
                }
                if best.map_or(true, |(_, size)| record.size < size) {
                    best = Some((idx, record.size));
                }
                if record.size == bin_size {
                    break;
                }
            }
            best.map(|(idx, _)| idx)
        };
        let Some(idx) = candidate else {
            return Ok(None);
        };
        let record = self.storage(kind).free_bins[idx];

        // cached windows over the range are stale once rewritten
        if kind == StorageKind::Stable {
            let first = record.offset / VIEW_SIZE as u32;
            let last = (record.offset + record.size - 1) / VIEW_SIZE as u32;
            for view_no in first..=last {
                if !self.views().invalidate(view_no) {
                    return Ok(None);
                }
            }

            let first_block = record.offset / BLOCK_SIZE as u32;
            let last_block = (record.offset + record.size - 1) / BLOCK_SIZE as u32;
            self.mark_blocks_dirty(first_block, last_block)?;
        }

        let storage = self.storage_mut(kind);
        storage.free_bins.swap_remove(idx);
        if idx < storage.free_bins.len() {
            // patch map entries of the record that moved into slot idx
            let moved = storage.free_bins[idx];
            let first = moved.offset / BLOCK_SIZE as u32;
            let last = (moved.offset + moved.size - 1) / BLOCK_SIZE as u32;
            for block in first..=last {
                if let Some(entry) = storage.map.get_mut(block) {
                    entry.backing = BinBacking::Discarded(idx as u32);
                }
            }
        }

        let buf = fresh_bin_image(record.offset, record.size).into_boxed_slice();
        let pool_idx = storage.adopt_pool_bin(buf);
        let first = record.offset / BLOCK_SIZE as u32;
        let last = (record.offset + record.size - 1) / BLOCK_SIZE as u32;
        for block in first..=last {
            if let Some(entry) = storage.map.get_mut(block) {
                *entry = MapEntry {
                    bin_offset: record.offset,
                    bin_size: record.size,
                    backing: BinBacking::Pool(pool_idx),
                };
            }
        }

        Ok(Some((
            CellId::new(kind, record.offset + BIN_HEADER_SIZE as u32),
            record.size - BIN_HEADER_SIZE as u32,
        )))
    }

    /// Drops an entirely-free bin's bytes and leaves a free-bin record.
    fn vacate_bin(&mut self, kind: StorageKind, entry: MapEntry) -> Result<()> {
        let storage = self.storage_mut(kind);
        storage
            .free_display
            .delist_bin(entry.bin_offset, entry.bin_size);

        let record_idx = storage.free_bins.len() as u32;
        let mut discardable = true;

        match (kind, entry.backing) {
            (StorageKind::Volatile, BinBacking::Pool(idx)) => {
                storage.pool[idx as usize] = None;
            }
            (StorageKind::Stable, BinBacking::Pool(idx)) => {
                storage.pool[idx as usize] = None;
                let image = fresh_bin_image(entry.bin_offset, entry.bin_size);
                self.backing_mut().write_at(
                    crate::config::BASE_BLOCK_SIZE as u64 + entry.bin_offset as u64,
                    &image,
                )?;
                let first = entry.bin_offset / BLOCK_SIZE as u32;
                let last = (entry.bin_offset + entry.bin_size - 1) / BLOCK_SIZE as u32;
                self.unmark_blocks_dirty(first, last);
                let first_view = entry.bin_offset / VIEW_SIZE as u32;
                let last_view = (entry.bin_offset + entry.bin_size - 1) / VIEW_SIZE as u32;
                for view_no in first_view..=last_view {
                    self.views().invalidate(view_no);
                }
            }
            (StorageKind::Stable, BinBacking::View) => {
                let view_no = entry.bin_offset / VIEW_SIZE as u32;
                if self.views().invalidate(view_no) {
                    let image = fresh_bin_image(entry.bin_offset, entry.bin_size);
                    self.backing_mut().write_at(
                        crate::config::BASE_BLOCK_SIZE as u64 + entry.bin_offset as u64,
                        &image,
                    )?;
                    let first = entry.bin_offset / BLOCK_SIZE as u32;
                    let last = (entry.bin_offset + entry.bin_size - 1) / BLOCK_SIZE as u32;
                    self.unmark_blocks_dirty(first, last);
                } else {
                    // window is busy; rewrite through it and let the next
                    // flush carry the image out
                    let mut guard = self.bin_guard(kind, entry)?;
                    let image = fresh_bin_image(entry.bin_offset, entry.bin_size);
                    guard.bytes_mut().copy_from_slice(&image);
                    drop(guard);
                    discardable = false;
                }
            }
            (kind, backing) => {
                eyre::bail!(
                    "cannot vacate bin at offset {} with backing {:?} in {:?} storage",
                    entry.bin_offset,
                    backing,
                    kind
                );
            }
        }

        let storage = self.storage_mut(kind);
        storage.free_bins.push(FreeBin {
            offset: entry.bin_offset,
            size: entry.bin_size,
            discardable,
        });
        let first = entry.bin_offset / BLOCK_SIZE as u32;
        let last = (entry.bin_offset + entry.bin_size - 1) / BLOCK_SIZE as u32;
        for block in first..=last {
            if let Some(map_entry) = storage.map.get_mut(block) {
                map_entry.backing = BinBacking::Discarded(record_idx);
            }
        }
        Ok(())
    }

    /// Merges adjacent discardable free-bin records so large requests can
    /// reuse space freed as small bins.
    pub(crate) fn coalesce_discarded(&mut self, kind: StorageKind) {
        let storage = self.storage_mut(kind);
        if storage.free_bins.len() < 2 {
            return;
        }

        let mut records: Vec<FreeBin> = storage.free_bins.clone();
        records.sort_by_key(|r| r.offset);

        let mut merged: Vec<FreeBin> = Vec::with_capacity(records.len());
        for record in records {
            match merged.last_mut() {
                Some(last)
                    if last.discardable
                        && record.discardable
                        && last.offset + last.size == record.offset =>
                {
                    last.size += record.size;
                }
                _ => merged.push(record),
            }
        }
        if merged.len() == storage.free_bins.len() {
            return;
        }

        storage.free_bins = merged;
        for (idx, record) in storage.free_bins.iter().enumerate() {
            let first = record.offset / BLOCK_SIZE as u32;
            let last = (record.offset + record.size - 1) / BLOCK_SIZE as u32;
            for block in first..=last {
                if let Some(entry) = storage.map.get_mut(block) {
                    *entry = MapEntry {
                        bin_offset: record.offset,
                        bin_size: record.size,
                        backing: BinBacking::Discarded(idx as u32),
                    };
                }
            }
        }
    }

    fn mark_span_dirty(&mut self, kind: StorageKind, class_off: u32, len: u32) -> Result<()> {
        if kind == StorageKind::Volatile {
            return Ok(());
        }
        let first = class_off / BLOCK_SIZE as u32;
        let last = (class_off + len - 1) / BLOCK_SIZE as u32;
        self.mark_blocks_dirty(first, last)
    }
}

/// A fresh bin image: header plus one free cell covering the rest.
fn fresh_bin_image(offset: u32, size: u32) -> Vec<u8> {
    use zerocopy::IntoBytes;
    let mut image = vec![0u8; size as usize];
    image[..BIN_HEADER_SIZE].copy_from_slice(BinHeader::new(offset, size).as_bytes());
    bin::set_raw_cell_size(&mut image, BIN_HEADER_SIZE, (size as usize - BIN_HEADER_SIZE) as i32);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HiveConfig;
    use crate::io::MemoryBacking;

    fn new_hive() -> Hive {
        Hive::create(Box::new(MemoryBacking::new(0)), HiveConfig::default()).unwrap()
    }

    #[test]
    fn padding_rounds_to_cell_granularity() {
        assert_eq!(pad_cell_size(0), MIN_FREE_CELL_SIZE);
        assert_eq!(pad_cell_size(1), 8);
        assert_eq!(pad_cell_size(4), 8);
        assert_eq!(pad_cell_size(5), 16);
        assert_eq!(pad_cell_size(12), 16);
    }

    #[test]
    fn large_cells_round_to_power_of_two() {
        assert_eq!(adjust_cell_size(VIEW_SIZE), VIEW_SIZE);
        assert_eq!(adjust_cell_size(VIEW_SIZE + 8), 2 * VIEW_SIZE);
        assert_eq!(adjust_cell_size(100_000), 131_072);
    }

    #[test]
    fn allocate_write_read_back() {
        let mut hive = new_hive();

        let cell = hive.allocate_cell(StorageKind::Stable, 100, None).unwrap();
        {
            let mut guard = hive.cell(cell).unwrap();
            assert!(guard.len() >= 100);
            guard.data_mut()[..5].copy_from_slice(b"cells");
        }

        let guard = hive.cell(cell).unwrap();
        assert_eq!(&guard.data()[..5], b"cells");
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let mut hive = new_hive();

        let err = hive
            .allocate_cell(StorageKind::Stable, SANE_CELL_MAX + 1, None)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<HiveError>(),
            Some(HiveError::CellTooLarge(_))
        ));
    }

    #[test]
    fn free_then_allocate_reuses_storage() {
        let mut hive = new_hive();

        let a = hive.allocate_cell(StorageKind::Stable, 64, None).unwrap();
        let _b = hive.allocate_cell(StorageKind::Stable, 64, None).unwrap();
        let len_before = hive.storage_length(StorageKind::Stable);

        hive.free_cell(a).unwrap();
        let c = hive.allocate_cell(StorageKind::Stable, 64, None).unwrap();

        assert_eq!(c, a);
        assert_eq!(hive.storage_length(StorageKind::Stable), len_before);
    }

    #[test]
    fn double_free_is_detected() {
        let mut hive = new_hive();
        let a = hive.allocate_cell(StorageKind::Stable, 32, None).unwrap();
        let _b = hive.allocate_cell(StorageKind::Stable, 32, None).unwrap();

        hive.free_cell(a).unwrap();

        assert!(hive.free_cell(a).is_err());
    }

    #[test]
    fn neighbors_coalesce_on_free() {
        let mut hive = new_hive();

        let a = hive.allocate_cell(StorageKind::Stable, 56, None).unwrap();
        let b = hive.allocate_cell(StorageKind::Stable, 56, None).unwrap();
        let c = hive.allocate_cell(StorageKind::Stable, 56, None).unwrap();
        let _d = hive.allocate_cell(StorageKind::Stable, 56, None).unwrap();

        hive.free_cell(a).unwrap();
        hive.free_cell(c).unwrap();
        hive.free_cell(b).unwrap();

        // a+b+c merged into one free cell; an allocation spanning all
        // three lands at a's offset
        let merged = hive
            .allocate_cell(StorageKind::Stable, 3 * 64 - CELL_HEADER_SIZE, None)
            .unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn freeing_every_cell_vacates_the_bin() {
        let mut hive = new_hive();

        let a = hive.allocate_cell(StorageKind::Stable, 64, None).unwrap();
        let b = hive.allocate_cell(StorageKind::Stable, 64, None).unwrap();
        hive.free_cell(a).unwrap();
        hive.free_cell(b).unwrap();

        assert!(!hive.is_cell_allocated(a));
        assert!(hive.cell(a).is_err());
        // the space comes back when needed
        let c = hive.allocate_cell(StorageKind::Stable, 64, None).unwrap();
        assert_eq!(c.kind(), StorageKind::Stable);
    }

    #[test]
    fn storage_quota_bounds_growth() {
        let cfg = HiveConfig {
            storage_quota: (crate::config::BASE_BLOCK_SIZE + 2 * BLOCK_SIZE) as u64,
            ..HiveConfig::default()
        };
        let mut hive = Hive::create(Box::new(MemoryBacking::new(0)), cfg).unwrap();

        hive.allocate_cell(StorageKind::Stable, 3000, None).unwrap();
        let err = hive
            .allocate_cell(StorageKind::Stable, 2 * BLOCK_SIZE, None)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<HiveError>(),
            Some(HiveError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn volatile_cells_live_in_their_own_class() {
        let mut hive = new_hive();

        let v = hive.allocate_cell(StorageKind::Volatile, 48, None).unwrap();
        assert_eq!(v.kind(), StorageKind::Volatile);
        assert_eq!(hive.storage_length(StorageKind::Stable), 0);

        {
            let mut guard = hive.cell(v).unwrap();
            guard.data_mut()[0] = 0x5A;
        }
        assert_eq!(hive.cell(v).unwrap().data()[0], 0x5A);
        assert_eq!(hive.dirty_block_count(), 0);
    }

    #[test]
    fn reallocate_in_place_when_room_exists() {
        let mut hive = new_hive();

        let cell = hive.allocate_cell(StorageKind::Stable, 40, None).unwrap();
        {
            let mut guard = hive.cell(cell).unwrap();
            guard.data_mut()[..4].copy_from_slice(b"keep");
        }

        // shrink keeps the index
        let same = hive.reallocate_cell(cell, 16).unwrap();
        assert_eq!(same, cell);

        // growth into the free tail of the bin also keeps the index
        let grown = hive.reallocate_cell(cell, 200).unwrap();
        assert_eq!(grown, cell);
        assert_eq!(&hive.cell(cell).unwrap().data()[..4], b"keep");
    }

    #[test]
    fn reallocate_relocates_when_blocked() {
        let mut hive = new_hive();

        let cell = hive.allocate_cell(StorageKind::Stable, 40, None).unwrap();
        let _wall = hive.allocate_cell(StorageKind::Stable, 40, None).unwrap();
        {
            let mut guard = hive.cell(cell).unwrap();
            guard.data_mut()[..4].copy_from_slice(b"data");
        }

        let moved = hive.reallocate_cell(cell, 3000).unwrap();

        assert_ne!(moved, cell);
        assert_eq!(&hive.cell(moved).unwrap().data()[..4], b"data");
        assert!(!hive.is_cell_allocated(cell));
    }

    #[test]
    fn duplicate_copies_across_classes() {
        let mut hive = new_hive();

        let stable = hive.allocate_cell(StorageKind::Stable, 24, None).unwrap();
        {
            let mut guard = hive.cell(stable).unwrap();
            guard.data_mut()[..3].copy_from_slice(b"abc");
        }

        let volatile = hive.duplicate_cell(stable, StorageKind::Volatile).unwrap();

        assert_eq!(volatile.kind(), StorageKind::Volatile);
        assert_eq!(&hive.cell(volatile).unwrap().data()[..3], b"abc");
    }

    #[test]
    fn small_bins_never_straddle_view_boundaries() {
        let mut hive = new_hive();

        // one 1-block bin, then 2-block bins until one would land at
        // 12288 and straddle the first view boundary
        let _first = hive.allocate_cell(StorageKind::Stable, 2000, None).unwrap();
        let mut cells = Vec::new();
        for _ in 0..3 {
            cells.push(hive.allocate_cell(StorageKind::Stable, 6000, None).unwrap());
        }

        for cell in &cells {
            let bin_off = cell.offset() - BIN_HEADER_SIZE as u32;
            let bin_size = 2 * BLOCK_SIZE as u32;
            assert_eq!(
                bin_off / VIEW_SIZE as u32,
                (bin_off + bin_size - 1) / VIEW_SIZE as u32,
                "bin at {bin_off} straddles a view boundary"
            );
        }
        // the bin that would have started at 12288 was pushed past the
        // boundary by a padding bin
        assert_eq!(
            cells[1].offset(),
            VIEW_SIZE as u32 + BIN_HEADER_SIZE as u32
        );
    }

    #[test]
    fn coalesce_discarded_merges_adjacent_records() {
        let mut hive = new_hive();

        // two adjacent one-block bins, both vacated
        let a = hive.allocate_cell(StorageKind::Stable, 3000, None).unwrap();
        let b = hive.allocate_cell(StorageKind::Stable, 3000, None).unwrap();
        hive.free_cell(a).unwrap();
        hive.free_cell(b).unwrap();

        // a request needing both records fits only if they merged
        let big = hive.allocate_cell(StorageKind::Stable, 8000, None).unwrap();
        assert_eq!(big.offset(), BIN_HEADER_SIZE as u32);
        assert_eq!(hive.storage_length(StorageKind::Stable), 2 * BLOCK_SIZE as u32);
    }
}
