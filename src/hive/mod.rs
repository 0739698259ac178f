//! # Hive Storage Engine
//!
//! A hive is a transactional, self-describing store of variable-length
//! *cells* addressed by opaque 32-bit [`CellId`]s. This module owns the
//! engine core: the on-disk base block, the per-class storage state
//! (length, map, free display, pool bins, free-bin records), cell
//! resolution, dirty tracking and the two-phase flush.
//!
//! ## File Layout
//!
//! ```text
//! offset 0            BASE_BLOCK_SIZE                      end of file
//! +------------+------------------------------------------------+
//! | base block |  bin | bin | bin | ...                         |
//! +------------+------------------------------------------------+
//!               ^ stable class offset 0
//! ```
//!
//! The base block carries paired sequence numbers: `sequence1` is bumped
//! and written before data blocks, `sequence2` after. Equal sequences mean
//! the last flush completed; unequal means it was torn and the hive needs
//! log recovery before the image can be trusted.
//!
//! ## Bin Residency
//!
//! Where a bin's bytes live depends on its history and size:
//!
//! - freshly added bins (and all volatile bins) live in *pool* buffers;
//! - stable bins no larger than one view migrate to *view* backing after
//!   their first flush, so a cold hive costs views, not resident copies;
//! - stable bins larger than one view stay pool-backed for their lifetime,
//!   which keeps every view-backed cell inside a single view window;
//! - entirely-free bins are *discarded*: their bytes are dropped and only
//!   a free-bin record remains until the space is reused.
//!
//! ## Concurrency Contract
//!
//! A `Hive` is one logical store; the embedding layer serializes mutation
//! (the key-control-block cache above provides the locking discipline).
//! Methods take `&mut self` so the compiler enforces that contract here.

pub mod alloc;
pub mod bin;
pub mod freecells;
pub mod index;
pub mod map;

use eyre::{bail, ensure, Result, WrapErr};
use roaring::RoaringBitmap;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{
    HiveConfig, BASE_BLOCK_SIZE, BIN_HEADER_SIZE, BLOCK_SIZE, CELL_HEADER_SIZE, VIEW_SIZE,
};
use crate::io::FileBacking;
use crate::views::{ViewCache, ViewRef};

pub use bin::{walk_cells, BinHeader, CellSpan, BIN_SIGNATURE};
pub use index::{CellId, StorageKind};
pub use map::{BinBacking, MapEntry, StorageMap};

use freecells::FreeDisplay;

/// Typed failures the embedding layer dispatches on. Everything else
/// travels as contextual `eyre` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiveError {
    /// Stable storage growth would exceed the configured quota.
    QuotaExceeded { requested: u64, quota: u64 },
    /// The dirty footprint would exceed the write-ahead log budget.
    NoLogSpace { needed: u64, quota: u64 },
    /// The cell index does not resolve to mapped, allocated storage.
    UnmappedCell(CellId),
    /// Every view is pinned or in use; the cache cannot fault more in.
    OutOfViews,
    /// Allocation request above the sanity cap.
    CellTooLarge(usize),
}

impl std::fmt::Display for HiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HiveError::QuotaExceeded { requested, quota } => {
                write!(
                    f,
                    "storage quota exceeded: growth to {requested} bytes over quota {quota}"
                )
            }
            HiveError::NoLogSpace { needed, quota } => {
                write!(
                    f,
                    "log budget exhausted: dirty footprint {needed} bytes over quota {quota}"
                )
            }
            HiveError::UnmappedCell(cell) => write!(f, "cell {cell} is not mapped"),
            HiveError::OutOfViews => write!(f, "all mapped views are pinned or in use"),
            HiveError::CellTooLarge(size) => {
                write!(f, "cell allocation of {size} bytes above sanity cap")
            }
        }
    }
}

impl std::error::Error for HiveError {}

/// "hive", little-endian.
pub const BASE_SIGNATURE: u32 = 0x6576_6968;

pub const HIVE_VERSION_MAJOR: u32 = 1;
pub const HIVE_VERSION_MINOR: u32 = 0;

/// On-disk hive file header. Occupies the whole first block; the tail is
/// reserved. The checksum is the XOR fold of the 126 little-endian words
/// preceding it, with 0 mapped to 1 and !0 to !0 - 1 so neither all-zero
/// nor all-ones blocks ever verify.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BaseBlock {
    signature: U32,
    sequence1: U32,
    sequence2: U32,
    timestamp: U64,
    major: U32,
    minor: U32,
    root_cell: U32,
    length: U32,
    reserved: [u8; 468],
    checksum: U32,
    reserved_tail: [u8; 4],
}

const _: () = assert!(size_of::<BaseBlock>() == 512);
const BASE_CHECKSUM_WORDS: usize = 126;

impl BaseBlock {
    pub fn new() -> Self {
        let mut base = Self {
            signature: U32::new(BASE_SIGNATURE),
            sequence1: U32::new(1),
            sequence2: U32::new(1),
            timestamp: U64::new(0),
            major: U32::new(HIVE_VERSION_MAJOR),
            minor: U32::new(HIVE_VERSION_MINOR),
            root_cell: U32::new(CellId::NIL.0),
            length: U32::new(0),
            reserved: [0; 468],
            checksum: U32::new(0),
            reserved_tail: [0; 4],
        };
        base.update_checksum();
        base
    }

    zerocopy_accessors! {
        signature: u32,
        sequence1: u32,
        sequence2: u32,
        timestamp: u64,
        major: u32,
        minor: u32,
        length: u32,
        checksum: u32,
    }

    pub fn root_cell(&self) -> CellId {
        CellId(self.root_cell.get())
    }

    pub fn set_root_cell(&mut self, cell: CellId) {
        self.root_cell = U32::new(cell.0);
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.as_bytes();
        let mut sum = 0u32;
        for word in 0..BASE_CHECKSUM_WORDS {
            let off = word * 4;
            sum ^= u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        }
        match sum {
            0 => 1,
            u32::MAX => u32::MAX - 1,
            s => s,
        }
    }

    pub fn update_checksum(&mut self) {
        self.checksum = U32::new(self.compute_checksum());
    }

    pub fn checksum_ok(&self) -> bool {
        self.checksum() == self.compute_checksum()
    }

    /// Unequal sequence numbers mean the last flush was torn.
    pub fn needs_recovery(&self) -> bool {
        self.sequence1() != self.sequence2()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.signature() == BASE_SIGNATURE,
            "bad base block signature {:08x}",
            self.signature()
        );
        ensure!(self.checksum_ok(), "base block checksum mismatch");
        ensure!(
            self.major() == HIVE_VERSION_MAJOR,
            "unsupported hive version {}.{}",
            self.major(),
            self.minor()
        );
        ensure!(
            self.length() as usize % BLOCK_SIZE == 0,
            "base block length {} is not block aligned",
            self.length()
        );
        Ok(())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for base block"
        );
        Self::read_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read base block: {:?}", e))
    }
}

impl Default for BaseBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Record of an entirely-free bin whose bytes have been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBin {
    /// Class-relative offset of the bin.
    pub offset: u32,
    /// Bin size in bytes.
    pub size: u32,
    /// A discardable bin's image already exists on disk (or never needs
    /// to, for volatile storage); a non-discardable one must be written
    /// out on the next flush before its memory may be dropped.
    pub discardable: bool,
}

/// In-memory state of one storage class.
pub(crate) struct Storage {
    /// Class length in bytes; bins cover exactly `[0, length)`.
    pub length: u32,
    pub map: StorageMap,
    pub free_display: FreeDisplay,
    pub free_bins: Vec<FreeBin>,
    /// Pool bin buffers; `BinBacking::Pool(i)` indexes this list. Slots
    /// are tombstoned rather than removed so indices stay stable.
    pub pool: Vec<Option<Box<[u8]>>>,
}

impl Storage {
    fn new() -> Self {
        Self {
            length: 0,
            map: StorageMap::new(),
            free_display: FreeDisplay::new(),
            free_bins: Vec::new(),
            pool: Vec::new(),
        }
    }

    pub fn entry(&self, cell: CellId) -> Result<MapEntry> {
        self.map
            .get(cell.block())
            .copied()
            .ok_or_else(|| HiveError::UnmappedCell(cell).into())
    }

    /// Stores `buf` in a pool slot and returns its index, reusing a
    /// tombstone when one exists.
    pub fn adopt_pool_bin(&mut self, buf: Box<[u8]>) -> u32 {
        if let Some(idx) = self.pool.iter().position(|slot| slot.is_none()) {
            self.pool[idx] = Some(buf);
            idx as u32
        } else {
            self.pool.push(Some(buf));
            (self.pool.len() - 1) as u32
        }
    }
}

enum GuardInner<'a> {
    Pool(&'a mut [u8]),
    View(ViewRef<'a>),
}

impl GuardInner<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            GuardInner::Pool(slice) => slice,
            GuardInner::View(view) => view.data(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            GuardInner::Pool(slice) => slice,
            GuardInner::View(view) => view.data_mut(),
        }
    }
}

/// Use-counted access to one allocated cell's payload. While the guard is
/// alive its backing (pool buffer or view) cannot go away.
pub struct CellGuard<'a> {
    inner: GuardInner<'a>,
    /// Offset of the cell's size word within the guard's slice.
    cell_off: usize,
    /// Full cell size including the size word.
    size: usize,
}

impl std::fmt::Debug for CellGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellGuard")
            .field("cell_off", &self.cell_off)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl CellGuard<'_> {
    /// Payload bytes, exclusive of the size word.
    pub fn data(&self) -> &[u8] {
        &self.inner.bytes()[self.cell_off + CELL_HEADER_SIZE..self.cell_off + self.size]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.inner.bytes_mut()[self.cell_off + CELL_HEADER_SIZE..self.cell_off + self.size]
    }

    /// Payload capacity in bytes.
    pub fn len(&self) -> usize {
        self.size - CELL_HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whole-bin access for the allocator and checker.
pub(crate) struct BinGuard<'a> {
    inner: GuardInner<'a>,
    start: usize,
    len: usize,
}

impl BinGuard<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes()[self.start..self.start + self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.inner.bytes_mut()[self.start..self.start + self.len]
    }
}

/// One hive: a base block, stable and volatile storage, and the machinery
/// to page, mutate and flush them.
pub struct Hive {
    cfg: HiveConfig,
    backing: Box<dyn FileBacking>,
    views: ViewCache,
    base: BaseBlock,
    storage: [Storage; StorageKind::COUNT],
    /// Dirty stable blocks by logical block number.
    dirty: RoaringBitmap,
    /// Bytes of log the current dirty footprint would need.
    log_footprint: u64,
    /// Set at open when the sequence numbers disagreed.
    recovered: bool,
    /// Set when the consistency checker repaired structural damage.
    self_healed: bool,
}

impl Hive {
    /// Creates an empty hive on `backing`. The store is sized to exactly
    /// the base block; the first allocation adds the first bin.
    pub fn create(mut backing: Box<dyn FileBacking>, cfg: HiveConfig) -> Result<Self> {
        let base = BaseBlock::new();

        let old_len = backing.len();
        backing.set_size(BASE_BLOCK_SIZE as u64, old_len)?;
        write_base_block(backing.as_mut(), &base)?;
        backing.flush()?;

        let views = ViewCache::new(cfg.view_capacity);
        Ok(Self {
            cfg,
            backing,
            views,
            base,
            storage: [Storage::new(), Storage::new()],
            dirty: RoaringBitmap::new(),
            log_footprint: 0,
            recovered: false,
            self_healed: false,
        })
    }

    /// Opens an existing hive image: validates the base block, rebuilds
    /// the storage map and free display by walking every bin.
    pub fn open(mut backing: Box<dyn FileBacking>, cfg: HiveConfig) -> Result<Self> {
        let mut header = vec![0u8; size_of::<BaseBlock>()];
        backing
            .read_at(0, &mut header)
            .wrap_err("failed to read base block")?;
        let mut base = BaseBlock::from_bytes(&header)?;
        base.validate()?;

        let recovered = base.needs_recovery();
        if recovered {
            // the torn flush is resolved by rolling forward: the image is
            // rebuilt from what is on disk and the next flush heals the pair
            base.set_sequence2(base.sequence1());
            base.update_checksum();
        }

        let length = base.length();
        ensure!(
            backing.len() >= BASE_BLOCK_SIZE as u64 + length as u64,
            "hive file truncated: base block claims {} data bytes",
            length
        );

        let mut stable = Storage::new();
        let mut offset = 0u32;
        while offset < length {
            let bin_size = load_bin(backing.as_mut(), &mut stable, offset, length, &cfg)?;
            offset += bin_size;
        }
        stable.length = length;

        let views = ViewCache::new(cfg.view_capacity);
        Ok(Self {
            cfg,
            backing,
            views,
            base,
            storage: [stable, Storage::new()],
            dirty: RoaringBitmap::new(),
            log_footprint: 0,
            recovered,
            self_healed: false,
        })
    }

    pub fn config(&self) -> &HiveConfig {
        &self.cfg
    }

    /// True when the opened image carried unequal sequence numbers.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    /// True when the consistency checker repaired structural damage in
    /// this instance's lifetime.
    pub fn self_healed(&self) -> bool {
        self.self_healed
    }

    pub(crate) fn set_self_healed(&mut self) {
        self.self_healed = true;
    }

    pub fn root_cell(&self) -> CellId {
        self.base.root_cell()
    }

    pub fn set_root_cell(&mut self, cell: CellId) {
        self.base.set_root_cell(cell);
    }

    /// Bytes of storage currently mapped for `kind`.
    pub fn storage_length(&self, kind: StorageKind) -> u32 {
        self.storage[kind.index()].length
    }

    pub(crate) fn storage(&self, kind: StorageKind) -> &Storage {
        &self.storage[kind.index()]
    }

    pub(crate) fn storage_mut(&mut self, kind: StorageKind) -> &mut Storage {
        &mut self.storage[kind.index()]
    }

    pub(crate) fn backing_mut(&mut self) -> &mut dyn FileBacking {
        self.backing.as_mut()
    }

    pub(crate) fn views(&self) -> &ViewCache {
        &self.views
    }

    // --- cell resolution ----------------------------------------------

    /// Resolves an allocated cell to its payload bytes.
    pub fn cell(&mut self, cell: CellId) -> Result<CellGuard<'_>> {
        let (guard, cell_off) = self.resolve(cell)?;
        let raw = bin::raw_cell_size(guard_slice(&guard), cell_off);
        ensure!(
            raw < 0,
            "cell {} is not allocated (size word {})",
            cell,
            raw
        );
        let size = raw.unsigned_abs() as usize;
        ensure!(
            cell_off + size <= guard_slice(&guard).len(),
            "cell {} overruns its bin",
            cell
        );

        Ok(CellGuard {
            inner: guard,
            cell_off,
            size,
        })
    }

    /// Payload capacity of an allocated cell.
    pub fn cell_size(&mut self, cell: CellId) -> Result<usize> {
        Ok(self.cell(cell)?.len())
    }

    /// Whether `cell` resolves to an allocated cell at a plausible
    /// offset. Never fails; used by the consistency checker.
    pub fn is_cell_allocated(&mut self, cell: CellId) -> bool {
        if cell.is_nil() || cell.offset() as usize % crate::config::CELL_PAD != 0 {
            return false;
        }
        let Ok(entry) = self.storage(cell.kind()).entry(cell) else {
            return false;
        };
        if entry.is_discarded() {
            return false;
        }
        let rel = (cell.offset() - entry.bin_offset) as usize;
        if rel < BIN_HEADER_SIZE || rel + CELL_HEADER_SIZE > entry.bin_size as usize {
            return false;
        }
        let Ok((guard, cell_off)) = self.resolve(cell) else {
            return false;
        };
        let slice = guard_slice(&guard);
        let raw = bin::raw_cell_size(slice, cell_off);
        raw < 0 && cell_off + raw.unsigned_abs() as usize <= slice.len()
    }

    fn resolve(&mut self, cell: CellId) -> Result<(GuardInner<'_>, usize)> {
        ensure!(!cell.is_nil(), "cannot resolve the nil cell index");
        let entry = self.storage(cell.kind()).entry(cell)?;
        let rel = (cell.offset() - entry.bin_offset) as usize;
        ensure!(
            rel >= BIN_HEADER_SIZE && rel < entry.bin_size as usize,
            "cell {} points outside its bin's cell area",
            cell
        );

        match entry.backing {
            BinBacking::Discarded(_) => Err(HiveError::UnmappedCell(cell).into()),
            BinBacking::Pool(idx) => {
                let slice = pool_bin_mut(&mut self.storage[cell.kind().index()], idx)?;
                // pool guard covers the whole bin; cell offset is bin-relative
                Ok((GuardInner::Pool(slice), rel))
            }
            BinBacking::View => {
                let view = map_view(
                    &self.views,
                    self.backing.as_mut(),
                    self.storage[StorageKind::Stable.index()].length,
                    cell.view_window(),
                )?;
                let in_view = cell.offset() as usize % VIEW_SIZE;
                Ok((GuardInner::View(view), in_view))
            }
        }
    }

    /// Whole-bin access by map entry; the allocator works on these.
    pub(crate) fn bin_guard(&mut self, kind: StorageKind, entry: MapEntry) -> Result<BinGuard<'_>> {
        match entry.backing {
            BinBacking::Discarded(_) => {
                bail!("bin at {} offset {} is discarded", kind_name(kind), entry.bin_offset)
            }
            BinBacking::Pool(idx) => {
                let slice = pool_bin_mut(&mut self.storage[kind.index()], idx)?;
                let len = slice.len();
                Ok(BinGuard {
                    inner: GuardInner::Pool(slice),
                    start: 0,
                    len,
                })
            }
            BinBacking::View => {
                debug_assert!(kind == StorageKind::Stable);
                debug_assert!(entry.bin_size as usize <= VIEW_SIZE);
                let view_no = entry.bin_offset / VIEW_SIZE as u32;
                let view = map_view(
                    &self.views,
                    self.backing.as_mut(),
                    self.storage[StorageKind::Stable.index()].length,
                    view_no,
                )?;
                Ok(BinGuard {
                    inner: GuardInner::View(view),
                    start: entry.bin_offset as usize % VIEW_SIZE,
                    len: entry.bin_size as usize,
                })
            }
        }
    }

    // --- dirty tracking ------------------------------------------------

    /// Marks every stable block covered by `cell` dirty. Volatile cells
    /// need no tracking and the call is a no-op for them.
    pub fn mark_cell_dirty(&mut self, cell: CellId) -> Result<()> {
        if cell.kind() == StorageKind::Volatile {
            return Ok(());
        }
        let size = {
            let guard = self.cell(cell)?;
            guard.len() + CELL_HEADER_SIZE
        };
        let first = cell.block();
        let last = (cell.offset() as usize + size - 1) / BLOCK_SIZE;
        self.mark_blocks_dirty(first, last as u32)
    }

    /// Marks the stable block range `[first, last]` dirty, growing the
    /// log footprint. Fails with `NoLogSpace` without marking anything
    /// when the footprint would exceed the quota.
    pub(crate) fn mark_blocks_dirty(&mut self, first: u32, last: u32) -> Result<()> {
        let mut added = 0u64;
        for block in first..=last {
            if !self.dirty.contains(block) {
                added += BLOCK_SIZE as u64;
            }
        }

        let needed = self.log_footprint + added;
        if needed > self.cfg.log_quota {
            return Err(HiveError::NoLogSpace {
                needed,
                quota: self.cfg.log_quota,
            }
            .into());
        }

        self.dirty.insert_range(first..=last);
        self.log_footprint = needed;
        Ok(())
    }

    /// Clears dirty bits in `[first, last]`, shrinking the log footprint.
    /// Used when the marked range was unwound or written out of band.
    pub(crate) fn unmark_blocks_dirty(&mut self, first: u32, last: u32) {
        for block in first..=last {
            if self.dirty.remove(block) {
                self.log_footprint -= BLOCK_SIZE as u64;
            }
        }
    }

    pub fn dirty_block_count(&self) -> u64 {
        self.dirty.len()
    }

    // --- flush ----------------------------------------------------------

    /// Two-phase flush: bump `sequence1` and write the base block, write
    /// every dirty stable block, then write the base block again with
    /// `sequence2` caught up. A crash between the two header writes
    /// leaves the sequence numbers unequal, which `open` detects.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() && !self.views_dirty() {
            // still persist root/length changes
            self.base.set_length(self.storage[StorageKind::Stable.index()].length);
            self.base.update_checksum();
            write_base_block(self.backing.as_mut(), &self.base)?;
            return self.backing.flush();
        }

        self.base
            .set_length(self.storage[StorageKind::Stable.index()].length);
        self.base.set_sequence1(self.base.sequence1() + 1);
        self.base.update_checksum();
        write_base_block(self.backing.as_mut(), &self.base)?;
        self.backing.flush()?;

        self.write_dirty_blocks()?;
        self.views
            .flush_dirty(|view_no, data| {
                let file_off = BASE_BLOCK_SIZE as u64 + view_no as u64 * VIEW_SIZE as u64;
                let stable_len = self.storage[StorageKind::Stable.index()].length as u64;
                let window_start = view_no as u64 * VIEW_SIZE as u64;
                let valid = (stable_len - window_start).min(VIEW_SIZE as u64) as usize;
                self.backing.write_at(file_off, &data[..valid])
            })
            .wrap_err("failed to write dirty views")?;
        self.demote_flushed_bins()?;
        self.backing.flush()?;

        self.base.set_sequence2(self.base.sequence1());
        self.base.update_checksum();
        write_base_block(self.backing.as_mut(), &self.base)?;
        self.backing.flush()?;

        self.dirty.clear();
        self.log_footprint = 0;
        self.recovered = false;
        Ok(())
    }

    fn views_dirty(&self) -> bool {
        self.views.has_dirty()
    }

    /// Writes dirty blocks that live in pool bins. View-backed dirty
    /// blocks ride along with their dirty view.
    fn write_dirty_blocks(&mut self) -> Result<()> {
        let blocks: Vec<u32> = self.dirty.iter().collect();
        for block in blocks {
            let Some(entry) = self.storage[StorageKind::Stable.index()]
                .map
                .get(block)
                .copied()
            else {
                // unwound growth can leave stale dirty bits
                continue;
            };
            let BinBacking::Pool(idx) = entry.backing else {
                continue;
            };
            let block_off = block as u64 * BLOCK_SIZE as u64;
            let in_bin = (block_off - entry.bin_offset as u64) as usize;
            let storage = &self.storage[StorageKind::Stable.index()];
            let buf = storage.pool[idx as usize]
                .as_ref()
                .ok_or_else(|| eyre::eyre!("pool bin {} has no buffer", idx))?;
            self.backing.write_at(
                BASE_BLOCK_SIZE as u64 + block_off,
                &buf[in_bin..in_bin + BLOCK_SIZE],
            )?;
        }
        Ok(())
    }

    /// After a flush, stable pool bins that fit in one view and do not
    /// straddle a view boundary drop their resident copy; the next access
    /// faults them in through the view cache.
    fn demote_flushed_bins(&mut self) -> Result<()> {
        let views = &self.views;
        let storage = &mut self.storage[StorageKind::Stable.index()];
        let mut offset = 0u32;
        while offset < storage.length {
            let entry = *storage
                .map
                .get(offset / BLOCK_SIZE as u32)
                .ok_or_else(|| eyre::eyre!("hole in storage map at offset {}", offset))?;
            let size = entry.bin_size;
            if let BinBacking::Pool(idx) = entry.backing {
                // a cached window over this range is stale; if it cannot
                // be dropped the bin stays pooled until the next flush
                let fits_view = size as usize <= VIEW_SIZE
                    && offset / VIEW_SIZE as u32 == (offset + size - 1) / VIEW_SIZE as u32
                    && views.invalidate(offset / VIEW_SIZE as u32);
                if fits_view {
                    storage.pool[idx as usize] = None;
                    let first = offset / BLOCK_SIZE as u32;
                    let last = (offset + size - 1) / BLOCK_SIZE as u32;
                    for block in first..=last {
                        if let Some(entry) = storage.map.get_mut(block) {
                            entry.backing = BinBacking::View;
                        }
                    }
                }
            }
            offset += size;
        }

        // free-bin records become discardable once the flush made their
        // on-disk image current
        for record in &mut storage.free_bins {
            record.discardable = true;
        }
        Ok(())
    }
}

fn kind_name(kind: StorageKind) -> &'static str {
    match kind {
        StorageKind::Stable => "stable",
        StorageKind::Volatile => "volatile",
    }
}

fn guard_slice<'a>(guard: &'a GuardInner<'_>) -> &'a [u8] {
    guard.bytes()
}

fn pool_bin_mut(storage: &mut Storage, idx: u32) -> Result<&mut [u8]> {
    storage
        .pool
        .get_mut(idx as usize)
        .and_then(|slot| slot.as_deref_mut())
        .ok_or_else(|| eyre::eyre!("pool bin {} has no buffer", idx))
}

fn write_base_block(backing: &mut dyn FileBacking, base: &BaseBlock) -> Result<()> {
    backing
        .write_at(0, base.as_bytes())
        .wrap_err("failed to write base block")
}

/// Faults in the stable view window `view_no`.
fn map_view<'a>(
    views: &'a ViewCache,
    backing: &mut dyn FileBacking,
    stable_length: u32,
    view_no: u32,
) -> Result<ViewRef<'a>> {
    views.get_or_map(view_no, |data| {
        let window_start = view_no as u64 * VIEW_SIZE as u64;
        ensure!(
            window_start < stable_length as u64,
            "view window {} past end of stable storage",
            view_no
        );
        let valid = ((stable_length as u64) - window_start).min(VIEW_SIZE as u64) as usize;
        backing.read_at(BASE_BLOCK_SIZE as u64 + window_start, &mut data[..valid])
    })
}

/// Loads the bin at stable offset `offset` during open: builds its map
/// entries, pools it when it is too big for view backing, and rebuilds
/// its slice of the free display. Returns the bin size.
fn load_bin(
    backing: &mut dyn FileBacking,
    stable: &mut Storage,
    offset: u32,
    length: u32,
    cfg: &HiveConfig,
) -> Result<u32> {
    let file_off = BASE_BLOCK_SIZE as u64 + offset as u64;
    let mut header = [0u8; BIN_HEADER_SIZE];
    backing
        .read_at(file_off, &mut header)
        .wrap_err_with(|| format!("failed to read bin header at offset {}", offset))?;
    let header = BinHeader::from_bytes(&header)?;

    ensure!(
        header.signature() == BIN_SIGNATURE,
        "bad bin signature at stable offset {}",
        offset
    );
    let size = header.size();
    ensure!(
        size as usize % BLOCK_SIZE == 0 && size > 0 && offset + size <= length,
        "implausible bin size {} at stable offset {}",
        size,
        offset
    );
    ensure!(
        header.file_offset() == offset,
        "bin header offset {} does not match position {}",
        header.file_offset(),
        offset
    );

    let mut bytes = vec![0u8; size as usize].into_boxed_slice();
    backing.read_at(file_off, &mut bytes)?;
    bin::validate_bin(&bytes, offset)
        .wrap_err_with(|| format!("corrupt bin at stable offset {}", offset))?;

    // an entirely-free bin is kept as a discarded record instead of
    // resident bytes
    let spans: Vec<CellSpan> = walk_cells(&bytes).collect::<Result<_>>()?;
    let wholly_free = spans.len() == 1 && spans[0].free;

    let backing_kind = if wholly_free && cfg.allow_free_bin_reuse {
        stable.free_bins.push(FreeBin {
            offset,
            size,
            discardable: true,
        });
        BinBacking::Discarded((stable.free_bins.len() - 1) as u32)
    } else {
        for span in &spans {
            if span.free {
                stable.free_display.enlist(
                    CellId::new(StorageKind::Stable, offset + span.offset as u32),
                    span.size as u32,
                );
            }
        }
        let straddles = size as usize <= VIEW_SIZE
            && offset / VIEW_SIZE as u32 != (offset + size - 1) / VIEW_SIZE as u32;
        if size as usize > VIEW_SIZE || straddles {
            BinBacking::Pool(stable.adopt_pool_bin(bytes))
        } else {
            BinBacking::View
        }
    };

    let blocks = size as usize / BLOCK_SIZE;
    let entries: Vec<MapEntry> = (0..blocks)
        .map(|_| MapEntry {
            bin_offset: offset,
            bin_size: size,
            backing: backing_kind,
        })
        .collect();
    stable.map.grow(&entries)?;

    Ok(size)
}
