//! # Hive Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> BASE_BLOCK_SIZE (one block, the hive file header)
//!       │
//!       ├─> VIEW_SIZE (16384 = 4 blocks per mapped window)
//!       │     A bin smaller than one view must never straddle a view
//!       │     boundary; add_bin pads the file to the next view-aligned
//!       │     offset and enlists the padding as a discardable free bin.
//!       │
//!       ├─> CELL_OFFSET_BITS (12, because BLOCK_SIZE == 1 << 12)
//!       │
//!       └─> MAP_TABLE_SIZE / MAP_DIRECTORY_SIZE
//!             A cell index is  [class:1][dir:10][table:9][offset:12],
//!             so one map table covers 512 blocks = 2 MiB of storage and
//!             a full directory covers 2^31 bytes per storage class.
//!
//! BIN_HEADER_SIZE + CELL_HEADER_SIZE
//!       │
//!       └─> MIN_BIN_SIZE: a bin must hold its header plus at least one
//!           minimal free cell, and must be a multiple of BLOCK_SIZE.
//!
//! BIG_CHUNK_SIZE (16344 bytes)
//!       │
//!       └─> BIG_VALUE_THRESHOLD: a value larger than one chunk switches
//!           to the chunked (big-data) representation. Chunk size is
//!           chosen so a chunk cell (header + data) stays within one
//!           view: 16344 + CELL_HEADER_SIZE + padding <= VIEW_SIZE.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by the compile-time assertions at the bottom of this file:
//!
//! 1. `BLOCK_SIZE` is a power of two and `VIEW_SIZE` a multiple of it
//! 2. `CELL_PAD` divides `BLOCK_SIZE` (cells stay pad-aligned in a bin)
//! 3. `BIG_CHUNK_SIZE + CELL_HEADER_SIZE` rounds up to at most `VIEW_SIZE`
//! 4. `MAP_TABLE_SIZE == 1 << MAP_TABLE_BITS` (index decomposition)
//!
//! ## Modifying Constants
//!
//! Before changing any constant check the dependency graph above; the
//! compile-time assertions catch the worst mismatches, the test suite the
//! rest. The small/big value thresholds and `VIEW_SIZE` are historical
//! tuning values, not format requirements; they are configuration with
//! documented defaults, but every hive written with one set of values
//! must be read with the same set.

/// Storage granularity: bins and the storage map work in 4 KiB blocks.
pub const BLOCK_SIZE: usize = 4096;

/// The hive file header occupies exactly one block at file offset 0.
/// Stable cell offsets are relative to the end of the base block.
pub const BASE_BLOCK_SIZE: usize = BLOCK_SIZE;

/// Size of one mapped window over the backing file (4 blocks).
pub const VIEW_SIZE: usize = 16384;

/// Blocks covered by one view.
pub const BLOCKS_PER_VIEW: usize = VIEW_SIZE / BLOCK_SIZE;

/// Default number of views the cache keeps mapped per hive.
pub const DEFAULT_VIEW_CAPACITY: usize = 64;

/// Bin header bytes at the start of every bin.
pub const BIN_HEADER_SIZE: usize = 32;

/// Bytes of cell overhead (the signed size word) preceding cell payload.
pub const CELL_HEADER_SIZE: usize = 4;

/// Cell sizes and offsets are multiples of this.
pub const CELL_PAD: usize = 8;

/// A free cell must hold its header plus a free-list back link.
pub const MIN_FREE_CELL_SIZE: usize = 8;

/// Reject cell allocations above this; nothing legitimate is this big
/// (big values are chunked well below it).
pub const SANE_CELL_MAX: usize = 1024 * 1024;

/// Above this, allocated cell sizes round to the next power of two so a
/// value grown a little at a time does not shred the bin into fragments.
/// Sits at the view size so a big-value chunk cell stays exact and never
/// doubles past a view window.
pub const CELL_GRANULARITY_THRESHOLD: usize = VIEW_SIZE;

/// Cell index decomposition: [class:1][directory:10][table:9][offset:12].
pub const CELL_OFFSET_BITS: u32 = 12;
pub const MAP_TABLE_BITS: u32 = 9;
pub const MAP_DIRECTORY_BITS: u32 = 10;

/// Blocks per second-level map table.
pub const MAP_TABLE_SIZE: usize = 1 << MAP_TABLE_BITS;

/// Tables per map directory.
pub const MAP_DIRECTORY_SIZE: usize = 1 << MAP_DIRECTORY_BITS;

/// Values of at most this many bytes are stored inline in the value
/// descriptor itself, no data cell at all.
pub const SMALL_VALUE_MAX: usize = 4;

/// Payload bytes per big-data chunk cell. Only the last chunk of a value
/// may be shorter.
pub const BIG_CHUNK_SIZE: usize = 16344;

/// Values strictly larger than this switch to the chunked representation.
pub const BIG_VALUE_THRESHOLD: usize = BIG_CHUNK_SIZE;

/// Depth cap for the explicit-stack tree walks (checker, copy, shift).
/// A deeper tree is reported as corrupt rather than walked.
pub const MAX_CHECK_DEPTH: usize = 512;

/// Default hard cap on how far a hive's stable storage may grow.
pub const DEFAULT_STORAGE_QUOTA: u64 = 512 * 1024 * 1024;

/// Default write-ahead log budget cap; the log budget grows with the
/// dirty footprint and allocation fails with NoLogSpace past this.
pub const DEFAULT_LOG_QUOTA: u64 = 64 * 1024 * 1024;

/// Page size the KCB/delay slab allocators carve into fixed slots.
pub const SLAB_PAGE_SIZE: usize = 4096;

/// KCB hash table bucket count (power of two).
pub const KCB_BUCKET_COUNT: usize = 64;

/// Capacity of the delayed-close ring; KCBs past this many zero-ref
/// entries are actually freed.
pub const DELAYED_CLOSE_SIZE: usize = 512;

/// Free-cell display size classes per storage class.
pub const FREE_DISPLAY_SIZE: usize = 24;

const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(VIEW_SIZE % BLOCK_SIZE == 0);
const _: () = assert!(BLOCK_SIZE % CELL_PAD == 0);
const _: () = assert!(BLOCK_SIZE == 1 << CELL_OFFSET_BITS);
const _: () = assert!(MAP_TABLE_SIZE == 1 << MAP_TABLE_BITS);
const _: () = assert!(MAP_DIRECTORY_SIZE == 1 << MAP_DIRECTORY_BITS);
const _: () = assert!(BIG_CHUNK_SIZE + CELL_HEADER_SIZE + CELL_PAD <= VIEW_SIZE);
const _: () = assert!(MIN_FREE_CELL_SIZE >= CELL_HEADER_SIZE);
const _: () = assert!(BASE_BLOCK_SIZE == BLOCK_SIZE);
const _: () = assert!(KCB_BUCKET_COUNT.is_power_of_two());
