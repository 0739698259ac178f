//! # Bin and Cell Layout
//!
//! Storage inside a hive is carved into *bins*: contiguously addressed
//! runs of one or more blocks, each starting with a 32-byte header. The
//! rest of a bin is packed with variable-length *cells*.
//!
//! ## Bin Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       4     signature    "hbin"
//! 4       4     file_offset  Offset of this bin within its storage class
//! 8       4     size         Total bin size in bytes (multiple of BLOCK_SIZE)
//! 12      4     reserved0
//! 16      8     reserved1
//! 24      8     timestamp    Write time of the bin's first flush (informational)
//! ```
//!
//! ## Cell Layout
//!
//! A cell is a signed 32-bit size word followed by payload. The sign is
//! the allocation state: negative = allocated, positive = free, and the
//! absolute value is the full cell length including the size word. Cells
//! are `CELL_PAD`-aligned and never span bins; walking `size` bytes from
//! one cell header lands exactly on the next. A free cell's first payload
//! word is reused as scratch by the free-cell display.
//!
//! ## Zero-Copy Access
//!
//! `BinHeader` uses `zerocopy` for safe transmutation from raw bytes, so
//! headers are read directly out of view or pool memory without copying.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{BIN_HEADER_SIZE, BLOCK_SIZE, CELL_HEADER_SIZE, CELL_PAD};

/// "hbin", little-endian.
pub const BIN_SIGNATURE: u32 = 0x6e69_6268;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BinHeader {
    signature: U32,
    file_offset: U32,
    size: U32,
    reserved0: U32,
    reserved1: U64,
    timestamp: U64,
}

impl BinHeader {
    pub fn new(file_offset: u32, size: u32) -> Self {
        Self {
            signature: U32::new(BIN_SIGNATURE),
            file_offset: U32::new(file_offset),
            size: U32::new(size),
            reserved0: U32::new(0),
            reserved1: U64::new(0),
            timestamp: U64::new(0),
        }
    }

    zerocopy_accessors! {
        signature: u32,
        file_offset: u32,
        size: u32,
        timestamp: u64,
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for BinHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read BinHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for BinHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read BinHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for BinHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        data[..size_of::<Self>()].copy_from_slice(self.as_bytes());
        Ok(())
    }
}

const _: () = assert!(size_of::<BinHeader>() == BIN_HEADER_SIZE);

/// Raw signed size word of the cell at `offset` within bin bytes.
pub fn raw_cell_size(bin: &[u8], offset: usize) -> i32 {
    debug_assert!(offset + CELL_HEADER_SIZE <= bin.len());
    i32::from_le_bytes(bin[offset..offset + CELL_HEADER_SIZE].try_into().unwrap())
}

pub fn set_raw_cell_size(bin: &mut [u8], offset: usize, size: i32) {
    debug_assert!(offset + CELL_HEADER_SIZE <= bin.len());
    bin[offset..offset + CELL_HEADER_SIZE].copy_from_slice(&size.to_le_bytes());
}

/// One cell encountered while walking a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSpan {
    /// Offset of the cell's size word within the bin.
    pub offset: usize,
    /// Full cell length including the size word.
    pub size: usize,
    pub free: bool,
}

/// Walks every cell in a bin in address order. Stops early (yielding an
/// error) when a size word is implausible, so a corrupt bin cannot send
/// the walk out of bounds or into an infinite loop.
pub fn walk_cells(bin: &[u8]) -> impl Iterator<Item = Result<CellSpan>> + '_ {
    let bin_size = bin.len();
    let mut offset = BIN_HEADER_SIZE;
    let mut poisoned = false;

    std::iter::from_fn(move || {
        if poisoned || offset >= bin_size {
            return None;
        }

        let raw = raw_cell_size(bin, offset);
        let size = raw.unsigned_abs() as usize;

        if raw == 0 || size % CELL_PAD != 0 || offset + size > bin_size {
            poisoned = true;
            return Some(Err(eyre::eyre!(
                "corrupt cell at bin offset {}: size word {}",
                offset,
                raw
            )));
        }

        let span = CellSpan {
            offset,
            size,
            free: raw > 0,
        };
        offset += size;
        Some(Ok(span))
    })
}

/// Structural validation of one bin's header and cell chain.
pub fn validate_bin(bin: &[u8], expected_offset: u32) -> Result<()> {
    ensure!(
        bin.len() >= BLOCK_SIZE && bin.len() % BLOCK_SIZE == 0,
        "invalid bin size: {}",
        bin.len()
    );

    let header = BinHeader::from_bytes(bin)?;

    ensure!(
        header.signature() == BIN_SIGNATURE,
        "bad bin signature {:08x} at offset {}",
        header.signature(),
        expected_offset
    );
    ensure!(
        header.file_offset() == expected_offset,
        "bin header offset {} does not match map offset {}",
        header.file_offset(),
        expected_offset
    );
    ensure!(
        header.size() as usize == bin.len(),
        "bin header size {} does not match mapped size {}",
        header.size(),
        bin.len()
    );

    let mut end = BIN_HEADER_SIZE;
    for span in walk_cells(bin) {
        let span = span?;
        end = span.offset + span.size;
    }
    ensure!(
        end == bin.len(),
        "cell chain ends at {} instead of bin size {}",
        end,
        bin.len()
    );

    Ok(())
}
