//! # Key Node and Index Layouts
//!
//! ## Key Node (44 bytes + name)
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  -------------------------------------
//! 0       2     signature       "kn"
//! 2       2     flags
//! 4       8     timestamp       Last-write time, caller-defined ticks
//! 12      4     parent          Parent key cell; NIL for the root
//! 16      8     subkey_counts   One count per storage class
//! 24      8     subkey_lists    One index cell per storage class
//! 32      4     value_count
//! 36      4     value_list      Cell holding value-entry indices
//! 40      2     name_length     Bytes of name following the header
//! 42      2     spare
//! ```
//!
//! ## Subkey Index (4 bytes + entries)
//!
//! A sorted array of child key cells: signature "ix", a count, then one
//! little-endian cell index per child. Order is by uppercase name, so
//! lookups binary-search and enumeration is deterministic.
//!
//! The value list cell is a bare array of cell indices; its count lives
//! in the key node.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::hive::{CellId, StorageKind};

/// "kn", little-endian.
pub const KEY_SIGNATURE: u16 = 0x6e6b;
/// "ix", little-endian.
pub const INDEX_SIGNATURE: u16 = 0x7869;

/// Set on the hive's root key.
pub const KEY_FLAG_ROOT: u16 = 0x0001;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct KeyNode {
    signature: U16,
    flags: U16,
    timestamp: U64,
    parent: U32,
    subkey_counts: [U32; 2],
    subkey_lists: [U32; 2],
    value_count: U32,
    value_list: U32,
    name_length: U16,
    spare: U16,
}

const _: () = assert!(size_of::<KeyNode>() == 44);

impl KeyNode {
    pub fn new(parent: CellId, flags: u16, name_length: usize) -> Self {
        Self {
            signature: U16::new(KEY_SIGNATURE),
            flags: U16::new(flags),
            timestamp: U64::new(0),
            parent: U32::new(parent.0),
            subkey_counts: [U32::new(0); 2],
            subkey_lists: [U32::new(CellId::NIL.0); 2],
            value_count: U32::new(0),
            value_list: U32::new(CellId::NIL.0),
            name_length: U16::new(name_length as u16),
            spare: U16::new(0),
        }
    }

    zerocopy_accessors! {
        signature: u16,
        flags: u16,
        timestamp: u64,
        value_count: u32,
        name_length: u16,
    }

    pub fn parent(&self) -> CellId {
        CellId(self.parent.get())
    }

    pub fn set_parent(&mut self, parent: CellId) {
        self.parent = U32::new(parent.0);
    }

    pub fn subkey_count(&self, kind: StorageKind) -> u32 {
        self.subkey_counts[kind.index()].get()
    }

    pub fn set_subkey_count(&mut self, kind: StorageKind, count: u32) {
        self.subkey_counts[kind.index()] = U32::new(count);
    }

    pub fn subkey_list(&self, kind: StorageKind) -> CellId {
        CellId(self.subkey_lists[kind.index()].get())
    }

    pub fn set_subkey_list(&mut self, kind: StorageKind, list: CellId) {
        self.subkey_lists[kind.index()] = U32::new(list.0);
    }

    pub fn value_list(&self) -> CellId {
        CellId(self.value_list.get())
    }

    pub fn set_value_list(&mut self, list: CellId) {
        self.value_list = U32::new(list.0);
    }

    pub fn is_root(&self) -> bool {
        self.flags() & KEY_FLAG_ROOT != 0
    }

    pub fn total_subkeys(&self) -> u32 {
        self.subkey_count(StorageKind::Stable) + self.subkey_count(StorageKind::Volatile)
    }

    pub fn validate(&self, cell: CellId) -> Result<()> {
        ensure!(
            self.signature() == KEY_SIGNATURE,
            "cell {} is not a key node (signature {:04x})",
            cell,
            self.signature()
        );
        Ok(())
    }
}

/// Subkey index header; `count` entries of 4 bytes follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IndexHeader {
    signature: U16,
    count: U16,
}

impl IndexHeader {
    pub fn new(count: usize) -> Self {
        Self {
            signature: U16::new(INDEX_SIGNATURE),
            count: U16::new(count as u16),
        }
    }

    zerocopy_accessors! {
        signature: u16,
        count: u16,
    }
}

/// Payload bytes an index cell needs for `count` children.
pub fn index_cell_size(count: usize) -> usize {
    size_of::<IndexHeader>() + count * 4
}

/// Name ordering: case-insensitive over ASCII, byte order elsewhere.
/// This is the sort order of every subkey index, so it must never change
/// for data written with it.
pub fn name_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let left = a.iter().map(u8::to_ascii_uppercase);
    let right = b.iter().map(u8::to_ascii_uppercase);
    left.cmp(right)
}

/// Decodes an index cell's child list.
pub fn decode_index(data: &[u8]) -> Result<Vec<CellId>> {
    let (header, rest) = IndexHeader::read_from_prefix(data)
        .map_err(|_| eyre::eyre!("cell too small for a subkey index"))?;
    ensure!(
        header.signature() == INDEX_SIGNATURE,
        "not a subkey index (signature {:04x})",
        header.signature()
    );
    let count = header.count() as usize;
    ensure!(
        rest.len() >= count * 4,
        "subkey index truncated: {} entries in {} bytes",
        count,
        rest.len()
    );
    Ok((0..count)
        .map(|i| CellId(u32::from_le_bytes(rest[i * 4..i * 4 + 4].try_into().unwrap())))
        .collect())
}

/// Writes an index cell image for `children` into `out`.
pub fn encode_index(children: &[CellId], out: &mut [u8]) -> Result<()> {
    ensure!(
        out.len() >= index_cell_size(children.len()),
        "index cell too small for {} children",
        children.len()
    );
    out[..size_of::<IndexHeader>()].copy_from_slice(IndexHeader::new(children.len()).as_bytes());
    for (i, child) in children.iter().enumerate() {
        let off = size_of::<IndexHeader>() + i * 4;
        out[off..off + 4].copy_from_slice(&child.0.to_le_bytes());
    }
    Ok(())
}
