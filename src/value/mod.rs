//! # Value Storage
//!
//! A value is a named, typed byte string hanging off a key. The descriptor
//! cell holds the name and type; where the data itself lives depends on
//! its size:
//!
//! - **small** (<= 4 bytes): packed into the descriptor's `data` field,
//!   flagged by the high bit of `data_length`; no data cell at all
//! - **normal** (<= `BIG_VALUE_THRESHOLD` bytes): one data cell, `data`
//!   holds its index
//! - **big**: the data is split into `BIG_CHUNK_SIZE` chunks, each in its
//!   own cell; `data` points at a header cell which points at an index
//!   list of chunk cells. Chunking keeps every cell small enough that no
//!   allocation ever spans a view window.
//!
//! Rewrites that stay big adjust only the chunk delta: surplus chunks are
//! freed, missing ones allocated, the index list reallocated once, and
//! unchanged chunk cells rewritten in place.
//!
//! ## Descriptor Layout (20 bytes + name)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       2     signature    "vk"
//! 2       2     name_length  Bytes of name following the header
//! 4       4     data_length  Data size; bit 31 set = small inline data
//! 8       4     data         Inline bytes, or data/header cell index
//! 12      4     value_type   Caller-defined type tag, stored verbatim
//! 16      2     flags
//! 18      2     spare
//! ```

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{BIG_CHUNK_SIZE, BIG_VALUE_THRESHOLD, SMALL_VALUE_MAX};
use crate::hive::{CellId, Hive, StorageKind};
use crate::tree::RemapTable;

/// "vk", little-endian.
pub const VALUE_SIGNATURE: u16 = 0x6b76;
/// "db", little-endian.
pub const BIG_DATA_SIGNATURE: u16 = 0x6264;

const SMALL_DATA_BIT: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ValueEntry {
    signature: U16,
    name_length: U16,
    data_length: U32,
    data: U32,
    value_type: U32,
    flags: U16,
    spare: U16,
}

impl ValueEntry {
    zerocopy_accessors! {
        signature: u16,
        name_length: u16,
        data_length: u32,
        data: u32,
        value_type: u32,
    }

    pub fn is_small(&self) -> bool {
        self.data_length() & SMALL_DATA_BIT != 0
    }

    /// Data size with the small-data flag stripped.
    pub fn payload_length(&self) -> u32 {
        self.data_length() & !SMALL_DATA_BIT
    }

    pub fn is_big(&self) -> bool {
        !self.is_small() && self.payload_length() as usize > BIG_VALUE_THRESHOLD
    }

    pub fn data_cell(&self) -> CellId {
        CellId(self.data())
    }
}

/// Header cell for chunked big data.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BigData {
    signature: U16,
    count: U16,
    list: U32,
}

impl BigData {
    zerocopy_accessors! {
        signature: u16,
        count: u16,
        list: u32,
    }
}

/// Chunk cells needed for `len` bytes of big data.
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(BIG_CHUNK_SIZE)
}

/// Decoded value metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueMeta {
    pub name: Vec<u8>,
    pub value_type: u32,
    pub data_length: u32,
}

impl Hive {
    /// Creates a value descriptor with its data in the representation the
    /// size calls for. Partially allocated cells are freed on failure.
    pub fn create_value(
        &mut self,
        kind: StorageKind,
        name: &[u8],
        value_type: u32,
        data: &[u8],
    ) -> Result<CellId> {
        ensure!(name.len() <= u16::MAX as usize, "value name too long");

        let (data_field, data_length) = self.build_data(kind, data)?;

        let entry_size = size_of::<ValueEntry>() + name.len();
        let entry_cell = match self.allocate_cell(kind, entry_size, None) {
            Ok(cell) => cell,
            Err(err) => {
                let _ = self.free_data(data_field, data_length);
                return Err(err);
            }
        };

        let entry = ValueEntry {
            signature: U16::new(VALUE_SIGNATURE),
            name_length: U16::new(name.len() as u16),
            data_length: U32::new(data_length),
            data: U32::new(data_field),
            value_type: U32::new(value_type),
            flags: U16::new(0),
            spare: U16::new(0),
        };

        {
            let mut guard = self.cell(entry_cell)?;
            let bytes = guard.data_mut();
            bytes[..size_of::<ValueEntry>()].copy_from_slice(entry.as_bytes());
            bytes[size_of::<ValueEntry>()..size_of::<ValueEntry>() + name.len()]
                .copy_from_slice(name);
        }
        self.mark_cell_dirty(entry_cell)?;
        Ok(entry_cell)
    }

    /// Reads a value's name, type and data length.
    pub fn value_meta(&mut self, value_cell: CellId) -> Result<ValueMeta> {
        let guard = self.cell(value_cell)?;
        let (entry, rest) = ValueEntry::read_from_prefix(guard.data())
            .map_err(|_| eyre::eyre!("cell {} too small for a value entry", value_cell))?;
        ensure!(
            entry.signature() == VALUE_SIGNATURE,
            "cell {} is not a value entry (signature {:04x})",
            value_cell,
            entry.signature()
        );
        let name_len = entry.name_length() as usize;
        ensure!(
            rest.len() >= name_len,
            "value entry {} truncates its own name",
            value_cell
        );
        Ok(ValueMeta {
            name: rest[..name_len].to_vec(),
            value_type: entry.value_type(),
            data_length: entry.payload_length(),
        })
    }

    /// Reads a value's data regardless of representation.
    pub fn read_value_data(&mut self, value_cell: CellId) -> Result<Vec<u8>> {
        let entry = self.read_entry(value_cell)?;
        let len = entry.payload_length() as usize;

        if entry.is_small() {
            ensure!(
                len <= SMALL_VALUE_MAX,
                "small value flag with {} bytes of data",
                len
            );
            return Ok(entry.data().to_le_bytes()[..len].to_vec());
        }

        if !entry.is_big() {
            let guard = self.cell(entry.data_cell())?;
            ensure!(
                guard.len() >= len,
                "value data cell shorter than recorded length {}",
                len
            );
            return Ok(guard.data()[..len].to_vec());
        }

        let chunks = self.read_chunk_list(entry.data_cell())?;
        ensure!(
            chunks.len() == chunk_count(len),
            "big value chunk count {} does not cover {} bytes",
            chunks.len(),
            len
        );

        let mut out = Vec::with_capacity(len);
        for (i, chunk) in chunks.iter().enumerate() {
            let want = (len - i * BIG_CHUNK_SIZE).min(BIG_CHUNK_SIZE);
            let guard = self.cell(*chunk)?;
            ensure!(
                guard.len() >= want,
                "big value chunk {} shorter than expected",
                i
            );
            out.extend_from_slice(&guard.data()[..want]);
        }
        Ok(out)
    }

    /// Replaces a value's data. A rewrite that stays big touches only the
    /// chunk delta; every other transition rebuilds the representation
    /// and frees the old one.
    pub fn write_value_data(&mut self, value_cell: CellId, data: &[u8]) -> Result<()> {
        let old = self.read_entry(value_cell)?;

        let (data_field, data_length) =
            if old.is_big() && data.len() > BIG_VALUE_THRESHOLD {
                self.rewrite_big(old.data_cell(), data)?;
                (old.data(), data.len() as u32)
            } else {
                let built = self.build_data(value_cell.kind(), data)?;
                self.free_data(old.data(), old.data_length())?;
                built
            };

        let mut guard = self.cell(value_cell)?;
        let bytes = guard.data_mut();
        let (mut entry, _) = ValueEntry::read_from_prefix(bytes)
            .map_err(|_| eyre::eyre!("cell {} too small for a value entry", value_cell))?;
        entry.set_data(data_field);
        entry.set_data_length(data_length);
        bytes[..size_of::<ValueEntry>()].copy_from_slice(entry.as_bytes());
        drop(guard);
        self.mark_cell_dirty(value_cell)
    }

    /// Frees a value's descriptor and whatever data cells it owns.
    pub fn delete_value(&mut self, value_cell: CellId) -> Result<()> {
        let entry = self.read_entry(value_cell)?;
        self.free_data(entry.data(), entry.data_length())?;
        self.free_cell(value_cell)
    }

    fn read_entry(&mut self, value_cell: CellId) -> Result<ValueEntry> {
        let guard = self.cell(value_cell)?;
        let (entry, _) = ValueEntry::read_from_prefix(guard.data())
            .map_err(|_| eyre::eyre!("cell {} too small for a value entry", value_cell))?;
        ensure!(
            entry.signature() == VALUE_SIGNATURE,
            "cell {} is not a value entry (signature {:04x})",
            value_cell,
            entry.signature()
        );
        Ok(entry)
    }

    /// Builds the representation for `data` and returns the descriptor's
    /// `(data, data_length)` fields. Cleans up after itself on failure.
    fn build_data(&mut self, kind: StorageKind, data: &[u8]) -> Result<(u32, u32)> {
        if data.len() <= SMALL_VALUE_MAX {
            let mut packed = [0u8; 4];
            packed[..data.len()].copy_from_slice(data);
            return Ok((
                u32::from_le_bytes(packed),
                data.len() as u32 | SMALL_DATA_BIT,
            ));
        }

        if data.len() <= BIG_VALUE_THRESHOLD {
            let cell = self.allocate_cell(kind, data.len(), None)?;
            let mut guard = self.cell(cell)?;
            guard.data_mut()[..data.len()].copy_from_slice(data);
            drop(guard);
            self.mark_cell_dirty(cell)?;
            return Ok((cell.0, data.len() as u32));
        }

        self.build_big(kind, data)
    }

    fn build_big(&mut self, kind: StorageKind, data: &[u8]) -> Result<(u32, u32)> {
        let count = chunk_count(data.len());
        ensure!(count <= u16::MAX as usize, "big value needs too many chunks");

        // cleanup list so a failure mid-build frees what was carved so far
        let mut allocated: Vec<CellId> = Vec::with_capacity(count + 2);
        let result = (|hive: &mut Hive, allocated: &mut Vec<CellId>| -> Result<u32> {
            let mut chunks = Vec::with_capacity(count);
            for piece in data.chunks(BIG_CHUNK_SIZE) {
                let chunk = hive.allocate_cell(kind, piece.len(), None)?;
                allocated.push(chunk);
                let mut guard = hive.cell(chunk)?;
                guard.data_mut()[..piece.len()].copy_from_slice(piece);
                drop(guard);
                hive.mark_cell_dirty(chunk)?;
                chunks.push(chunk);
            }

            let list = hive.allocate_cell(kind, count * 4, None)?;
            allocated.push(list);
            hive.write_chunk_list(list, &chunks)?;

            let header_cell = hive.allocate_cell(kind, size_of::<BigData>(), None)?;
            allocated.push(header_cell);
            let header = BigData {
                signature: U16::new(BIG_DATA_SIGNATURE),
                count: U16::new(count as u16),
                list: U32::new(list.0),
            };
            let mut guard = hive.cell(header_cell)?;
            guard.data_mut()[..size_of::<BigData>()].copy_from_slice(header.as_bytes());
            drop(guard);
            hive.mark_cell_dirty(header_cell)?;
            Ok(header_cell.0)
        })(self, &mut allocated);

        match result {
            Ok(header) => Ok((header, data.len() as u32)),
            Err(err) => {
                for cell in allocated {
                    let _ = self.free_cell(cell);
                }
                Err(err)
            }
        }
    }

    /// In-place rewrite of a big value through its existing header:
    /// chunk cells are reused, the count delta allocated or freed, and
    /// the index list resized once.
    fn rewrite_big(&mut self, header_cell: CellId, data: &[u8]) -> Result<()> {
        let kind = header_cell.kind();
        let header = self.read_big_header(header_cell)?;
        let mut chunks = self.read_chunk_list(CellId(header.list()))?;
        let new_count = chunk_count(data.len());

        while chunks.len() > new_count {
            let surplus = chunks.pop().ok_or_else(|| eyre::eyre!("chunk list underflow"))?;
            self.free_cell(surplus)?;
        }
        while chunks.len() < new_count {
            let chunk = self.allocate_cell(kind, BIG_CHUNK_SIZE, None)?;
            chunks.push(chunk);
        }

        for (i, piece) in data.chunks(BIG_CHUNK_SIZE).enumerate() {
            // a shrunken final chunk keeps its cell; capacity is reused
            let chunk = chunks[i];
            if self.cell_size(chunk)? < piece.len() {
                chunks[i] = self.reallocate_cell(chunk, piece.len())?;
            }
            let mut guard = self.cell(chunks[i])?;
            guard.data_mut()[..piece.len()].copy_from_slice(piece);
            drop(guard);
            self.mark_cell_dirty(chunks[i])?;
        }

        let list = self.reallocate_cell(CellId(header.list()), new_count * 4)?;
        self.write_chunk_list(list, &chunks)?;

        let mut updated = header;
        updated.set_count(new_count as u16);
        updated.set_list(list.0);
        let mut guard = self.cell(header_cell)?;
        guard.data_mut()[..size_of::<BigData>()].copy_from_slice(updated.as_bytes());
        drop(guard);
        self.mark_cell_dirty(header_cell)
    }

    fn read_big_header(&mut self, header_cell: CellId) -> Result<BigData> {
        let guard = self.cell(header_cell)?;
        let (header, _) = BigData::read_from_prefix(guard.data())
            .map_err(|_| eyre::eyre!("cell {} too small for a big-data header", header_cell))?;
        ensure!(
            header.signature() == BIG_DATA_SIGNATURE,
            "cell {} is not a big-data header (signature {:04x})",
            header_cell,
            header.signature()
        );
        Ok(header)
    }

    fn read_chunk_list(&mut self, header_cell: CellId) -> Result<Vec<CellId>> {
        let header = self.read_big_header(header_cell)?;
        let count = header.count() as usize;
        let list_cell = CellId(header.list());
        let guard = self.cell(list_cell)?;
        ensure!(
            guard.len() >= count * 4,
            "big-data list cell shorter than {} entries",
            count
        );
        let data = guard.data();
        Ok((0..count)
            .map(|i| CellId(u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap())))
            .collect())
    }

    fn write_chunk_list(&mut self, list: CellId, chunks: &[CellId]) -> Result<()> {
        let mut guard = self.cell(list)?;
        let bytes = guard.data_mut();
        for (i, chunk) in chunks.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&chunk.0.to_le_bytes());
        }
        drop(guard);
        self.mark_cell_dirty(list)
    }

    /// Frees whatever data cells the `(data, data_length)` pair owns.
    fn free_data(&mut self, data_field: u32, data_length: u32) -> Result<()> {
        if data_length & SMALL_DATA_BIT != 0 {
            return Ok(());
        }
        let len = (data_length & !SMALL_DATA_BIT) as usize;
        let cell = CellId(data_field);

        if len <= BIG_VALUE_THRESHOLD {
            return self.free_cell(cell);
        }

        let header = self.read_big_header(cell)?;
        let chunks = self.read_chunk_list(cell)?;
        for chunk in chunks {
            self.free_cell(chunk)?;
        }
        self.free_cell(CellId(header.list()))?;
        self.free_cell(cell)
    }

    /// Rewrites the data cell references a value owns through a
    /// relocation table. The descriptor cell itself is the caller's
    /// problem; this covers the data cell, the big-data header, its
    /// index list and every chunk.
    pub(crate) fn remap_value_data(
        &mut self,
        value_cell: CellId,
        remap: &RemapTable,
    ) -> Result<()> {
        let entry = self.read_entry(value_cell)?;
        if entry.is_small() {
            return Ok(());
        }

        let old_data = entry.data_cell();
        if let Some(&moved) = remap.get(&old_data) {
            let mut guard = self.cell(value_cell)?;
            let bytes = guard.data_mut();
            let (mut patched, _) = ValueEntry::read_from_prefix(bytes)
                .map_err(|_| eyre::eyre!("cell {} too small for a value entry", value_cell))?;
            patched.set_data(moved.0);
            bytes[..size_of::<ValueEntry>()].copy_from_slice(patched.as_bytes());
            drop(guard);
            self.mark_cell_dirty(value_cell)?;
        }
        if !entry.is_big() {
            return Ok(());
        }

        let header_cell = remap.get(&old_data).copied().unwrap_or(old_data);
        let header = self.read_big_header(header_cell)?;
        let old_list = CellId(header.list());
        if let Some(&moved) = remap.get(&old_list) {
            let mut guard = self.cell(header_cell)?;
            let bytes = guard.data_mut();
            let (mut patched, _) = BigData::read_from_prefix(bytes)
                .map_err(|_| eyre::eyre!("cell {} too small for a big-data header", header_cell))?;
            patched.set_list(moved.0);
            bytes[..size_of::<BigData>()].copy_from_slice(patched.as_bytes());
            drop(guard);
            self.mark_cell_dirty(header_cell)?;
        }

        let list_cell = remap.get(&old_list).copied().unwrap_or(old_list);
        let mut chunks = self.read_chunk_list(header_cell)?;
        let mut changed = false;
        for chunk in chunks.iter_mut() {
            if let Some(&moved) = remap.get(chunk) {
                *chunk = moved;
                changed = true;
            }
        }
        if changed {
            self.write_chunk_list(list_cell, &chunks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HiveConfig;
    use crate::io::MemoryBacking;

    fn new_hive() -> Hive {
        Hive::create(Box::new(MemoryBacking::new(0)), HiveConfig::default()).unwrap()
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn small_values_need_no_data_cell() {
        let mut hive = new_hive();

        let value = hive
            .create_value(StorageKind::Stable, b"flag", 4, &[0xDE, 0xAD])
            .unwrap();

        let meta = hive.value_meta(value).unwrap();
        assert_eq!(meta.name, b"flag");
        assert_eq!(meta.value_type, 4);
        assert_eq!(meta.data_length, 2);
        assert_eq!(hive.read_value_data(value).unwrap(), vec![0xDE, 0xAD]);
    }

    #[test]
    fn normal_values_use_one_data_cell() {
        let mut hive = new_hive();
        let data = patterned(600);

        let value = hive
            .create_value(StorageKind::Stable, b"blob", 3, &data)
            .unwrap();

        assert_eq!(hive.read_value_data(value).unwrap(), data);
    }

    #[test]
    fn big_values_are_chunked() {
        let mut hive = new_hive();
        let data = patterned(2 * BIG_CHUNK_SIZE + 777);

        let value = hive
            .create_value(StorageKind::Stable, b"big", 3, &data)
            .unwrap();

        assert_eq!(chunk_count(data.len()), 3);
        assert_eq!(hive.read_value_data(value).unwrap(), data);
    }

    #[test]
    fn empty_value_roundtrips() {
        let mut hive = new_hive();

        let value = hive.create_value(StorageKind::Stable, b"empty", 0, &[]).unwrap();

        assert_eq!(hive.read_value_data(value).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rewrite_transitions_between_representations() {
        let mut hive = new_hive();
        let value = hive
            .create_value(StorageKind::Stable, b"morph", 3, &[1, 2])
            .unwrap();

        let normal = patterned(500);
        hive.write_value_data(value, &normal).unwrap();
        assert_eq!(hive.read_value_data(value).unwrap(), normal);

        let big = patterned(BIG_CHUNK_SIZE + 10);
        hive.write_value_data(value, &big).unwrap();
        assert_eq!(hive.read_value_data(value).unwrap(), big);

        hive.write_value_data(value, &[9]).unwrap();
        assert_eq!(hive.read_value_data(value).unwrap(), vec![9]);
    }

    #[test]
    fn big_rewrite_adjusts_chunk_delta() {
        let mut hive = new_hive();
        let initial = patterned(3 * BIG_CHUNK_SIZE);
        let value = hive
            .create_value(StorageKind::Stable, b"grow", 3, &initial)
            .unwrap();

        let grown = patterned(5 * BIG_CHUNK_SIZE - 100);
        hive.write_value_data(value, &grown).unwrap();
        assert_eq!(hive.read_value_data(value).unwrap(), grown);

        let shrunk = patterned(BIG_CHUNK_SIZE + 1);
        hive.write_value_data(value, &shrunk).unwrap();
        assert_eq!(hive.read_value_data(value).unwrap(), shrunk);
    }

    #[test]
    fn delete_value_returns_all_cells() {
        let mut hive = new_hive();
        let data = patterned(2 * BIG_CHUNK_SIZE);
        let value = hive
            .create_value(StorageKind::Stable, b"gone", 3, &data)
            .unwrap();

        hive.delete_value(value).unwrap();

        assert!(!hive.is_cell_allocated(value));
        // the storage is reusable for a same-shaped value
        let again = hive
            .create_value(StorageKind::Stable, b"back", 3, &data)
            .unwrap();
        assert_eq!(hive.read_value_data(again).unwrap(), data);
    }

    #[test]
    fn volatile_values_work_the_same_way() {
        let mut hive = new_hive();
        let data = patterned(300);

        let value = hive
            .create_value(StorageKind::Volatile, b"tmp", 1, &data)
            .unwrap();

        assert_eq!(value.kind(), StorageKind::Volatile);
        assert_eq!(hive.read_value_data(value).unwrap(), data);
        assert_eq!(hive.dirty_block_count(), 0);
    }
}
