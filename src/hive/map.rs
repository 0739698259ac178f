//! # Storage Map
//!
//! The storage map translates a logical block number into the bin that
//! covers it. It is a two-level directory: a map *table* holds entries for
//! `MAP_TABLE_SIZE` (512) consecutive blocks, and a *directory* holds up to
//! `MAP_DIRECTORY_SIZE` tables. A freshly created storage class starts with
//! a single inline table (2 MiB of coverage) and is promoted to a full
//! directory the first time it grows past that, mirroring how small hives
//! stay small.
//!
//! Every populated entry records the covering bin's class-relative offset
//! and size plus where the bin's bytes live right now: in a pool buffer
//! (freshly allocated, not yet flushed), reachable through the view cache
//! (stable storage faulted in from the backing file), or discarded (the
//! bin is entirely free and its record lives on the free-bin list).
//!
//! The map grows monotonically as the hive grows and shrinks only when an
//! allocation is unwound or the hive is rebuilt by compaction. Growth is
//! all-or-nothing: [`StorageMap::grow`] either covers the new block range
//! completely or leaves the map exactly as it was.

use eyre::{ensure, Result};

use crate::config::{MAP_DIRECTORY_SIZE, MAP_TABLE_SIZE};

/// Where a bin's bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinBacking {
    /// Index into the storage class's pool-bin list.
    Pool(u32),
    /// Bytes are faulted in through the view cache on demand.
    View,
    /// The bin is entirely free; index into the free-bin list.
    Discarded(u32),
}

/// Map entry for one logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// Class-relative offset of the bin covering this block.
    pub bin_offset: u32,
    /// Size of that bin in bytes.
    pub bin_size: u32,
    pub backing: BinBacking,
}

impl MapEntry {
    pub fn is_discarded(&self) -> bool {
        matches!(self.backing, BinBacking::Discarded(_))
    }
}

enum Directory {
    /// One table, covering the first `MAP_TABLE_SIZE` blocks.
    Inline(Vec<MapEntry>),
    Full(Vec<Vec<MapEntry>>),
}

/// Two-level block-number -> bin translation map for one storage class.
pub struct StorageMap {
    directory: Directory,
    blocks: usize,
}

impl StorageMap {
    pub fn new() -> Self {
        Self {
            directory: Directory::Inline(Vec::new()),
            blocks: 0,
        }
    }

    /// Number of mapped blocks.
    pub fn len(&self) -> usize {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    pub fn get(&self, block: u32) -> Option<&MapEntry> {
        if block as usize >= self.blocks {
            return None;
        }
        let (table, slot) = split(block);
        match &self.directory {
            Directory::Inline(entries) => entries.get(slot),
            Directory::Full(tables) => tables.get(table)?.get(slot),
        }
    }

    pub fn get_mut(&mut self, block: u32) -> Option<&mut MapEntry> {
        if block as usize >= self.blocks {
            return None;
        }
        let (table, slot) = split(block);
        match &mut self.directory {
            Directory::Inline(entries) => entries.get_mut(slot),
            Directory::Full(tables) => tables.get_mut(table)?.get_mut(slot),
        }
    }

    /// Extends the map with `entries` for the blocks following the current
    /// end. Promotes the inline table to a full directory when the new end
    /// crosses the first table boundary. All-or-nothing: on error the map
    /// is unchanged.
    pub fn grow(&mut self, entries: &[MapEntry]) -> Result<()> {
        let new_blocks = self.blocks + entries.len();
        ensure!(
            new_blocks <= MAP_TABLE_SIZE * MAP_DIRECTORY_SIZE,
            "storage map would exceed addressable space: {} blocks",
            new_blocks
        );

        if new_blocks > MAP_TABLE_SIZE {
            self.promote();
        }

        match &mut self.directory {
            Directory::Inline(table) => table.extend_from_slice(entries),
            Directory::Full(tables) => {
                for entry in entries {
                    if tables.last().map_or(true, |t| t.len() == MAP_TABLE_SIZE) {
                        tables.push(Vec::with_capacity(MAP_TABLE_SIZE));
                    }
                    if let Some(table) = tables.last_mut() {
                        table.push(*entry);
                    }
                }
            }
        }

        self.blocks = new_blocks;
        Ok(())
    }

    /// Drops every entry at or past `block_count`; used to unwind a failed
    /// bin allocation.
    pub fn truncate(&mut self, block_count: usize) {
        if block_count >= self.blocks {
            return;
        }

        match &mut self.directory {
            Directory::Inline(table) => table.truncate(block_count),
            Directory::Full(tables) => {
                let keep_tables = block_count.div_ceil(MAP_TABLE_SIZE);
                tables.truncate(keep_tables.max(1));
                let table_count = tables.len();
                if let Some(last) = tables.last_mut() {
                    let last_len = block_count - (table_count - 1) * MAP_TABLE_SIZE;
                    last.truncate(last_len);
                }
            }
        }

        self.blocks = block_count;
    }

    fn promote(&mut self) {
        if let Directory::Inline(table) = &mut self.directory {
            let first = std::mem::take(table);
            self.directory = Directory::Full(vec![first]);
        }
    }
}

impl Default for StorageMap {
    fn default() -> Self {
        Self::new()
    }
}

fn split(block: u32) -> (usize, usize) {
    (
        block as usize / MAP_TABLE_SIZE,
        block as usize % MAP_TABLE_SIZE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(bin_offset: u32) -> MapEntry {
        MapEntry {
            bin_offset,
            bin_size: 4096,
            backing: BinBacking::Pool(0),
        }
    }

    #[test]
    fn empty_map_has_no_entries() {
        let map = StorageMap::new();

        assert_eq!(map.len(), 0);
        assert!(map.get(0).is_none());
    }

    #[test]
    fn grow_and_lookup_within_inline_table() {
        let mut map = StorageMap::new();
        map.grow(&[entry(0), entry(0), entry(8192)]).unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map.get(2).unwrap().bin_offset, 8192);
        assert!(map.get(3).is_none());
    }

    #[test]
    fn growth_past_one_table_promotes_to_directory() {
        let mut map = StorageMap::new();
        let entries: Vec<_> = (0..MAP_TABLE_SIZE as u32 + 10)
            .map(|i| entry(i * 4096))
            .collect();

        map.grow(&entries).unwrap();

        assert_eq!(map.len(), MAP_TABLE_SIZE + 10);
        assert_eq!(
            map.get(MAP_TABLE_SIZE as u32 + 5).unwrap().bin_offset,
            (MAP_TABLE_SIZE as u32 + 5) * 4096
        );
    }

    #[test]
    fn truncate_unwinds_growth() {
        let mut map = StorageMap::new();
        let entries: Vec<_> = (0..600u32).map(|i| entry(i * 4096)).collect();
        map.grow(&entries).unwrap();

        map.truncate(100);

        assert_eq!(map.len(), 100);
        assert!(map.get(100).is_none());
        assert_eq!(map.get(99).unwrap().bin_offset, 99 * 4096);

        // and the map can grow again after the unwind
        map.grow(&[entry(7)]).unwrap();
        assert_eq!(map.get(100).unwrap().bin_offset, 7);
    }

    #[test]
    fn get_mut_updates_entry_in_place() {
        let mut map = StorageMap::new();
        map.grow(&[entry(0)]).unwrap();

        map.get_mut(0).unwrap().backing = BinBacking::Discarded(3);

        assert!(map.get(0).unwrap().is_discarded());
    }
}
