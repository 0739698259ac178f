//! # Key Control Block Cache
//!
//! Caches path-to-cell resolutions so repeated lookups skip the tree
//! walk. Entries (KCBs) are refcounted: while referenced they are pinned
//! in the cache; when the last reference drops they are parked on a
//! bounded delayed-close ring instead of being freed, so a quick reopen
//! revives the entry for free. The ring evicts oldest-first once it
//! holds `DELAYED_CLOSE_SIZE` idle entries.
//!
//! The table is bucketed with one mutex per bucket, so traffic on
//! unrelated paths never contends. Lock order is bucket, then ring,
//! then the slab free lists; eviction of a victim from another bucket
//! happens after all of the evicting thread's locks are dropped and
//! re-checks that the victim is still idle.
//!
//! KCBs and delay items come from separate page slabs ([`slab`]). Their
//! lifetimes differ too much to share one: delay items churn with the
//! ring while an idle KCB can sit parked indefinitely.
//!
//! Paths are compared case-insensitively, matching key name ordering.

pub mod slab;

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

use crate::config::{DELAYED_CLOSE_SIZE, KCB_BUCKET_COUNT};
use crate::hive::CellId;
use crate::tree::RemapTable;

pub use slab::{Slab, SlabHandle, SlabStats};

/// A cached resolution of one key path.
#[derive(Debug)]
pub struct Kcb {
    key_cell: CellId,
    /// Uppercased path; the cache identity.
    path: Box<[u8]>,
    refs: u32,
    /// Delay item parked on the close ring while idle.
    parked: Option<SlabHandle>,
}

/// Ring record for an idle KCB awaiting eviction.
struct DelayItem {
    bucket: usize,
    kcb: SlabHandle,
}

pub struct KcbCache {
    buckets: Box<[Mutex<Vec<SlabHandle>>]>,
    ring: Mutex<VecDeque<SlabHandle>>,
    kcbs: Slab<Kcb>,
    delay: Slab<DelayItem>,
}

impl Default for KcbCache {
    fn default() -> Self {
        Self::new(64, 8)
    }
}

impl KcbCache {
    pub fn new(kcb_pages: usize, delay_pages: usize) -> Self {
        let buckets = (0..KCB_BUCKET_COUNT)
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Self {
            buckets,
            ring: Mutex::new(VecDeque::with_capacity(DELAYED_CLOSE_SIZE)),
            kcbs: Slab::new(kcb_pages),
            delay: Slab::new(delay_pages),
        }
    }

    /// Caches `path -> key_cell` and takes a reference. An existing
    /// entry is referenced instead; its cached cell wins.
    pub fn insert(&self, path: &[u8], key_cell: CellId) -> CellId {
        let path = fold_path(path);
        let idx = self.bucket_of(&path);
        let mut bucket = self.buckets[idx].lock();

        if let Some(handle) = self.find(&bucket, &path) {
            return self.reference(handle);
        }

        let handle = self.kcbs.alloc(Kcb {
            key_cell,
            path,
            refs: 1,
            parked: None,
        });
        bucket.push(handle);
        key_cell
    }

    /// Looks up a path and takes a reference, reviving a parked entry.
    pub fn acquire(&self, path: &[u8]) -> Option<CellId> {
        let path = fold_path(path);
        let bucket = self.buckets[self.bucket_of(&path)].lock();
        let handle = self.find(&bucket, &path)?;
        Some(self.reference(handle))
    }

    /// Looks up a path without touching its lifetime.
    pub fn peek(&self, path: &[u8]) -> Option<CellId> {
        let path = fold_path(path);
        let bucket = self.buckets[self.bucket_of(&path)].lock();
        let handle = self.find(&bucket, &path)?;
        self.kcbs.with(handle, |k| k.key_cell)
    }

    /// Drops one reference. The entry parks on the close ring at zero;
    /// an overflowing ring evicts its oldest idle entry.
    pub fn release(&self, path: &[u8]) {
        let path = fold_path(path);
        let idx = self.bucket_of(&path);
        let mut victim = None;

        {
            let bucket = self.buckets[idx].lock();
            let Some(handle) = self.find(&bucket, &path) else {
                return;
            };
            let idle = self.kcbs.with_mut(handle, |k| {
                debug_assert!(k.refs > 0);
                k.refs = k.refs.saturating_sub(1);
                k.refs == 0
            });
            if idle != Some(true) {
                return;
            }

            let item = self.delay.alloc(DelayItem { bucket: idx, kcb: handle });
            self.kcbs.with_mut(handle, |k| k.parked = Some(item));

            let mut ring = self.ring.lock();
            ring.push_back(item);
            if ring.len() > DELAYED_CLOSE_SIZE {
                // revived entries leave stale handles behind; skip them
                while let Some(candidate) = ring.pop_front() {
                    if self.delay.with(candidate, |_| ()).is_some() {
                        victim = Some(candidate);
                        break;
                    }
                }
            }
        }

        if let Some(item) = victim {
            self.evict(item);
        }
    }

    /// Repoints every cached resolution through a relocation table.
    pub fn apply_remap(&self, remap: &RemapTable) {
        for bucket in self.buckets.iter() {
            let bucket = bucket.lock();
            for &handle in bucket.iter() {
                self.kcbs.with_mut(handle, |k| {
                    if let Some(&moved) = remap.get(&k.key_cell) {
                        k.key_cell = moved;
                    }
                });
            }
        }
    }

    /// Entries currently cached, parked ones included.
    pub fn cached(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn kcb_stats(&self) -> SlabStats {
        self.kcbs.stats()
    }

    /// Drops every idle entry immediately, emptying the close ring.
    pub fn flush_idle(&self) {
        let drained: Vec<SlabHandle> = {
            let mut ring = self.ring.lock();
            ring.drain(..).collect()
        };
        for item in drained {
            self.evict(item);
        }
    }

    fn reference(&self, handle: SlabHandle) -> CellId {
        // a parked entry comes back off the ring lazily: freeing the
        // delay item here makes the ring's copy a stale handle
        let (cell, parked) = self
            .kcbs
            .with_mut(handle, |k| {
                k.refs += 1;
                (k.key_cell, k.parked.take())
            })
            .unwrap_or((CellId::NIL, None));
        if let Some(item) = parked {
            self.delay.free(item);
        }
        cell
    }

    fn evict(&self, item: SlabHandle) {
        let Some((idx, kcb)) = self.delay.with(item, |d| (d.bucket, d.kcb)) else {
            return;
        };
        let mut bucket = self.buckets[idx].lock();
        // the entry may have been revived and re-parked since; only this
        // exact parking is ours to clean up
        let ours = self.kcbs.with(kcb, |k| k.refs == 0 && k.parked == Some(item));
        if ours != Some(true) {
            self.delay.free(item);
            return;
        }
        bucket.retain(|&h| h != kcb);
        self.kcbs.free(kcb);
        self.delay.free(item);
    }

    fn find(&self, bucket: &[SlabHandle], path: &[u8]) -> Option<SlabHandle> {
        bucket
            .iter()
            .copied()
            .find(|&h| self.kcbs.with(h, |k| &*k.path == path) == Some(true))
    }

    fn bucket_of(&self, folded: &[u8]) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        folded.hash(&mut hasher);
        (hasher.finish() % KCB_BUCKET_COUNT as u64) as usize
    }
}

fn fold_path(path: &[u8]) -> Box<[u8]> {
    path.iter().map(|b| b.to_ascii_uppercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::StorageKind;

    fn cell(n: u32) -> CellId {
        CellId::new(StorageKind::Stable, n * 8)
    }

    #[test]
    fn insert_acquire_release_roundtrip() {
        let cache = KcbCache::default();

        assert_eq!(cache.insert(b"machine\\system", cell(1)), cell(1));
        assert_eq!(cache.acquire(b"machine\\system"), Some(cell(1)));
        assert_eq!(cache.acquire(b"MACHINE\\SYSTEM"), Some(cell(1)));
        assert_eq!(cache.acquire(b"machine\\software"), None);

        cache.release(b"machine\\system");
        cache.release(b"machine\\system");
        cache.release(b"machine\\system");
        // parked, not gone
        assert_eq!(cache.cached(), 1);
        assert_eq!(cache.peek(b"machine\\system"), Some(cell(1)));
    }

    #[test]
    fn parked_entries_revive_on_acquire() {
        let cache = KcbCache::default();
        cache.insert(b"a\\b", cell(3));
        cache.release(b"a\\b");

        assert_eq!(cache.acquire(b"a\\b"), Some(cell(3)));
        // referenced again; flush of idle entries must not touch it
        cache.flush_idle();
        assert_eq!(cache.peek(b"a\\b"), Some(cell(3)));
    }

    #[test]
    fn ring_overflow_evicts_oldest_idle() {
        let cache = KcbCache::default();
        for i in 0..DELAYED_CLOSE_SIZE as u32 + 40 {
            let path = format!("key{}", i);
            cache.insert(path.as_bytes(), cell(i + 1));
            cache.release(path.as_bytes());
        }

        assert_eq!(cache.cached(), DELAYED_CLOSE_SIZE);
        // the oldest parked entries went first
        assert_eq!(cache.peek(b"key0"), None);
        assert_eq!(cache.peek(b"key39"), None);
        assert!(cache.peek(b"key40").is_some());
    }

    #[test]
    fn flush_idle_drops_only_unreferenced_entries() {
        let cache = KcbCache::default();
        cache.insert(b"held", cell(1));
        cache.insert(b"idle", cell(2));
        cache.release(b"idle");

        cache.flush_idle();

        assert_eq!(cache.peek(b"held"), Some(cell(1)));
        assert_eq!(cache.peek(b"idle"), None);
        assert_eq!(cache.cached(), 1);
    }

    #[test]
    fn remap_repoints_cached_cells() {
        let cache = KcbCache::default();
        cache.insert(b"moved", cell(5));
        cache.insert(b"stays", cell(6));

        let mut remap = RemapTable::new();
        remap.insert(cell(5), cell(50));
        cache.apply_remap(&remap);

        assert_eq!(cache.peek(b"moved"), Some(cell(50)));
        assert_eq!(cache.peek(b"stays"), Some(cell(6)));
    }

    #[test]
    fn concurrent_churn_keeps_slab_conserved() {
        use std::sync::Arc;

        let cache = Arc::new(KcbCache::default());
        let mut threads = Vec::new();
        for t in 0..8u32 {
            let cache = Arc::clone(&cache);
            threads.push(std::thread::spawn(move || {
                for i in 0..200u32 {
                    let path = format!("t{}k{}", t, i % 16);
                    cache.insert(path.as_bytes(), cell(t * 1000 + i));
                    cache.acquire(path.as_bytes());
                    cache.release(path.as_bytes());
                    cache.release(path.as_bytes());
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert!(cache.kcbs.verify());
        assert!(cache.delay.verify());
        assert!(cache.cached() <= 8 * 16);
    }
}
